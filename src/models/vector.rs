use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The four fixed vector collections. `episodic` and `semantic` are
/// per-user (row-level security restricts them to the caller's own rows on
/// the server backend); `stoic_wisdom` and `psychoanalysis` are world-readable
/// reference corpora.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorCollection {
    Episodic,
    Semantic,
    StoicWisdom,
    Psychoanalysis,
}

impl VectorCollection {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorCollection::Episodic => "episodic",
            VectorCollection::Semantic => "semantic",
            VectorCollection::StoicWisdom => "stoic_wisdom",
            VectorCollection::Psychoanalysis => "psychoanalysis",
        }
    }

    pub fn all() -> [VectorCollection; 4] {
        [
            VectorCollection::Episodic,
            VectorCollection::Semantic,
            VectorCollection::StoicWisdom,
            VectorCollection::Psychoanalysis,
        ]
    }
}

/// A single stored vector record. `metadata` values are stringly-typed JSON
/// scalars serialized as strings to keep the store's column shape simple
/// across both backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub document: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The result of a `query()` call: parallel arrays, ascending by distance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorQueryResult {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<HashMap<String, String>>,
    pub distances: Vec<f32>,
}

impl VectorQueryResult {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
