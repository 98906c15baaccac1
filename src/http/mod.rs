//! The illustrative HTTP surface: a thin axum layer over the orchestrator and
//! stores. Not core to the runtime — any caller can drive
//! [`crate::orchestrator::Orchestrator`] directly. Grounded on the teacher's
//! `api/http/router.rs` composition style, adapted to axum's current
//! `{param}` path-parameter syntax.

mod handlers;
mod router;

pub use router::{build_router, AppState};
