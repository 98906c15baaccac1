//! The adversarial consensus protocol: two models independently generate,
//! then independently cross-review each other's output, iterating until a
//! run of consecutive mutual approvals is reached or rounds run out.
//! Grounded on `aegean_consensus.py`; the round-accumulation shape and
//! brace-balanced JSON extraction are adapted from the teacher's
//! `deliberation.rs`/`synthesis.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::error::AppResult;
use crate::llm::{GenerateParams, LlmClient};
use crate::models::{ConcernSeverity, ConsensusResult, ConsensusRound, ReviewConcern, ReviewResult};

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub beta_threshold: u32,
    pub max_rounds: u32,
    pub model_a: String,
    pub model_b: String,
    pub use_model_a_on_failure: bool,
    pub temperature_generate: f64,
    pub temperature_review: f64,
    pub log_dir: Option<PathBuf>,
}

impl ConsensusConfig {
    pub fn new(model_a: impl Into<String>, model_b: impl Into<String>, beta_threshold: u32) -> Self {
        Self {
            beta_threshold,
            max_rounds: beta_threshold.max(1),
            model_a: model_a.into(),
            model_b: model_b.into(),
            use_model_a_on_failure: true,
            temperature_generate: 0.7,
            temperature_review: 0.3,
            log_dir: None,
        }
    }
}

pub struct ConsensusProtocol<'a> {
    llm: &'a LlmClient,
    config: ConsensusConfig,
}

/// Extracts the largest brace-balanced `{...}` substring in `text` and parses
/// it as JSON, falling back to a synthesized not-approved review on any
/// failure. Unlike the teacher's `extract_json_block` (fence-then-naive
/// find-first/find-last-brace), this walks brace depth so a nested object
/// inside the reasoning text can't truncate the match early.
pub fn extract_review(text: &str) -> ReviewResult {
    match largest_brace_balanced_substring(text) {
        Some(candidate) => match serde_json::from_str::<ReviewResult>(candidate) {
            Ok(review) => review,
            Err(_) => ReviewResult::unparseable(text),
        },
        None => ReviewResult::unparseable(text),
    }
}

fn largest_brace_balanced_substring(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut stack: Vec<usize> = Vec::new();

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' => stack.push(i),
            b'}' => {
                if let Some(start) = stack.pop() {
                    if stack.is_empty() {
                        let len = i - start + 1;
                        let better = match best {
                            Some((bstart, bend)) => len > bend - bstart + 1,
                            None => true,
                        };
                        if better {
                            best = Some((start, i));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(start, end)| &text[start..=end])
}

impl<'a> ConsensusProtocol<'a> {
    pub fn new(llm: &'a LlmClient, config: ConsensusConfig) -> Self {
        Self { llm, config }
    }

    /// Runs the full loop for `prompt_name` with `vars` bindings substituted
    /// into `template`, checking `critical_constructs` against the final
    /// round's concerns.
    pub async fn reach_consensus(
        &self,
        prompt_name: &str,
        template: &str,
        mut vars: HashMap<String, String>,
        critical_constructs: &[String],
        source_data: &str,
    ) -> AppResult<ConsensusResult> {
        let mut rounds: Vec<ConsensusRound> = Vec::new();
        let mut consecutive_approvals: u32 = 0;
        let mut reached = false;

        for round_number in 1..=self.config.max_rounds {
            let prompt = render_template(template, &vars);

            let (out_a, out_b) = tokio::try_join!(
                self.generate(&self.config.model_a, &prompt),
                self.generate(&self.config.model_b, &prompt)
            )?;

            let review_a_prompt = build_review_prompt(&out_b, critical_constructs, source_data);
            let review_b_prompt = build_review_prompt(&out_a, critical_constructs, source_data);

            let (rev_a_of_b_raw, rev_b_of_a_raw) = tokio::try_join!(
                self.review(&self.config.model_a, &review_a_prompt),
                self.review(&self.config.model_b, &review_b_prompt)
            )?;

            let review_a_of_b = extract_review(&rev_a_of_b_raw);
            let review_b_of_a = extract_review(&rev_b_of_a_raw);

            let approve_a = review_b_of_a.approved;
            let approve_b = review_a_of_b.approved;

            if approve_a && approve_b {
                consecutive_approvals += 1;
            } else {
                consecutive_approvals = 0;
            }

            let round_reached = consecutive_approvals >= self.config.beta_threshold;
            if round_reached {
                reached = true;
            }

            rounds.push(ConsensusRound {
                round_number,
                output_a: out_a.clone(),
                output_b: out_b.clone(),
                review_a_of_b: review_a_of_b.clone(),
                review_b_of_a: review_b_of_a.clone(),
                reached: round_reached,
                timestamp: Utc::now(),
            });

            if reached {
                break;
            }

            if round_number < self.config.max_rounds {
                let feedback = format!(
                    "{}\n{}",
                    review_a_of_b.reasoning, review_b_of_a.reasoning
                );
                vars.insert("previous_feedback".to_string(), feedback);
            }
        }

        let last = rounds.last().expect("at least one round always runs");
        let final_output = if reached {
            merge_outputs(last)
        } else if self.config.use_model_a_on_failure {
            last.output_a.clone()
        } else {
            format!(
                "## Model A output\n{}\n\n## Model B output\n{}\n\n## Manual Review Required",
                last.output_a, last.output_b
            )
        };

        let stability_score = stability_score(&rounds);
        let critical_flags = critical_flags(last, critical_constructs);

        let result = ConsensusResult {
            final_output,
            reached,
            rounds,
            model_a: self.config.model_a.clone(),
            model_b: self.config.model_b.clone(),
            stability_score,
            critical_flags,
            metadata: HashMap::new(),
            extras: HashMap::new(),
        };

        self.log(prompt_name, &result).await;
        Ok(result)
    }

    async fn generate(&self, model: &str, prompt: &str) -> AppResult<String> {
        let params = GenerateParams::new(prompt, "", model).with_temperature(self.config.temperature_generate);
        let out = self.llm.generate(params).await?;
        Ok(out.text)
    }

    async fn review(&self, model: &str, prompt: &str) -> AppResult<String> {
        let params = GenerateParams::new(prompt, "", model)
            .with_temperature(self.config.temperature_review)
            .with_json_mode(true);
        let out = self.llm.generate(params).await?;
        Ok(out.text)
    }

    async fn log(&self, prompt_name: &str, result: &ConsensusResult) {
        let Some(dir) = &self.config.log_dir else {
            return;
        };
        if let Err(e) = write_log(dir, prompt_name, result).await {
            tracing::warn!(error = %e, "failed to write consensus log, continuing");
        }
    }
}

#[derive(Serialize)]
struct ConsensusLogEntry<'a> {
    log_id: String,
    timestamp: chrono::DateTime<Utc>,
    reached: bool,
    rounds: usize,
    model_a: &'a str,
    model_b: &'a str,
    stability_score: f64,
    critical_flags: &'a [String],
    metadata: &'a HashMap<String, String>,
}

async fn write_log(dir: &Path, prompt_name: &str, result: &ConsensusResult) -> AppResult<()> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        crate::error::AppError::internal(format!("creating consensus log dir: {e}"))
    })?;
    let now = Utc::now();
    let key = format!("{prompt_name}_{}", now.format("%Y%m%d_%H%M%S"));
    let entry = ConsensusLogEntry {
        log_id: key.clone(),
        timestamp: now,
        reached: result.reached,
        rounds: result.rounds.len(),
        model_a: &result.model_a,
        model_b: &result.model_b,
        stability_score: result.stability_score,
        critical_flags: &result.critical_flags,
        metadata: &result.metadata,
    };
    let path = dir.join(format!("{key}.json"));
    let body = serde_json::to_vec_pretty(&entry)?;
    tokio::fs::write(path, body).await.map_err(|e| {
        crate::error::AppError::internal(format!("writing consensus log: {e}"))
    })?;
    Ok(())
}

/// Ties go to A: the merge picks the output whose REVIEWER produced the
/// longer strengths list, defaulting to A's output on a tie.
fn merge_outputs(round: &ConsensusRound) -> String {
    if round.review_a_of_b.strengths.len() > round.review_b_of_a.strengths.len() {
        round.output_b.clone()
    } else {
        round.output_a.clone()
    }
}

fn stability_score(rounds: &[ConsensusRound]) -> f64 {
    if rounds.is_empty() {
        return 0.0;
    }
    let reached_count = rounds.iter().filter(|r| r.reached).count();
    reached_count as f64 / rounds.len() as f64
}

fn critical_flags(last_round: &ConsensusRound, critical_constructs: &[String]) -> Vec<String> {
    let mut flags = Vec::new();
    for construct in critical_constructs {
        let needle = construct.to_lowercase();
        let hit = last_round
            .review_a_of_b
            .concerns
            .iter()
            .chain(last_round.review_b_of_a.concerns.iter())
            .any(|c| c.issue.to_lowercase().contains(&needle));
        if hit {
            flags.push(format!("Critical disagreement: {construct}"));
        }
    }
    flags
}

fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{k}}}"), v);
    }
    out
}

/// The JSON structure every reviewer is instructed to produce.
pub fn build_review_prompt(output_under_review: &str, critical_constructs: &[String], source_data: &str) -> String {
    let constructs = if critical_constructs.is_empty() {
        "none specified".to_string()
    } else {
        critical_constructs.join(", ")
    };
    format!(
        "You are reviewing the following output for correctness and faithfulness to the source data.\n\n\
         Source data:\n{source_data}\n\n\
         Output under review:\n{output_under_review}\n\n\
         Pay special attention to these critical constructs: {constructs}.\n\n\
         Respond with a JSON object of the exact shape:\n\
         {{\"approved\": bool, \"strengths\": [string], \"concerns\": [{{\"issue\": string, \"severity\": \"minor\"|\"moderate\"|\"critical\"}}], \"reasoning\": string}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::error::AppResult as Result_;
    use crate::llm::{GenerateOutput, LlmProvider};

    struct ScriptedProvider {
        responses: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).rev().collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate_once(&self, _params: &GenerateParams) -> Result_<GenerateOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "{}".to_string());
            Ok(GenerateOutput {
                text,
                input_tokens: None,
                output_tokens: None,
            })
        }
    }

    #[test]
    fn brace_balanced_extraction_handles_nested_objects() {
        let text = "noise before {\"approved\": true, \"nested\": {\"a\": 1}, \"strengths\": [\"x\"], \"concerns\": [], \"reasoning\": \"ok\"} trailing noise";
        let review = extract_review(text);
        assert!(review.approved);
        assert_eq!(review.strengths, vec!["x".to_string()]);
    }

    #[test]
    fn unparseable_text_becomes_not_approved() {
        let review = extract_review("not json at all");
        assert!(!review.approved);
        assert_eq!(review.reasoning, "not json at all");
        assert!(review.concerns.is_empty());
    }

    #[test]
    fn stability_score_is_one_when_all_reached() {
        let round = |reached: bool| ConsensusRound {
            round_number: 1,
            output_a: String::new(),
            output_b: String::new(),
            review_a_of_b: ReviewResult::unparseable(""),
            review_b_of_a: ReviewResult::unparseable(""),
            reached,
            timestamp: Utc::now(),
        };
        assert_eq!(stability_score(&[round(true), round(true)]), 1.0);
        assert_eq!(stability_score(&[round(false), round(false)]), 0.0);
        assert_eq!(stability_score(&[]), 0.0);
    }

    #[test]
    fn merge_ties_toward_a() {
        let round = ConsensusRound {
            round_number: 1,
            output_a: "A".to_string(),
            output_b: "B".to_string(),
            review_a_of_b: ReviewResult {
                approved: true,
                strengths: vec!["s1".to_string()],
                concerns: vec![],
                reasoning: String::new(),
            },
            review_b_of_a: ReviewResult {
                approved: true,
                strengths: vec!["s1".to_string()],
                concerns: vec![],
                reasoning: String::new(),
            },
            reached: true,
            timestamp: Utc::now(),
        };
        assert_eq!(merge_outputs(&round), "A");
    }

    #[test]
    fn critical_flags_detect_case_insensitive_substring() {
        let round = ConsensusRound {
            round_number: 1,
            output_a: String::new(),
            output_b: String::new(),
            review_a_of_b: ReviewResult {
                approved: false,
                strengths: vec![],
                concerns: vec![ReviewConcern {
                    issue: "Violates the SAFETY boundary".to_string(),
                    severity: ConcernSeverity::Critical,
                }],
                reasoning: String::new(),
            },
            review_b_of_a: ReviewResult::unparseable(""),
            reached: false,
            timestamp: Utc::now(),
        };
        let flags = critical_flags(&round, &["safety boundary".to_string()]);
        assert_eq!(flags, vec!["Critical disagreement: safety boundary".to_string()]);
    }

    #[tokio::test]
    async fn beta_one_unanimous_approve_reaches_after_one_round() {
        let provider_a = ScriptedProvider::new(vec![
            "Out A round 1",
            "{\"approved\": true, \"strengths\": [\"good\"], \"concerns\": [], \"reasoning\": \"fine\"}",
        ]);
        let provider_b = ScriptedProvider::new(vec![
            "Out B round 1",
            "{\"approved\": true, \"strengths\": [\"good\"], \"concerns\": [], \"reasoning\": \"fine\"}",
        ]);

        let llm = crate::llm::LlmClient::for_test(provider_a, provider_b);
        let config = ConsensusConfig::new("model-a", "claude-model-b", 1);
        let protocol = ConsensusProtocol::new(&llm, config);
        let result = protocol
            .reach_consensus("test_prompt", "do the thing", HashMap::new(), &[], "source")
            .await
            .unwrap();

        assert!(result.reached);
        assert_eq!(result.rounds.len(), 1);
    }

    #[tokio::test]
    async fn beta_one_unanimous_disapprove_falls_back_to_model_a() {
        let provider_a = ScriptedProvider::new(vec![
            "Out A round 1",
            "{\"approved\": false, \"strengths\": [], \"concerns\": [], \"reasoning\": \"nope\"}",
        ]);
        let provider_b = ScriptedProvider::new(vec![
            "Out B round 1",
            "{\"approved\": false, \"strengths\": [], \"concerns\": [], \"reasoning\": \"nope\"}",
        ]);

        let llm = crate::llm::LlmClient::for_test(provider_a, provider_b);
        let mut config = ConsensusConfig::new("model-a", "claude-model-b", 1);
        config.max_rounds = 1;
        config.use_model_a_on_failure = true;
        let protocol = ConsensusProtocol::new(&llm, config);
        let result = protocol
            .reach_consensus("test_prompt", "do the thing", HashMap::new(), &[], "source")
            .await
            .unwrap();

        assert!(!result.reached);
        assert_eq!(result.final_output, "Out A round 1");
    }
}
