use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{ChatRequest, Message, render_template, timeout_error};
use crate::clients::{EvaluatorService, LlmGateway, RunEvaluatorRequest};
use crate::error::{Error, ErrorDetails};
use crate::types::{EvaluatorOutput, EvaluatorRecord, EvaluatorRunStatus};
use crate::utils::id::new_log_id;

/// An LLM-graded rubric. The template sees every input and target output field by name.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeConf {
    pub model_id: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub prompt_template: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub temperature: Option<f64>,
}

fn default_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize)]
struct Verdict {
    score: f64,
    #[serde(default, alias = "reasoning")]
    reason: String,
}

/// [`EvaluatorService`] that asks a judge model for a `{"score", "reason"}` object.
pub struct LlmJudgeRunner {
    gateway: Arc<dyn LlmGateway>,
    judges: HashMap<i64, JudgeConf>,
}

impl LlmJudgeRunner {
    pub fn new(gateway: Arc<dyn LlmGateway>, judges: HashMap<i64, JudgeConf>) -> Self {
        Self { gateway, judges }
    }
}

/// Extracts the outermost JSON object from a reply, tolerating prose or code fences around it.
fn parse_verdict(reply: &str) -> Result<Verdict, Error> {
    let parse_error = |message: String| Error::new(ErrorDetails::OutputParsing { message });
    let start = reply
        .find('{')
        .ok_or_else(|| parse_error(format!("no JSON object in judge reply: {reply}")))?;
    let end = reply
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| parse_error(format!("unterminated JSON object in judge reply: {reply}")))?;
    serde_json::from_str(&reply[start..=end])
        .map_err(|e| parse_error(format!("invalid judge verdict: {e}")))
}

#[async_trait]
impl EvaluatorService for LlmJudgeRunner {
    #[instrument(skip_all, fields(evaluator_version_id = request.evaluator_version_id, item_id = request.item_id, turn_id = request.turn_id))]
    async fn run(&self, request: RunEvaluatorRequest) -> Result<EvaluatorRecord, Error> {
        let judge = self.judges.get(&request.evaluator_version_id).ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!(
                    "No judge configured for evaluator version {}",
                    request.evaluator_version_id
                ),
            })
        })?;

        let mut vars: BTreeMap<&str, String> = BTreeMap::new();
        for (name, content) in &request.input.input_fields {
            vars.insert(name.as_str(), content.as_text());
        }
        for (name, content) in &request.input.evaluate_target_output_fields {
            vars.insert(name.as_str(), content.as_text());
        }
        let prompt = render_template(&judge.prompt_template, &vars)?;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &judge.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(prompt));

        let timeout = Duration::from_millis(judge.timeout_ms);
        let chat = ChatRequest {
            model_id: judge.model_id.clone(),
            messages,
            temperature: judge.temperature,
            timeout: Some(timeout),
            ..Default::default()
        };
        let reply = tokio::time::timeout(timeout, self.gateway.chat(chat))
            .await
            .map_err(|_| timeout_error(&judge.model_id, timeout))??;
        let verdict = parse_verdict(&reply.content)?;
        debug!(score = verdict.score, "Judge produced a verdict");

        let now = chrono::Utc::now();
        Ok(EvaluatorRecord {
            id: 0,
            space_id: request.space_id,
            experiment_id: request.experiment_id,
            experiment_run_id: request.experiment_run_id,
            item_id: request.item_id,
            turn_id: request.turn_id,
            evaluator_version_id: request.evaluator_version_id,
            target_record_id: request.target_record_id,
            log_id: new_log_id(),
            input: request.input,
            output: EvaluatorOutput {
                score: Some(verdict.score),
                reasoning: verdict.reason,
                usage: reply.usage.unwrap_or_default(),
                error: None,
            },
            correction: None,
            status: EvaluatorRunStatus::Success,
            created_at: Some(now),
            updated_at: Some(now),
        })
    }
}
