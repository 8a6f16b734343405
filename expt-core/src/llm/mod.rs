//! LLM message types and the built-in LLM-backed target and evaluator runners.

mod judge;
mod runtime_param;
mod stream;
mod target;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

pub use judge::{JudgeConf, LlmJudgeRunner};
pub use runtime_param::{ModelConfig, PromptRuntimeParam};
pub use stream::merge_stream_msgs;
pub use target::{PromptTargetConf, PromptTargetExecutor};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Unknown,
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ToolCall {
    /// Empty on continuation chunks of a streamed call.
    pub id: String,
    #[serde(default)]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reasoning_content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: serde_json::Value,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

/// Request accepted by [`crate::clients::LlmGateway`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: Option<i32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    /// Applies runtime overrides on top of the statically configured model settings.
    pub fn with_runtime_param(mut self, param: &PromptRuntimeParam) -> Self {
        if let Some(model) = &param.model_config {
            if !model.model_id.is_empty() {
                self.model_id.clone_from(&model.model_id);
            }
            if model.temperature.is_some() {
                self.temperature = model.temperature;
            }
            if model.max_tokens.is_some() {
                self.max_tokens = model.max_tokens;
            }
            if model.top_p.is_some() {
                self.top_p = model.top_p;
            }
        }
        self
    }
}

/// Target output field holding the model reply.
pub const ACTUAL_OUTPUT_FIELD: &str = "actual_output";

pub(crate) fn render_template(template: &str, ctx: impl Serialize) -> Result<String, Error> {
    let env = minijinja::Environment::new();
    env.render_str(template, ctx).map_err(|e| {
        Error::new(ErrorDetails::Template {
            message: e.to_string(),
        })
    })
}

pub(crate) fn timeout_error(model_id: &str, timeout: Duration) -> Error {
    Error::new(ErrorDetails::LlmGateway {
        model_id: model_id.to_string(),
        biz_code: 0,
        message: format!("request timed out after {}ms", timeout.as_millis()),
        affect_stability: false,
    })
}
