use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{
    ACTUAL_OUTPUT_FIELD, ChatRequest, Message, PromptRuntimeParam, merge_stream_msgs,
    render_template, timeout_error,
};
use crate::clients::{ExecuteTargetRequest, LlmGateway, TargetService};
use crate::error::{Error, ErrorDetails};
use crate::types::{Content, EvalTargetRecord, TargetOutput, TargetRunStatus};
use crate::utils::id::new_log_id;

/// A prompt under evaluation: a user template rendered against the turn's fields.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PromptTargetConf {
    pub model_id: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub user_template: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    /// Serialized [`PromptRuntimeParam`] applied on top of the fields above.
    #[serde(default)]
    pub runtime_param: Option<String>,
}

fn default_timeout_ms() -> u64 {
    60_000
}

/// [`TargetService`] backed by an LLM gateway, keyed by target version id.
pub struct PromptTargetExecutor {
    gateway: Arc<dyn LlmGateway>,
    targets: HashMap<i64, PromptTargetConf>,
}

impl PromptTargetExecutor {
    pub fn new(gateway: Arc<dyn LlmGateway>, targets: HashMap<i64, PromptTargetConf>) -> Self {
        Self { gateway, targets }
    }

    async fn call(&self, request: ChatRequest, stream: bool) -> Result<Message, Error> {
        if !stream {
            return self.gateway.chat(request).await;
        }
        let mut chunks = Vec::new();
        let mut stream = self.gateway.chat_stream(request).await?;
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk?);
        }
        merge_stream_msgs(chunks).ok_or_else(|| {
            Error::new(ErrorDetails::LlmStream {
                message: "stream ended without any chunk".to_string(),
            })
        })
    }
}

#[async_trait]
impl TargetService for PromptTargetExecutor {
    #[instrument(skip_all, fields(target_version_id = request.target_version_id, item_id = request.item_id, turn_id = request.turn_id))]
    async fn execute(&self, request: ExecuteTargetRequest) -> Result<EvalTargetRecord, Error> {
        let conf = self.targets.get(&request.target_version_id).ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!(
                    "No prompt configured for target version {}",
                    request.target_version_id
                ),
            })
        })?;

        let vars: BTreeMap<&str, String> = request
            .input
            .fields
            .iter()
            .map(|(name, content)| (name.as_str(), content.as_text()))
            .collect();
        let user = render_template(&conf.user_template, &vars)?;

        let mut messages = Vec::with_capacity(request.input.history.len() + 2);
        if let Some(system) = &conf.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(request.input.history.iter().cloned());
        messages.push(Message::user(user));

        let runtime_param =
            PromptRuntimeParam::parse_from_json(conf.runtime_param.as_deref().unwrap_or_default())?;
        let timeout = Duration::from_millis(conf.timeout_ms);
        let chat = ChatRequest {
            model_id: conf.model_id.clone(),
            messages,
            temperature: conf.temperature,
            max_tokens: conf.max_tokens,
            timeout: Some(timeout),
            ..Default::default()
        }
        .with_runtime_param(&runtime_param);
        let model_id = chat.model_id.clone();

        debug!(model_id = %model_id, stream = conf.stream, "Calling target model");
        let started = Instant::now();
        let reply = tokio::time::timeout(timeout, self.call(chat, conf.stream))
            .await
            .map_err(|_| timeout_error(&model_id, timeout))??;
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let mut output_fields = BTreeMap::new();
        output_fields.insert(ACTUAL_OUTPUT_FIELD.to_string(), Content::text(reply.content));
        Ok(EvalTargetRecord {
            id: 0,
            space_id: request.space_id,
            target_id: request.target_id,
            target_version_id: request.target_version_id,
            experiment_run_id: request.experiment_run_id,
            item_id: request.item_id,
            turn_id: request.turn_id,
            log_id: new_log_id(),
            input: request.input,
            output: TargetOutput {
                output_fields,
                usage: reply.usage.unwrap_or_default(),
                time_consuming_ms: elapsed_ms,
                error: None,
            },
            status: TargetRunStatus::Success,
            created_at: Some(chrono::Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::clients::MockLlmGateway;
    use crate::llm::{Role, TokenUsage};
    use crate::types::TargetInput;

    fn conf(stream: bool) -> PromptTargetConf {
        PromptTargetConf {
            model_id: "base-model".to_string(),
            system_prompt: Some("Be brief.".to_string()),
            user_template: "Q: {{ question }}".to_string(),
            stream,
            timeout_ms: 1_000,
            temperature: Some(0.1),
            max_tokens: None,
            runtime_param: Some(r#"{"model_config":{"model_id":"override-model"}}"#.to_string()),
        }
    }

    fn request() -> ExecuteTargetRequest {
        let mut fields = BTreeMap::new();
        fields.insert("question".to_string(), Content::text("2+2?"));
        ExecuteTargetRequest {
            space_id: 1,
            target_id: 2,
            target_version_id: 3,
            experiment_run_id: 4,
            item_id: 5,
            turn_id: 6,
            input: TargetInput {
                fields,
                history: vec![Message::user("hi"), Message::assistant("hello")],
                ext: BTreeMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_renders_prompt_and_records_reply() {
        let mut gateway = MockLlmGateway::new();
        gateway.expect_chat().times(1).returning(|request| {
            assert_eq!(request.model_id, "override-model");
            assert_eq!(request.temperature, Some(0.1));
            assert_eq!(request.messages.len(), 4);
            assert_eq!(request.messages[0].role, Role::System);
            assert_eq!(request.messages[3].content, "Q: 2+2?");
            Box::pin(async move {
                Ok(Message {
                    role: Role::Assistant,
                    content: "4".to_string(),
                    usage: Some(TokenUsage {
                        input_tokens: 7,
                        output_tokens: 1,
                        total_tokens: 8,
                    }),
                    ..Default::default()
                })
            })
        });

        let executor =
            PromptTargetExecutor::new(Arc::new(gateway), HashMap::from([(3, conf(false))]));
        let record = executor.execute(request()).await.unwrap();
        assert_eq!(record.status, TargetRunStatus::Success);
        assert_eq!(
            record.output.output_fields[ACTUAL_OUTPUT_FIELD].as_text(),
            "4"
        );
        assert_eq!(record.output.usage.total_tokens, 8);
        assert_eq!(record.item_id, 5);
    }

    #[tokio::test]
    async fn test_streaming_reply_is_merged() {
        let mut gateway = MockLlmGateway::new();
        gateway.expect_chat_stream().times(1).returning(|_| {
            let chunks = vec![Ok(Message::assistant("fo")), Ok(Message::assistant("ur"))];
            Box::pin(async move { Ok(stream::iter(chunks).boxed()) })
        });
        let executor =
            PromptTargetExecutor::new(Arc::new(gateway), HashMap::from([(3, conf(true))]));
        let record = executor.execute(request()).await.unwrap();
        assert_eq!(
            record.output.output_fields[ACTUAL_OUTPUT_FIELD].as_text(),
            "four"
        );
    }

    #[tokio::test]
    async fn test_unknown_target_version() {
        let executor = PromptTargetExecutor::new(Arc::new(MockLlmGateway::new()), HashMap::new());
        let err = executor.execute(request()).await.unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::InvalidRequest { .. }));
        assert!(!err.is_retryable());
    }
}
