use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod run_log;

pub use run_log::{RunLogErr, deserialize_err, serialize_err};

pub const IMPOSSIBLE_ERROR_MESSAGE: &str =
    "This should never happen, please file a bug report against the experiment engine";

/// Numeric codes carried by every error, persisted in run logs and returned to callers.
pub mod codes {
    pub const MQ_RETRY: i32 = 601_204_001;
    pub const TARGET_RESULT: i32 = 601_204_002;
    pub const EVALUATOR_RESULT: i32 = 601_204_003;
    pub const TURN_OTHER: i32 = 601_204_004;

    pub const ACCOUNT_INSUFFICIENT: i32 = 601_205_001;
    pub const ACCOUNT_EXPIRED: i32 = 601_205_002;
    pub const ACCOUNT_OVERDRAFT: i32 = 601_205_003;

    pub const ADMISSION_DENIED: i32 = 601_206_001;
    pub const INVALID_EVALUATION_CONFIG: i32 = 601_206_002;
    pub const ILLEGAL_STATUS_TRANSITION: i32 = 601_206_003;
    pub const CONCURRENT_MODIFICATION: i32 = 601_206_004;

    pub const NOT_FOUND: i32 = 601_207_001;
    pub const INVALID_REQUEST: i32 = 601_207_002;

    pub const LLM_GATEWAY: i32 = 601_208_001;
    pub const LLM_STREAM: i32 = 601_208_002;
    pub const OUTPUT_PARSING: i32 = 601_208_003;
    pub const TEMPLATE: i32 = 601_208_004;

    pub const INTERNAL: i32 = 601_209_999;

    /// Codes whose failures do not go away on retry.
    pub fn is_permanent(code: i32) -> bool {
        matches!(
            code,
            ACCOUNT_INSUFFICIENT
                | ACCOUNT_EXPIRED
                | ACCOUNT_OVERDRAFT
                | ADMISSION_DENIED
                | INVALID_EVALUATION_CONFIG
                | ILLEGAL_STATUS_TRANSITION
                | NOT_FOUND
                | INVALID_REQUEST
                | OUTPUT_PARSING
                | TEMPLATE
        )
    }
}

/// Extra key under which the "affects stability" flag is surfaced to callers.
pub const BIZ_ERR_AFFECT_STABILITY: &str = "biz_err_affect_stability";

/// Capability implemented by errors that surface a business status to RPC callers.
pub trait BizStatus {
    fn biz_status_code(&self) -> i32;
    fn biz_extra(&self) -> HashMap<String, String>;
}

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
#[error(transparent)]
// The member stays private so that every construction goes through `new` and gets logged.
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    /// Used when rehydrating errors that were already logged when they first happened.
    pub(crate) fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Arc::new(details))
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        self.0.log_at_level(prefix, level);
    }

    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }

    pub fn code(&self) -> i32 {
        self.0.code()
    }

    pub fn affect_stability(&self) -> bool {
        self.0.affect_stability()
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        self.0.kind()
    }
}

impl BizStatus for Error {
    fn biz_status_code(&self) -> i32 {
        self.code()
    }

    fn biz_extra(&self) -> HashMap<String, String> {
        let mut extra = HashMap::new();
        if self.affect_stability() {
            extra.insert(BIZ_ERR_AFFECT_STABILITY.to_string(), "1".to_string());
        }
        extra
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::new(ErrorDetails::ValkeyQuery {
            message: err.to_string(),
        })
    }
}

/// Reason a quota check refused to let an evaluation proceed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Insufficient,
    Expired,
    Overdraft,
}

impl DenyReason {
    pub fn code(self) -> i32 {
        match self {
            DenyReason::Insufficient => codes::ACCOUNT_INSUFFICIENT,
            DenyReason::Expired => codes::ACCOUNT_EXPIRED,
            DenyReason::Overdraft => codes::ACCOUNT_OVERDRAFT,
        }
    }

    pub fn code_name(self) -> &'static str {
        match self {
            DenyReason::Insufficient => "AccountInsufficientCode",
            DenyReason::Expired => "AccountExpiredCode",
            DenyReason::Overdraft => "AccountOverdraftCode",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            codes::ACCOUNT_INSUFFICIENT => Some(DenyReason::Insufficient),
            codes::ACCOUNT_EXPIRED => Some(DenyReason::Expired),
            codes::ACCOUNT_OVERDRAFT => Some(DenyReason::Overdraft),
            _ => None,
        }
    }
}

impl Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code_name())
    }
}

#[derive(Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    /// Transient failure; the event is re-published with the configured delay.
    MQRetry {
        message: String,
        cause: Option<Error>,
    },
    TargetResult {
        message: String,
        cause: Option<Error>,
    },
    EvaluatorResult {
        evaluator_version_id: i64,
        message: String,
        cause: Option<Error>,
    },
    TurnOther {
        message: String,
        cause: Option<Error>,
    },
    AdmissionDenied {
        message: String,
    },
    QuotaDenied {
        reason: DenyReason,
    },
    Config {
        message: String,
    },
    InvalidEvaluationConfig {
        message: String,
    },
    ExperimentNotFound {
        experiment_id: i64,
    },
    RunNotFound {
        experiment_id: i64,
        run_id: i64,
    },
    EvalSetItemNotFound {
        item_id: i64,
    },
    EvaluatorRecordNotFound {
        record_id: i64,
    },
    Repository {
        message: String,
    },
    ConcurrentModification {
        message: String,
    },
    IllegalStatusTransition {
        from: String,
        to: String,
    },
    ValkeyConnection {
        message: String,
    },
    ValkeyQuery {
        message: String,
    },
    MessageBus {
        message: String,
    },
    LlmGateway {
        model_id: String,
        biz_code: i32,
        message: String,
        affect_stability: bool,
    },
    LlmStream {
        message: String,
    },
    OutputParsing {
        message: String,
    },
    Template {
        message: String,
    },
    Serialization {
        message: String,
    },
    Observability {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    InternalError {
        message: String,
    },
    /// An error read back from a run log whose code has no local variant.
    Persisted {
        code: i32,
        message: String,
        cause: Option<Error>,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::MQRetry { .. } => tracing::Level::WARN,
            ErrorDetails::TargetResult { .. } => tracing::Level::WARN,
            ErrorDetails::EvaluatorResult { .. } => tracing::Level::WARN,
            ErrorDetails::TurnOther { .. } => tracing::Level::WARN,
            ErrorDetails::AdmissionDenied { .. } => tracing::Level::INFO,
            ErrorDetails::QuotaDenied { .. } => tracing::Level::INFO,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidEvaluationConfig { .. } => tracing::Level::WARN,
            ErrorDetails::ExperimentNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::RunNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::EvalSetItemNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::EvaluatorRecordNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Repository { .. } => tracing::Level::ERROR,
            ErrorDetails::ConcurrentModification { .. } => tracing::Level::DEBUG,
            ErrorDetails::IllegalStatusTransition { .. } => tracing::Level::WARN,
            ErrorDetails::ValkeyConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::ValkeyQuery { .. } => tracing::Level::ERROR,
            ErrorDetails::MessageBus { .. } => tracing::Level::ERROR,
            ErrorDetails::LlmGateway { .. } => tracing::Level::WARN,
            ErrorDetails::LlmStream { .. } => tracing::Level::WARN,
            ErrorDetails::OutputParsing { .. } => tracing::Level::WARN,
            ErrorDetails::Template { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::Persisted { .. } => tracing::Level::DEBUG,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ErrorDetails::MQRetry { .. } => codes::MQ_RETRY,
            ErrorDetails::TargetResult { .. } => codes::TARGET_RESULT,
            ErrorDetails::EvaluatorResult { .. } => codes::EVALUATOR_RESULT,
            ErrorDetails::TurnOther { .. } => codes::TURN_OTHER,
            ErrorDetails::AdmissionDenied { .. } => codes::ADMISSION_DENIED,
            ErrorDetails::QuotaDenied { reason } => reason.code(),
            ErrorDetails::Config { .. } | ErrorDetails::InvalidEvaluationConfig { .. } => {
                codes::INVALID_EVALUATION_CONFIG
            }
            ErrorDetails::ExperimentNotFound { .. }
            | ErrorDetails::RunNotFound { .. }
            | ErrorDetails::EvalSetItemNotFound { .. }
            | ErrorDetails::EvaluatorRecordNotFound { .. } => codes::NOT_FOUND,
            ErrorDetails::ConcurrentModification { .. } => codes::CONCURRENT_MODIFICATION,
            ErrorDetails::IllegalStatusTransition { .. } => codes::ILLEGAL_STATUS_TRANSITION,
            ErrorDetails::LlmGateway { biz_code, .. } => {
                if *biz_code != 0 {
                    *biz_code
                } else {
                    codes::LLM_GATEWAY
                }
            }
            ErrorDetails::LlmStream { .. } => codes::LLM_STREAM,
            ErrorDetails::OutputParsing { .. } => codes::OUTPUT_PARSING,
            ErrorDetails::Template { .. } => codes::TEMPLATE,
            ErrorDetails::InvalidRequest { .. } => codes::INVALID_REQUEST,
            ErrorDetails::Persisted { code, .. } => *code,
            ErrorDetails::Repository { .. }
            | ErrorDetails::ValkeyConnection { .. }
            | ErrorDetails::ValkeyQuery { .. }
            | ErrorDetails::MessageBus { .. }
            | ErrorDetails::Serialization { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::InternalError { .. } => codes::INTERNAL,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ErrorDetails::MQRetry { .. } => "mq_retry",
            ErrorDetails::TargetResult { .. } => "target_result",
            ErrorDetails::EvaluatorResult { .. } => "evaluator_result",
            ErrorDetails::TurnOther { .. } => "turn_other",
            ErrorDetails::AdmissionDenied { .. } => "admission_denied",
            ErrorDetails::QuotaDenied { .. } => "quota_denied",
            ErrorDetails::LlmGateway { .. } | ErrorDetails::LlmStream { .. } => "llm",
            _ => "other",
        }
    }

    /// Whether this error should be counted against the stability SLO.
    /// Wrapping errors inherit the flag from their cause.
    fn affect_stability(&self) -> bool {
        match self {
            ErrorDetails::LlmGateway {
                affect_stability, ..
            } => *affect_stability,
            ErrorDetails::MQRetry { cause, .. }
            | ErrorDetails::TargetResult { cause, .. }
            | ErrorDetails::EvaluatorResult { cause, .. }
            | ErrorDetails::TurnOther { cause, .. }
            | ErrorDetails::Persisted { cause, .. } => {
                cause.as_ref().is_some_and(Error::affect_stability)
            }
            ErrorDetails::Repository { .. }
            | ErrorDetails::ValkeyConnection { .. }
            | ErrorDetails::ValkeyQuery { .. }
            | ErrorDetails::MessageBus { .. }
            | ErrorDetails::InternalError { .. } => true,
            _ => false,
        }
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        match level {
            tracing::Level::ERROR => tracing::error!("{prefix}{self}"),
            tracing::Level::WARN => tracing::warn!("{prefix}{self}"),
            tracing::Level::INFO => tracing::info!("{prefix}{self}"),
            tracing::Level::DEBUG => tracing::debug!("{prefix}{self}"),
            tracing::Level::TRACE => tracing::trace!("{prefix}{self}"),
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        self.log_at_level("", self.level());
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::AdmissionDenied { .. }
            | ErrorDetails::QuotaDenied { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::InvalidEvaluationConfig { .. }
            | ErrorDetails::ExperimentNotFound { .. }
            | ErrorDetails::RunNotFound { .. }
            | ErrorDetails::EvalSetItemNotFound { .. }
            | ErrorDetails::EvaluatorRecordNotFound { .. }
            | ErrorDetails::IllegalStatusTransition { .. }
            | ErrorDetails::OutputParsing { .. }
            | ErrorDetails::Template { .. }
            | ErrorDetails::Serialization { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::InvalidRequest { .. } => false,
            // A wrapped error is retryable only if what it wraps is
            ErrorDetails::TargetResult { cause, .. }
            | ErrorDetails::EvaluatorResult { cause, .. }
            | ErrorDetails::TurnOther { cause, .. } => {
                cause.as_ref().is_none_or(Error::is_retryable)
            }
            ErrorDetails::Persisted { code, cause, .. } => match cause {
                Some(cause) => cause.is_retryable(),
                None => !codes::is_permanent(*code),
            },
            _ => true,
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::MQRetry { message, .. } => {
                write!(f, "Transient failure, event will be redelivered: {message}")
            }
            ErrorDetails::TargetResult { message, .. } => {
                write!(f, "Evaluation target failed: {message}")
            }
            ErrorDetails::EvaluatorResult {
                evaluator_version_id,
                message,
                ..
            } => {
                write!(
                    f,
                    "Evaluator version {evaluator_version_id} failed: {message}"
                )
            }
            ErrorDetails::TurnOther { message, .. } => {
                write!(f, "Turn evaluation failed: {message}")
            }
            ErrorDetails::AdmissionDenied { message } => {
                write!(f, "Experiment admission denied: {message}")
            }
            ErrorDetails::QuotaDenied { reason } => {
                write!(f, "Evaluation quota check denied: {}", reason.code_name())
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InvalidEvaluationConfig { message } => {
                write!(f, "Invalid evaluation configuration: {message}")
            }
            ErrorDetails::ExperimentNotFound { experiment_id } => {
                write!(f, "Experiment {experiment_id} not found")
            }
            ErrorDetails::RunNotFound {
                experiment_id,
                run_id,
            } => {
                write!(f, "Run {run_id} of experiment {experiment_id} not found")
            }
            ErrorDetails::EvalSetItemNotFound { item_id } => {
                write!(f, "Evaluation set item {item_id} not found")
            }
            ErrorDetails::EvaluatorRecordNotFound { record_id } => {
                write!(f, "Evaluator record {record_id} not found")
            }
            ErrorDetails::Repository { message } => write!(f, "Repository error: {message}"),
            ErrorDetails::ConcurrentModification { message } => {
                write!(f, "Concurrent modification: {message}")
            }
            ErrorDetails::IllegalStatusTransition { from, to } => {
                write!(f, "Illegal experiment status transition from {from} to {to}")
            }
            ErrorDetails::ValkeyConnection { message } => {
                write!(f, "Valkey connection error: {message}")
            }
            ErrorDetails::ValkeyQuery { message } => write!(f, "Valkey query error: {message}"),
            ErrorDetails::MessageBus { message } => write!(f, "Message bus error: {message}"),
            ErrorDetails::LlmGateway {
                model_id,
                biz_code,
                message,
                ..
            } => {
                write!(
                    f,
                    "LLM gateway error for model `{model_id}` (code {biz_code}): {message}"
                )
            }
            ErrorDetails::LlmStream { message } => write!(f, "LLM stream error: {message}"),
            ErrorDetails::OutputParsing { message } => {
                write!(f, "Failed to parse model output: {message}")
            }
            ErrorDetails::Template { message } => write!(f, "Template error: {message}"),
            ErrorDetails::Serialization { message } => {
                write!(f, "Serialization error: {message}")
            }
            ErrorDetails::Observability { message } => {
                write!(f, "Observability setup error: {message}")
            }
            ErrorDetails::InvalidRequest { message } => write!(f, "Invalid request: {message}"),
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}. {IMPOSSIBLE_ERROR_MESSAGE}")
            }
            ErrorDetails::Persisted { message, .. } => write!(f, "{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_denied_surfaces_code_name() {
        let err = Error::new(ErrorDetails::QuotaDenied {
            reason: DenyReason::Overdraft,
        });
        assert_eq!(err.code(), 601_205_003);
        assert!(err.to_string().contains("AccountOverdraftCode"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_wrapped_errors_inherit_retryability_and_stability() {
        let gateway = Error::new(ErrorDetails::LlmGateway {
            model_id: "judge".to_string(),
            biz_code: 0,
            message: "upstream overloaded".to_string(),
            affect_stability: true,
        });
        let wrapped = Error::new(ErrorDetails::TargetResult {
            message: gateway.to_string(),
            cause: Some(gateway),
        });
        assert!(wrapped.is_retryable());
        assert!(wrapped.affect_stability());
        assert_eq!(
            wrapped.biz_extra().get(BIZ_ERR_AFFECT_STABILITY),
            Some(&"1".to_string())
        );

        let parsing = Error::new(ErrorDetails::OutputParsing {
            message: "no json".to_string(),
        });
        let wrapped = Error::new(ErrorDetails::EvaluatorResult {
            evaluator_version_id: 7,
            message: parsing.to_string(),
            cause: Some(parsing),
        });
        assert!(!wrapped.is_retryable());
        assert!(wrapped.biz_extra().is_empty());
    }

    #[test]
    fn test_gateway_biz_code_passthrough() {
        let err = Error::new(ErrorDetails::LlmGateway {
            model_id: "m".to_string(),
            biz_code: 4_242,
            message: "rate limited".to_string(),
            affect_stability: false,
        });
        assert_eq!(err.biz_status_code(), 4_242);
    }
}
