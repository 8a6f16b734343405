//! Persisted form of errors recorded in run logs and entity `err_msg` columns.
//!
//! The blob is `{code, msg, cause}` where `cause` is either empty or another blob of the
//! same schema. Older rows stored a whole blob inside `msg`; those are unwrapped on read.

use serde::{Deserialize, Serialize};

use super::{DenyReason, Error, ErrorDetails, codes};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RunLogErr {
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub cause: String,
}

/// Serializes an error into the run-log blob.
pub fn serialize_err(err: &Error) -> String {
    let blob = to_run_log_err(err.get_details());
    // `RunLogErr` only holds an integer and strings, so this cannot fail
    serde_json::to_string(&blob).unwrap_or_default()
}

fn to_run_log_err(details: &ErrorDetails) -> RunLogErr {
    let (msg, cause) = match details {
        ErrorDetails::MQRetry { message, cause }
        | ErrorDetails::TargetResult { message, cause }
        | ErrorDetails::TurnOther { message, cause }
        | ErrorDetails::Persisted { message, cause, .. } => (message.clone(), cause.as_ref()),
        ErrorDetails::EvaluatorResult {
            evaluator_version_id,
            message,
            cause,
        } => (
            format!("{EVALUATOR_PREFIX}{evaluator_version_id}{EVALUATOR_SEPARATOR}{message}"),
            cause.as_ref(),
        ),
        other => (other.to_string(), None),
    };
    RunLogErr {
        code: details.code(),
        msg,
        cause: cause.map(serialize_err).unwrap_or_default(),
    }
}

const EVALUATOR_PREFIX: &str = "evaluator_version_id=";
const EVALUATOR_SEPARATOR: &str = ";";

/// Reads a run-log blob back into an error. Never fails: text that is not a blob
/// becomes a `TurnOther` carrying the text.
pub fn deserialize_err(raw: &str) -> Error {
    match serde_json::from_str::<RunLogErr>(raw) {
        Ok(blob) => Error::new_without_logging(from_run_log_err(blob)),
        Err(_) => Error::new_without_logging(ErrorDetails::TurnOther {
            message: raw.to_string(),
            cause: None,
        }),
    }
}

fn from_run_log_err(blob: RunLogErr) -> ErrorDetails {
    // Legacy rows nested the whole blob inside `msg`
    if let Ok(inner) = serde_json::from_str::<RunLogErr>(&blob.msg) {
        return from_run_log_err(inner);
    }

    let cause = if blob.cause.is_empty() {
        None
    } else {
        Some(deserialize_err(&blob.cause))
    };
    let message = blob.msg;
    match blob.code {
        codes::MQ_RETRY => ErrorDetails::MQRetry { message, cause },
        codes::TARGET_RESULT => ErrorDetails::TargetResult { message, cause },
        codes::TURN_OTHER => ErrorDetails::TurnOther { message, cause },
        codes::EVALUATOR_RESULT => match parse_evaluator_msg(&message) {
            Some((evaluator_version_id, message)) => ErrorDetails::EvaluatorResult {
                evaluator_version_id,
                message,
                cause,
            },
            None => ErrorDetails::Persisted {
                code: blob.code,
                message,
                cause,
            },
        },
        code => match DenyReason::from_code(code) {
            Some(reason) if cause.is_none() && message == quota_message(reason) => {
                ErrorDetails::QuotaDenied { reason }
            }
            _ => ErrorDetails::Persisted {
                code,
                message,
                cause,
            },
        },
    }
}

fn quota_message(reason: DenyReason) -> String {
    ErrorDetails::QuotaDenied { reason }.to_string()
}

fn parse_evaluator_msg(msg: &str) -> Option<(i64, String)> {
    let rest = msg.strip_prefix(EVALUATOR_PREFIX)?;
    let (id, message) = rest.split_once(EVALUATOR_SEPARATOR)?;
    Some((id.parse().ok()?, message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(err: &Error) {
        let serialized = serialize_err(err);
        let back = deserialize_err(&serialized);
        assert_eq!(serialize_err(&back), serialized, "round trip of {err}");
    }

    #[test]
    fn test_engine_errors_round_trip() {
        let gateway = Error::new(ErrorDetails::LlmGateway {
            model_id: "gpt".to_string(),
            biz_code: 0,
            message: "timeout".to_string(),
            affect_stability: true,
        });
        let errors = vec![
            Error::new(ErrorDetails::MQRetry {
                message: "bus unavailable".to_string(),
                cause: None,
            }),
            Error::new(ErrorDetails::TargetResult {
                message: "target exploded".to_string(),
                cause: Some(gateway.clone()),
            }),
            Error::new(ErrorDetails::EvaluatorResult {
                evaluator_version_id: 42,
                message: "judge returned prose".to_string(),
                cause: None,
            }),
            Error::new(ErrorDetails::TurnOther {
                message: "could not persist turn".to_string(),
                cause: Some(Error::new(ErrorDetails::TurnOther {
                    message: "nested".to_string(),
                    cause: None,
                })),
            }),
            Error::new(ErrorDetails::QuotaDenied {
                reason: DenyReason::Expired,
            }),
            gateway,
        ];
        for err in &errors {
            round_trip(err);
        }
    }

    #[test]
    fn test_rehydrated_variants() {
        let err = Error::new(ErrorDetails::EvaluatorResult {
            evaluator_version_id: 9,
            message: "bad output".to_string(),
            cause: None,
        });
        let back = deserialize_err(&serialize_err(&err));
        assert_eq!(back.get_details(), err.get_details());

        let quota = Error::new(ErrorDetails::QuotaDenied {
            reason: DenyReason::Overdraft,
        });
        let back = deserialize_err(&serialize_err(&quota));
        assert!(matches!(
            back.get_details(),
            ErrorDetails::QuotaDenied {
                reason: DenyReason::Overdraft
            }
        ));
        assert!(!back.is_retryable());
    }

    #[test]
    fn test_retryability_survives_round_trip() {
        let permanent = Error::new(ErrorDetails::TargetResult {
            message: "bad output".to_string(),
            cause: Some(Error::new(ErrorDetails::OutputParsing {
                message: "no json".to_string(),
            })),
        });
        assert!(!deserialize_err(&serialize_err(&permanent)).is_retryable());

        let transient = Error::new(ErrorDetails::TargetResult {
            message: "upstream".to_string(),
            cause: Some(Error::new(ErrorDetails::LlmGateway {
                model_id: "m".to_string(),
                biz_code: 0,
                message: "overloaded".to_string(),
                affect_stability: false,
            })),
        });
        assert!(deserialize_err(&serialize_err(&transient)).is_retryable());
    }

    #[test]
    fn test_unknown_code_is_persisted() {
        let back = deserialize_err(r#"{"code":123,"msg":"something odd","cause":""}"#);
        assert_eq!(
            back.get_details(),
            &ErrorDetails::Persisted {
                code: 123,
                message: "something odd".to_string(),
                cause: None,
            }
        );
        assert_eq!(back.code(), 123);
    }

    #[test]
    fn test_legacy_nested_msg_is_unwrapped() {
        let inner = r#"{"code":601204002,"msg":"target down","cause":""}"#;
        let outer = serde_json::to_string(&RunLogErr {
            code: 1,
            msg: inner.to_string(),
            cause: String::new(),
        })
        .unwrap();
        let back = deserialize_err(&outer);
        assert!(matches!(
            back.get_details(),
            ErrorDetails::TargetResult { message, cause: None } if message == "target down"
        ));
    }

    #[test]
    fn test_plain_text_becomes_turn_other() {
        let back = deserialize_err("connection reset by peer");
        assert!(matches!(
            back.get_details(),
            ErrorDetails::TurnOther { message, .. } if message == "connection reset by peer"
        ));
    }
}
