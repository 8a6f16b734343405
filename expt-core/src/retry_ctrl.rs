//! Per-error retry policy and user-facing error conversion.

use crate::config::{EngineConfig, ResultErrConvert, RetryConf};
use crate::error::Error;

/// Looks up the [`RetryConf`] for an error by substring match on its message.
///
/// Space patterns are checked before global ones, each in declaration order. When nothing
/// matches, the space default applies if one is set, otherwise the global default.
pub struct ErrRetryController<'a> {
    config: &'a EngineConfig,
}

impl<'a> ErrRetryController<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn get_retry_conf(&self, space_id: i64, err: &Error) -> RetryConf {
        let message = err.to_string();
        let space = self.config.space_err_retry_ctrl(space_id);
        let space_patterns = space.into_iter().flat_map(|ctrl| ctrl.err_retry_conf.iter());
        let global_patterns = self.config.err_retry_ctrl.err_retry_conf.iter();
        if let Some((_, conf)) = space_patterns
            .chain(global_patterns)
            .find(|(pattern, _)| message.contains(pattern.as_str()))
        {
            return *conf;
        }
        space
            .and_then(|ctrl| ctrl.retry_conf)
            .unwrap_or(self.config.err_retry_ctrl.retry_conf)
    }

    /// Whether an attempt that already used `retry_times` retries may be retried again.
    pub fn should_retry(&self, space_id: i64, err: &Error, retry_times: u32) -> Option<RetryConf> {
        if !err.is_retryable() {
            return None;
        }
        let conf = self.get_retry_conf(space_id, err);
        (retry_times < conf.retry_times).then_some(conf)
    }
}

/// Rewrites raw error messages into the text users see.
pub struct ResultErrConverter<'a> {
    converts: &'a [ResultErrConvert],
}

impl<'a> ResultErrConverter<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            converts: &config.result_err_converts,
        }
    }

    /// The first matching non-default entry wins; the default entry applies only when no
    /// other entry matched.
    pub fn convert(&self, err_msg: &str) -> Option<&'a ResultErrConvert> {
        self.converts
            .iter()
            .find(|convert| !convert.as_default && err_msg.contains(&convert.matched_text))
            .or_else(|| self.converts.iter().find(|convert| convert.as_default))
    }

    /// Message shown to users for a turn or item error.
    pub fn user_message(&self, err: &Error) -> String {
        let raw = err.to_string();
        match self.convert(&raw) {
            Some(convert) => convert.to_err_msg.clone(),
            None => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::config::{ErrRetryCtrl, SpaceErrRetryCtrl};
    use crate::error::{DenyReason, ErrorDetails};

    fn conf(retry_times: u32) -> RetryConf {
        RetryConf {
            retry_times,
            ..Default::default()
        }
    }

    fn gateway_err(message: &str) -> Error {
        Error::new(ErrorDetails::LlmGateway {
            model_id: "m".to_string(),
            biz_code: 0,
            message: message.to_string(),
            affect_stability: false,
        })
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig {
            err_retry_ctrl: ErrRetryCtrl {
                retry_conf: conf(1),
                err_retry_conf: IndexMap::from([
                    ("rate limit".to_string(), conf(5)),
                    ("limit".to_string(), conf(2)),
                ]),
            },
            ..Default::default()
        };
        config.space_err_retry_ctrl.insert(
            "9".to_string(),
            SpaceErrRetryCtrl {
                retry_conf: Some(conf(0)),
                err_retry_conf: IndexMap::from([("timeout".to_string(), conf(7))]),
            },
        );
        config
    }

    #[test]
    fn test_lookup_order() {
        let config = config();
        let ctrl = ErrRetryController::new(&config);
        assert_eq!(ctrl.get_retry_conf(1, &gateway_err("rate limit hit")).retry_times, 5);
        assert_eq!(ctrl.get_retry_conf(1, &gateway_err("limit hit")).retry_times, 2);
        assert_eq!(ctrl.get_retry_conf(1, &gateway_err("boom")).retry_times, 1);
        assert_eq!(ctrl.get_retry_conf(9, &gateway_err("timeout")).retry_times, 7);
        assert_eq!(ctrl.get_retry_conf(9, &gateway_err("rate limit")).retry_times, 5);
        assert_eq!(ctrl.get_retry_conf(9, &gateway_err("boom")).retry_times, 0);
    }

    #[test]
    fn test_should_retry_respects_budget_and_kind() {
        let config = config();
        let ctrl = ErrRetryController::new(&config);
        assert!(ctrl.should_retry(1, &gateway_err("limit"), 1).is_some());
        assert!(ctrl.should_retry(1, &gateway_err("limit"), 2).is_none());
        let quota = Error::new(ErrorDetails::QuotaDenied {
            reason: DenyReason::Insufficient,
        });
        assert!(ctrl.should_retry(1, &quota, 0).is_none());
    }

    #[test]
    fn test_convert_prefers_specific_match() {
        let config = EngineConfig {
            result_err_converts: vec![
                ResultErrConvert {
                    matched_text: String::new(),
                    to_err_code: 1,
                    to_err_msg: "Something went wrong".to_string(),
                    as_default: true,
                },
                ResultErrConvert {
                    matched_text: "AccountOverdraftCode".to_string(),
                    to_err_code: 2,
                    to_err_msg: "Your account is overdrawn (AccountOverdraftCode)".to_string(),
                    as_default: false,
                },
            ],
            ..Default::default()
        };
        let converter = ResultErrConverter::new(&config);
        let overdraft = Error::new(ErrorDetails::QuotaDenied {
            reason: DenyReason::Overdraft,
        });
        assert_eq!(
            converter.user_message(&overdraft),
            "Your account is overdrawn (AccountOverdraftCode)"
        );
        assert_eq!(converter.convert("unrelated").map(|c| c.to_err_code), Some(1));

        let empty = EngineConfig::default();
        let converter = ResultErrConverter::new(&empty);
        assert!(converter.convert("anything").is_none());
        assert!(converter.user_message(&overdraft).contains("AccountOverdraftCode"));
    }
}
