//! Engine configuration.
//!
//! The whole document is immutable once loaded. Handlers take a snapshot through
//! [`ConfigHandle::snapshot`] at the start of an invocation and keep it until they return,
//! so a reload never changes settings halfway through a handler.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::observability::LogFormat;

/// Upper bound applied to any configured evaluator concurrency.
pub const MAX_EVALUATOR_CONCURRENCY: usize = 50;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_expt_exec_worker_num")]
    pub expt_exec_worker_num: usize,
    #[serde(default = "default_expt_item_eval_worker_num")]
    pub expt_item_eval_worker_num: usize,
    #[serde(default = "default_expt_aggr_worker_num")]
    pub expt_aggr_worker_num: usize,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub valkey_url: Option<String>,
    #[serde(default)]
    pub expt_exec_conf: ExptExecConf,
    #[serde(default)]
    pub expt_item_eval_conf: ExptItemEvalConf,
    #[serde(default)]
    pub space_expt_exec_conf: HashMap<String, SpaceExptExecConf>,
    #[serde(default)]
    pub err_retry_ctrl: ErrRetryCtrl,
    #[serde(default)]
    pub space_err_retry_ctrl: HashMap<String, SpaceErrRetryCtrl>,
    #[serde(default)]
    pub result_err_converts: Vec<ResultErrConvert>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expt_exec_worker_num: default_expt_exec_worker_num(),
            expt_item_eval_worker_num: default_expt_item_eval_worker_num(),
            expt_aggr_worker_num: default_expt_aggr_worker_num(),
            log_format: LogFormat::default(),
            valkey_url: None,
            expt_exec_conf: ExptExecConf::default(),
            expt_item_eval_conf: ExptItemEvalConf::default(),
            space_expt_exec_conf: HashMap::new(),
            err_retry_ctrl: ErrRetryCtrl::default(),
            space_err_retry_ctrl: HashMap::new(),
            result_err_converts: Vec::new(),
        }
    }
}

fn default_expt_exec_worker_num() -> usize {
    50
}

fn default_expt_item_eval_worker_num() -> usize {
    200
}

fn default_expt_aggr_worker_num() -> usize {
    10
}

/// Scheduler settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExptExecConf {
    #[serde(default = "default_daemon_interval_second")]
    pub daemon_interval_second: u64,
    #[serde(default = "default_expt_zombie_second")]
    pub expt_zombie_second: u64,
    #[serde(default = "default_space_expt_concur_limit")]
    pub space_expt_concur_limit: usize,
}

impl Default for ExptExecConf {
    fn default() -> Self {
        Self {
            daemon_interval_second: default_daemon_interval_second(),
            expt_zombie_second: default_expt_zombie_second(),
            space_expt_concur_limit: default_space_expt_concur_limit(),
        }
    }
}

fn default_daemon_interval_second() -> u64 {
    20
}

fn default_expt_zombie_second() -> u64 {
    86_400
}

fn default_space_expt_concur_limit() -> usize {
    200
}

impl ExptExecConf {
    pub fn daemon_interval(&self) -> Duration {
        Duration::from_secs(self.daemon_interval_second)
    }

    pub fn expt_zombie(&self) -> Duration {
        Duration::from_secs(self.expt_zombie_second)
    }
}

/// Item worker settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExptItemEvalConf {
    #[serde(default = "default_concur_num")]
    pub concur_num: usize,
    /// Delay before an item event is redelivered after a storage or bus failure.
    #[serde(default = "default_interval_second")]
    pub interval_second: u64,
    #[serde(default = "default_zombie_second")]
    pub zombie_second: u64,
    #[serde(default = "default_evaluator_concurrency")]
    pub evaluator_concurrency: usize,
}

impl Default for ExptItemEvalConf {
    fn default() -> Self {
        Self {
            concur_num: default_concur_num(),
            interval_second: default_interval_second(),
            zombie_second: default_zombie_second(),
            evaluator_concurrency: default_evaluator_concurrency(),
        }
    }
}

fn default_concur_num() -> usize {
    3
}

fn default_interval_second() -> u64 {
    20
}

fn default_zombie_second() -> u64 {
    1_200
}

fn default_evaluator_concurrency() -> usize {
    3
}

impl ExptItemEvalConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_second)
    }

    pub fn zombie(&self) -> Duration {
        Duration::from_secs(self.zombie_second)
    }

    /// Evaluator concurrency clamped to `1..=MAX_EVALUATOR_CONCURRENCY`.
    pub fn bounded_evaluator_concurrency(&self) -> usize {
        self.evaluator_concurrency.clamp(1, MAX_EVALUATOR_CONCURRENCY)
    }
}

/// Per-space overlay. A present section replaces the global one for that space.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SpaceExptExecConf {
    #[serde(default)]
    pub expt_exec_conf: Option<ExptExecConf>,
    #[serde(default)]
    pub expt_item_eval_conf: Option<ExptItemEvalConf>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConf {
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    #[serde(default = "default_retry_interval_second")]
    pub retry_interval_second: u64,
    /// Retries configured this way skip the quota deduction.
    #[serde(default)]
    pub is_in_debt: bool,
}

impl Default for RetryConf {
    fn default() -> Self {
        Self {
            retry_times: default_retry_times(),
            retry_interval_second: default_retry_interval_second(),
            is_in_debt: false,
        }
    }
}

fn default_retry_times() -> u32 {
    0
}

fn default_retry_interval_second() -> u64 {
    20
}

impl RetryConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_second)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ErrRetryCtrl {
    #[serde(default)]
    pub retry_conf: RetryConf,
    /// Substring patterns checked in declaration order.
    #[serde(default)]
    pub err_retry_conf: IndexMap<String, RetryConf>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SpaceErrRetryCtrl {
    #[serde(default)]
    pub retry_conf: Option<RetryConf>,
    #[serde(default)]
    pub err_retry_conf: IndexMap<String, RetryConf>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResultErrConvert {
    pub matched_text: String,
    pub to_err_code: i32,
    pub to_err_msg: String,
    #[serde(default)]
    pub as_default: bool,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
        toml::from_str(raw).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse engine config: {e}"),
            })
        })
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read engine config `{}`: {e}", path.display()),
            })
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    pub fn exec_conf(&self, space_id: i64) -> &ExptExecConf {
        self.space_expt_exec_conf
            .get(&space_id.to_string())
            .and_then(|conf| conf.expt_exec_conf.as_ref())
            .unwrap_or(&self.expt_exec_conf)
    }

    pub fn item_eval_conf(&self, space_id: i64) -> &ExptItemEvalConf {
        self.space_expt_exec_conf
            .get(&space_id.to_string())
            .and_then(|conf| conf.expt_item_eval_conf.as_ref())
            .unwrap_or(&self.expt_item_eval_conf)
    }

    pub fn space_err_retry_ctrl(&self, space_id: i64) -> Option<&SpaceErrRetryCtrl> {
        self.space_err_retry_ctrl.get(&space_id.to_string())
    }
}

/// Shared, atomically swappable view of the current [`EngineConfig`].
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<ArcSwap<EngineConfig>>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<EngineConfig> {
        self.current.load_full()
    }

    pub fn replace(&self, config: EngineConfig) {
        self.current.store(Arc::new(config));
    }

    /// Re-reads `path`. On failure the previous snapshot stays active.
    pub fn reload(&self, path: &Path) -> Result<(), Error> {
        let config = EngineConfig::load_from_path(path)?;
        self.replace(config);
        Ok(())
    }
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("current", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.expt_exec_worker_num, 50);
        assert_eq!(config.expt_item_eval_worker_num, 200);
        assert_eq!(config.expt_exec_conf.daemon_interval_second, 20);
        assert_eq!(config.expt_exec_conf.expt_zombie_second, 86_400);
        assert_eq!(config.expt_exec_conf.space_expt_concur_limit, 200);
        assert_eq!(config.expt_item_eval_conf.concur_num, 3);
        assert_eq!(config.expt_item_eval_conf.interval_second, 20);
        assert_eq!(config.expt_item_eval_conf.zombie_second, 1_200);
        assert_eq!(config.expt_item_eval_conf.evaluator_concurrency, 3);
        assert!(config.result_err_converts.is_empty());
    }

    #[test]
    fn test_space_overlay_and_patterns() {
        let config = EngineConfig::from_toml_str(
            r#"
            log_format = "json"

            [expt_item_eval_conf]
            concur_num = 5
            evaluator_concurrency = 500

            [space_expt_exec_conf.7.expt_item_eval_conf]
            concur_num = 1

            [err_retry_ctrl.retry_conf]
            retry_times = 1

            [err_retry_ctrl.err_retry_conf]
            "rate limit" = { retry_times = 5, retry_interval_second = 3 }
            "timeout" = { retry_times = 2, is_in_debt = true }

            [[result_err_converts]]
            matched_text = "rate limit"
            to_err_code = 1001
            to_err_msg = "The model is busy, please retry later"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.item_eval_conf(7).concur_num, 1);
        assert_eq!(config.item_eval_conf(8).concur_num, 5);
        assert_eq!(
            config.item_eval_conf(8).bounded_evaluator_concurrency(),
            MAX_EVALUATOR_CONCURRENCY
        );
        assert_eq!(config.exec_conf(7).daemon_interval_second, 20);

        let patterns: Vec<&str> = config
            .err_retry_ctrl
            .err_retry_conf
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(patterns, vec!["rate limit", "timeout"]);
        assert!(config.err_retry_ctrl.err_retry_conf["timeout"].is_in_debt);
        assert_eq!(
            config.err_retry_ctrl.err_retry_conf["timeout"].retry_interval_second,
            20
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = EngineConfig::from_toml_str("bogus_key = 1").unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
    }

    #[test]
    fn test_reload_swaps_snapshot_and_keeps_old_on_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[expt_item_eval_conf]\nconcur_num = 4").unwrap();

        let handle = ConfigHandle::new(EngineConfig::default());
        let before = handle.snapshot();
        handle.reload(file.path()).unwrap();
        assert_eq!(before.expt_item_eval_conf.concur_num, 3);
        assert_eq!(handle.snapshot().expt_item_eval_conf.concur_num, 4);

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "concur_num = [").unwrap();
        assert!(handle.reload(broken.path()).is_err());
        assert_eq!(handle.snapshot().expt_item_eval_conf.concur_num, 4);
    }
}
