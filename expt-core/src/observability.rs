//! Logging and metric registration for the engine.
//!
//! * `setup_observability` installs the global `tracing` subscriber.
//! * `describe_metrics` registers descriptions for the counters the engine emits. The engine
//!   only talks to the `metrics` facade; installing a recorder/exporter is left to the host.
//! * `init_observability` does both from the engine config, once per process.

use metrics::{Unit, describe_counter};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::EngineConfig;
use crate::error::{Error, ErrorDetails};

pub const ITEM_EVAL_TOTAL: &str = "expt_item_eval_total";
pub const TURN_ERRORS_TOTAL: &str = "expt_turn_errors_total";
pub const FINISHED_TOTAL: &str = "expt_finished_total";
pub const AGGR_CONFLICTS_TOTAL: &str = "expt_aggr_conflicts_total";

const DEFAULT_DIRECTIVES: &str = "warn,expt_core=info";

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn build_env_filter() -> Result<EnvFilter, Error> {
    let env_var_name = "RUST_LOG";
    if std::env::var(env_var_name).is_ok() {
        EnvFilter::builder()
            .with_env_var(env_var_name)
            .from_env()
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Invalid `{env_var_name}` environment variable: {e}"),
                })
            })
    } else {
        EnvFilter::builder().parse(DEFAULT_DIRECTIVES).map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("Failed to parse default log directives: {e}"),
            })
        })
    }
}

/// Registers the global subscriber. Fails if one is already installed.
pub fn setup_observability(log_format: LogFormat) -> Result<(), Error> {
    let filter = build_env_filter()?;
    let log_layer = match log_format {
        LogFormat::Pretty => {
            Box::new(tracing_subscriber::fmt::layer()) as Box<dyn Layer<_> + Send + Sync>
        }
        LogFormat::Json => Box::new(tracing_subscriber::fmt::layer().json()),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(filter))
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to install tracing subscriber: {e}"),
            })
        })
}

/// Installs logging in the configured `log_format` and describes the engine's metrics.
/// Call before installing the metrics recorder's exporter so the descriptions are exported.
pub fn init_observability(config: &EngineConfig) -> Result<(), Error> {
    setup_observability(config.log_format)?;
    describe_metrics();
    Ok(())
}

pub fn describe_metrics() {
    describe_counter!(
        ITEM_EVAL_TOTAL,
        Unit::Count,
        "Items finalized by the item evaluation worker, labelled by status",
    );
    describe_counter!(
        TURN_ERRORS_TOTAL,
        Unit::Count,
        "Turn-level errors, labelled by kind and whether they affect stability",
    );
    describe_counter!(
        FINISHED_TOTAL,
        Unit::Count,
        "Experiments that reached a terminal status",
    );
    describe_counter!(
        AGGR_CONFLICTS_TOTAL,
        Unit::Count,
        "Aggregate result writes dropped after exhausting version conflicts",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        assert!(EnvFilter::builder().parse(DEFAULT_DIRECTIVES).is_ok());
    }

    #[test]
    fn test_init_observability_installs_once() {
        let config = EngineConfig {
            log_format: LogFormat::Json,
            ..Default::default()
        };
        init_observability(&config).unwrap();
        let err = init_observability(&config).unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::Observability { .. }
        ));
    }

    #[test]
    fn test_log_format_deserializes() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
