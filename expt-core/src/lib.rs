//! Experiment evaluation engine.
//!
//! An experiment binds an eval-set version, a target and a set of evaluators. Runs of an
//! experiment are driven by events: the scheduler ticks once per live run and dispatches
//! items, item workers run the target and evaluators turn by turn, and the aggregator keeps
//! per-evaluator score summaries current. [`Engine`] wires the handlers to an event bus;
//! [`ExptManager`] is the entry point for callers.
#![cfg_attr(test, expect(clippy::unwrap_used, clippy::panic))]

pub mod aggregator;
pub mod clients;
pub mod config;
pub mod consumer;
pub mod correction;
pub mod engine;
pub mod error;
pub mod events;
pub mod idem;
pub mod item_eval;
pub mod llm;
pub mod manage;
pub mod observability;
pub mod repo;
pub mod retry_ctrl;
pub mod scheduler;
pub mod state;
pub mod types;
pub mod utils;

pub use config::{ConfigHandle, EngineConfig};
pub use engine::{Engine, EngineDeps};
pub use error::{Error, ErrorDetails};
pub use events::{EngineEvent, EventPublisher, InMemoryEventBus, Topic};
pub use manage::{CreateExperimentRequest, ExptManager};
