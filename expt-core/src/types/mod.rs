//! Entities persisted and exchanged by the engine.

pub mod aggr;
pub mod eval_set;
pub mod experiment;
pub mod item;
pub mod records;
pub mod run;
pub mod run_log;
pub mod stats;
pub mod turn;

pub use aggr::{AggregateData, AggregatorResult, AggregatorType, ExptAggrResult, FieldType, ScoreBucket};
pub use eval_set::{Content, ContentType, EvalSetItem, FieldData, Image, Turn};
pub use experiment::{
    EvaluationConfiguration, EvaluatorConf, EvaluatorIngressConf, EvaluatorRef, Experiment,
    ExptStatus, ExptType, FieldAdapter, FieldConf, SourceType, TargetConf, TargetIngressConf,
};
pub use item::{ExptEvalItem, ItemRunState};
pub use records::{
    Correction, EvalTargetRecord, EvaluatorInput, EvaluatorOutput, EvaluatorRecord,
    EvaluatorRunStatus, RecordError, TargetInput, TargetOutput, TargetRunStatus,
};
pub use run::{ExptRun, RunMode};
pub use run_log::{ExptItemResultRunLog, ExptTurnResultRunLog, ResultState};
pub use stats::{ExptStats, StatsDelta};
pub use turn::{ExptTurnResult, TurnRunState};
