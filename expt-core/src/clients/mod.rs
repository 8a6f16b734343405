//! Interfaces to the services the engine calls but does not own.

mod eval_set;
mod quota;
mod tags;

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::llm::{ChatRequest, Message};
use crate::types::{EvalTargetRecord, EvaluatorInput, EvaluatorRecord, TargetInput};

pub use eval_set::{
    EvalSetService, ItemPage, LIST_ITEMS_PAGE_SIZE, Pagination, StaticEvalSetService,
    list_all_items,
};
#[cfg(test)]
pub use eval_set::MockEvalSetService;
pub use quota::{AllowAllQuota, EvalBenefitRequest, EvalBenefitResult, QuotaService, WhichIsEnough};
#[cfg(test)]
pub use quota::MockQuotaService;
pub use tags::{StaticTagService, TagContentType, TagInfo, TagService, TagStatus};
#[cfg(test)]
pub use tags::MockTagService;

#[derive(Clone, Debug, Default)]
pub struct ExecuteTargetRequest {
    pub space_id: i64,
    pub target_id: i64,
    pub target_version_id: i64,
    pub experiment_run_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub input: TargetInput,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait TargetService: Send + Sync {
    /// Runs the system under evaluation on one turn.
    async fn execute(&self, request: ExecuteTargetRequest) -> Result<EvalTargetRecord, Error>;
}

#[derive(Clone, Debug, Default)]
pub struct RunEvaluatorRequest {
    pub space_id: i64,
    pub experiment_id: i64,
    pub experiment_run_id: i64,
    pub evaluator_version_id: i64,
    pub item_id: i64,
    pub turn_id: i64,
    pub target_record_id: i64,
    pub input: EvaluatorInput,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait EvaluatorService: Send + Sync {
    async fn run(&self, request: RunEvaluatorRequest) -> Result<EvaluatorRecord, Error>;
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait LlmGateway: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<Message, Error>;

    /// Streams message chunks; callers merge them with [`crate::llm::merge_stream_msgs`].
    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<Message, Error>>, Error>;
}
