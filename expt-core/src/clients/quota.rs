use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::{DenyReason, Error};

/// Which product line's benefit covered the evaluation. Passed through untouched.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct WhichIsEnough(pub i32);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvalBenefitRequest {
    pub connector_uid: String,
    pub space_id: i64,
    pub experiment_id: i64,
    pub ext: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvalBenefitResult {
    pub deny_reason: Option<DenyReason>,
    pub is_free_evaluate: Option<bool>,
    pub which_is_enough: Option<WhichIsEnough>,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait QuotaService: Send + Sync {
    async fn check_and_deduct_eval_benefit(
        &self,
        request: EvalBenefitRequest,
    ) -> Result<EvalBenefitResult, Error>;
}

/// Quota backend that admits everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllQuota;

#[async_trait]
impl QuotaService for AllowAllQuota {
    async fn check_and_deduct_eval_benefit(
        &self,
        _request: EvalBenefitRequest,
    ) -> Result<EvalBenefitResult, Error> {
        Ok(EvalBenefitResult::default())
    }
}
