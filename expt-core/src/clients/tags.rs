use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagContentType {
    Categorical,
    Boolean,
    ContinuousNumber,
    FreeText,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagStatus {
    Active,
    Inactive,
    Deprecated,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TagInfo {
    pub tag_key_id: i64,
    pub name: String,
    pub content_type: TagContentType,
    pub status: TagStatus,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait TagService: Send + Sync {
    /// Unknown ids are omitted from the result.
    async fn batch_get_tags(
        &self,
        workspace_id: i64,
        tag_key_ids: Vec<i64>,
    ) -> Result<Vec<TagInfo>, Error>;
}

/// Tags held in memory.
#[derive(Clone, Debug, Default)]
pub struct StaticTagService {
    tags: HashMap<i64, TagInfo>,
}

impl StaticTagService {
    pub fn new(tags: impl IntoIterator<Item = TagInfo>) -> Self {
        Self {
            tags: tags.into_iter().map(|tag| (tag.tag_key_id, tag)).collect(),
        }
    }
}

#[async_trait]
impl TagService for StaticTagService {
    async fn batch_get_tags(
        &self,
        _workspace_id: i64,
        tag_key_ids: Vec<i64>,
    ) -> Result<Vec<TagInfo>, Error> {
        Ok(tag_key_ids
            .iter()
            .filter_map(|id| self.tags.get(id).cloned())
            .collect())
    }
}
