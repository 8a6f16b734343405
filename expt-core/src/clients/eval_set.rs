use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::RwLock;

use crate::error::{Error, ErrorDetails};
use crate::types::EvalSetItem;

pub const LIST_ITEMS_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pagination {
    /// Opaque cursor returned by the previous page.
    pub page_token: Option<String>,
    pub page_size: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ItemPage {
    pub items: Vec<EvalSetItem>,
    pub next_page_token: Option<String>,
    pub total: i64,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait EvalSetService: Send + Sync {
    async fn get_items(
        &self,
        space_id: i64,
        eval_set_id: i64,
        version_id: i64,
        item_ids: Vec<i64>,
    ) -> Result<Vec<EvalSetItem>, Error>;

    async fn list_items(
        &self,
        space_id: i64,
        eval_set_id: i64,
        version_id: i64,
        page: Pagination,
    ) -> Result<ItemPage, Error>;
}

/// Reads every item of a version by following page tokens.
pub async fn list_all_items(
    service: &dyn EvalSetService,
    space_id: i64,
    eval_set_id: i64,
    version_id: i64,
) -> Result<Vec<EvalSetItem>, Error> {
    let mut items = Vec::new();
    let mut page_token = None;
    loop {
        let page = service
            .list_items(
                space_id,
                eval_set_id,
                version_id,
                Pagination {
                    page_token,
                    page_size: LIST_ITEMS_PAGE_SIZE,
                },
            )
            .await?;
        items.extend(page.items);
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }
    Ok(items)
}

/// Eval sets held in memory, keyed by `(eval_set_id, version_id)`.
#[derive(Clone, Default)]
pub struct StaticEvalSetService {
    versions: Arc<RwLock<HashMap<(i64, i64), Vec<EvalSetItem>>>>,
}

impl StaticEvalSetService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Service holding a single eval-set version.
    pub fn with_items(eval_set_id: i64, version_id: i64, items: Vec<EvalSetItem>) -> Self {
        Self {
            versions: Arc::new(RwLock::new(HashMap::from([(
                (eval_set_id, version_id),
                items,
            )]))),
        }
    }

    pub async fn put_items(&self, eval_set_id: i64, version_id: i64, items: Vec<EvalSetItem>) {
        self.versions
            .write()
            .await
            .entry((eval_set_id, version_id))
            .or_default()
            .extend(items);
    }
}

#[async_trait]
impl EvalSetService for StaticEvalSetService {
    async fn get_items(
        &self,
        _space_id: i64,
        eval_set_id: i64,
        version_id: i64,
        item_ids: Vec<i64>,
    ) -> Result<Vec<EvalSetItem>, Error> {
        let versions = self.versions.read().await;
        let items = versions
            .get(&(eval_set_id, version_id))
            .map(Vec::as_slice)
            .unwrap_or_default();
        item_ids
            .into_iter()
            .map(|item_id| {
                items
                    .iter()
                    .find(|item| item.id == item_id)
                    .cloned()
                    .ok_or_else(|| Error::new(ErrorDetails::EvalSetItemNotFound { item_id }))
            })
            .collect()
    }

    async fn list_items(
        &self,
        _space_id: i64,
        eval_set_id: i64,
        version_id: i64,
        page: Pagination,
    ) -> Result<ItemPage, Error> {
        let versions = self.versions.read().await;
        let items = versions
            .get(&(eval_set_id, version_id))
            .map(Vec::as_slice)
            .unwrap_or_default();
        let offset = match &page.page_token {
            Some(token) => token.parse::<usize>().map_err(|e| {
                Error::new(ErrorDetails::InvalidRequest {
                    message: format!("Invalid page token `{token}`: {e}"),
                })
            })?,
            None => 0,
        };
        let page_size = page.page_size.max(1);
        let end = (offset + page_size).min(items.len());
        let next_page_token = (end < items.len()).then(|| end.to_string());
        Ok(ItemPage {
            items: items.get(offset..end).unwrap_or_default().to_vec(),
            next_page_token,
            total: i64::try_from(items.len()).unwrap_or(i64::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: i64) -> Vec<EvalSetItem> {
        (1..=n)
            .map(|id| EvalSetItem {
                id,
                eval_set_id: 1,
                item_key: format!("item-{id}"),
                turns: Vec::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_list_all_items_follows_pages() {
        let service = StaticEvalSetService::new();
        service.put_items(1, 1, items(250)).await;
        let all = list_all_items(&service, 0, 1, 1).await.unwrap();
        assert_eq!(all.len(), 250);
        assert_eq!(all.last().map(|item| item.id), Some(250));
    }

    #[tokio::test]
    async fn test_get_items_missing() {
        let service = StaticEvalSetService::new();
        service.put_items(1, 1, items(2)).await;
        let found = service.get_items(0, 1, 1, vec![2]).await.unwrap();
        assert_eq!(found[0].id, 2);
        let err = service.get_items(0, 1, 1, vec![3]).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::EvalSetItemNotFound { item_id: 3 }
        ));
    }

    #[tokio::test]
    async fn test_mocked_service_single_page() {
        let mut mock = MockEvalSetService::new();
        mock.expect_list_items()
            .times(1)
            .returning(|_, _, _, page| {
                assert_eq!(page.page_token, None);
                Box::pin(async move {
                    Ok(ItemPage {
                        items: items(3),
                        next_page_token: None,
                        total: 3,
                    })
                })
            });
        let all = list_all_items(&mock, 0, 1, 1).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
