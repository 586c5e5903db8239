use std::time::Duration;

use async_trait::async_trait;
use tally_core::{CategorySet, QueryError, Tally};
use tracing::debug;

use crate::database::Database;
use crate::error::StoreError;

/// Anything that can answer the grouped count query.
#[async_trait]
pub trait VoteSource: Send + Sync {
    /// Raw `(category, count)` rows, one per distinct category in the store.
    async fn grouped_counts(&self) -> Result<Vec<(String, i64)>, StoreError>;
}

#[async_trait]
impl VoteSource for Database {
    async fn grouped_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.count_by_category())
            .await
            .map_err(|e| StoreError::Database(format!("query task: {e}")))?
    }
}

/// Turns grouped count rows into a complete [`Tally`].
#[derive(Clone, Debug)]
pub struct Aggregator {
    categories: CategorySet,
    query_timeout: Duration,
}

impl Aggregator {
    pub fn new(categories: CategorySet, query_timeout: Duration) -> Self {
        Self {
            categories,
            query_timeout,
        }
    }

    pub fn categories(&self) -> &CategorySet {
        &self.categories
    }

    /// Run the grouped count query and normalize the rows.
    ///
    /// Unknown categories are kept in the tally and logged. No tally is built
    /// when the query fails.
    pub async fn aggregate<S>(&self, source: &S) -> Result<Tally, QueryError>
    where
        S: VoteSource + ?Sized,
    {
        let rows = tokio::time::timeout(self.query_timeout, source.grouped_counts())
            .await
            .map_err(|_| QueryError::Timeout(self.query_timeout))?
            .map_err(|e| match e {
                StoreError::Unavailable(msg) => QueryError::ConnectionLost(msg),
                other => QueryError::Failed(other.to_string()),
            })?;

        let mut counts = Vec::with_capacity(rows.len());
        for (category, count) in rows {
            let count = u64::try_from(count).map_err(|_| QueryError::InvalidCount {
                category: category.clone(),
                count,
            })?;
            if !self.categories.contains(&category) {
                debug!(category = %category, count, "unknown category in store");
            }
            counts.push((category, count));
        }

        Ok(Tally::from_counts(&self.categories, counts))
    }
}
