//! Message brokers backing the queue router.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use keel_core::queue::Broker;
use keel_core::{Error, Result};
use keel_db::{Database, DbError};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// In-process broker for single-node deployments and tests.
///
/// Queues live in this process only, so the broker cannot serve cluster mode.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<Bytes>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_shared(&self) -> bool {
        false
    }

    async fn publish(&self, route: &str, payload: Bytes) -> Result<()> {
        self.queues
            .lock()
            .await
            .entry(route.to_string())
            .or_default()
            .push_back(payload);
        Ok(())
    }

    async fn pop(&self, route: &str) -> Result<Option<Bytes>> {
        Ok(self
            .queues
            .lock()
            .await
            .get_mut(route)
            .and_then(VecDeque::pop_front))
    }

    async fn length(&self, route: &str) -> Result<u64> {
        Ok(self
            .queues
            .lock()
            .await
            .get(route)
            .map_or(0, |q| q.len() as u64))
    }
}

/// Broker backed by the `queue_messages` table.
///
/// Every server pointed at the same database shares its queues, which makes
/// it usable in cluster mode. On PostgreSQL, pops skip rows locked by other
/// consumers.
#[derive(Debug, Clone)]
pub struct SqlBroker {
    db: Database,
}

impl SqlBroker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn unavailable(err: sqlx::Error) -> Error {
    DbError::from(err).into()
}

#[async_trait]
impl Broker for SqlBroker {
    fn name(&self) -> &'static str {
        "database"
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn publish(&self, route: &str, payload: Bytes) -> Result<()> {
        sqlx::query(self.db.dialect().queue().push)
            .bind(route)
            .bind(payload.to_vec())
            .bind(Utc::now().timestamp())
            .execute(self.db.pool())
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn pop(&self, route: &str) -> Result<Option<Bytes>> {
        let payload: Option<Vec<u8>> =
            sqlx::query_scalar::<_, Vec<u8>>(self.db.dialect().queue().pop)
                .bind(route)
                .fetch_optional(self.db.pool())
                .await
                .map_err(unavailable)?;
        Ok(payload.map(Bytes::from))
    }

    async fn length(&self, route: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar::<_, i64>(self.db.dialect().queue().length)
            .bind(route)
            .fetch_one(self.db.pool())
            .await
            .map_err(unavailable)?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(broker: &dyn Broker) {
        assert_eq!(broker.length("vela").await.unwrap(), 0);
        assert_eq!(broker.pop("vela").await.unwrap(), None);

        broker
            .publish("vela", Bytes::from_static(b"first"))
            .await
            .unwrap();
        broker
            .publish("vela", Bytes::from_static(b"second"))
            .await
            .unwrap();
        broker
            .publish("gpu", Bytes::from_static(b"other"))
            .await
            .unwrap();

        assert_eq!(broker.length("vela").await.unwrap(), 2);
        assert_eq!(broker.length("gpu").await.unwrap(), 1);

        assert_eq!(
            broker.pop("vela").await.unwrap(),
            Some(Bytes::from_static(b"first"))
        );
        assert_eq!(
            broker.pop("vela").await.unwrap(),
            Some(Bytes::from_static(b"second"))
        );
        assert_eq!(broker.pop("vela").await.unwrap(), None);
        assert_eq!(broker.length("gpu").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_broker() {
        let broker = MemoryBroker::new();
        assert!(!broker.is_shared());
        exercise(&broker).await;
    }

    #[tokio::test]
    async fn test_sql_broker() {
        let broker = SqlBroker::new(Database::in_memory().await.unwrap());
        assert!(broker.is_shared());
        exercise(&broker).await;
    }
}
