//! Read side of the liquidation-history import.
//!
//! An external tool parses the historical liquidation channel export
//! and appends rows to the `liq_history` table. The discovery loop
//! ingests addresses whose largest historical liquidation clears the
//! configured notional floor.

use crate::db::DbPool;
use crate::error::MonitorResult;

pub struct LiqHistoryStore {
    pool: DbPool,
}

impl LiqHistoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Addresses worth registering, with their largest historical
    /// liquidation notional.
    pub async fn addresses_for_discovery(
        &self,
        min_notional: f64,
    ) -> MonitorResult<Vec<(String, f64)>> {
        let rows: Vec<(String, f64)> = sqlx::query_as(
            r#"
            SELECT address, MAX(notional) AS max_notional
            FROM liq_history
            GROUP BY address
            HAVING MAX(notional) >= ?
            "#,
        )
        .bind(min_notional)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn seed(pool: &DbPool, address: &str, notional: f64) {
        sqlx::query(
            "INSERT INTO liq_history (address, token, notional, liquidated_at, imported_at) \
             VALUES (?, 'BTC', ?, ?, ?)",
        )
        .bind(address)
        .bind(notional)
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_addresses_filtered_by_notional() {
        let pool = crate::db::tests::memory_pool().await;
        seed(&pool, "0xaa", 250_000.0).await;
        seed(&pool, "0xaa", 50_000.0).await;
        seed(&pool, "0xbb", 40_000.0).await;

        let store = LiqHistoryStore::new(pool);
        let addresses = store.addresses_for_discovery(100_000.0).await.unwrap();

        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].0, "0xaa");
        assert_eq!(addresses[0].1, 250_000.0);
    }
}
