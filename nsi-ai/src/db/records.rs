//! Source records and job enumeration

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use nsi_common::db_retry::retry_on_lock;
use nsi_common::time::now_rfc3339;
use nsi_common::Result;

use super::{parse_column, SqliteStore};
use crate::models::{NewSourceRecord, NormalizationRecord, SourceSelector};
use crate::repository::RecordRepository;

const SELECTOR_FILTER: &str =
    "(?1 IS NULL OR category = ?1) AND (?2 IS NULL OR source_table = ?2)";

fn limit_of(selector: &SourceSelector) -> i64 {
    selector.limit.map(|l| l as i64).unwrap_or(-1)
}

#[async_trait]
impl RecordRepository for SqliteStore {
    async fn insert_source_records(&self, records: &[NewSourceRecord]) -> Result<Vec<i64>> {
        let created_at = now_rfc3339();
        retry_on_lock("insert_source_records", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let mut ids = Vec::with_capacity(records.len());
            for record in records {
                let result = sqlx::query(
                    "INSERT INTO source_records (source_table, category, raw_name, raw_code, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&record.source_table)
                .bind(record.category.as_str())
                .bind(&record.raw_name)
                .bind(&record.raw_code)
                .bind(&created_at)
                .execute(&mut *tx)
                .await?;
                ids.push(result.last_insert_rowid());
            }
            tx.commit().await?;
            Ok(ids)
        })
        .await
    }

    async fn count_source_records(&self, selector: &SourceSelector) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM (SELECT id FROM source_records WHERE {} ORDER BY id LIMIT ?3)",
            SELECTOR_FILTER
        ))
        .bind(selector.category.map(|c| c.as_str()))
        .bind(selector.source_table.as_deref())
        .bind(limit_of(selector))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn enumerate_job_records(&self, job_id: Uuid, selector: &SourceSelector) -> Result<u64> {
        let job = job_id.to_string();
        let sql = format!(
            "INSERT INTO job_records (job_id, seq, record_id)
             SELECT ?4, ROW_NUMBER() OVER (ORDER BY id) - 1, id
             FROM (SELECT id FROM source_records WHERE {} ORDER BY id LIMIT ?3)",
            SELECTOR_FILTER
        );
        retry_on_lock("enumerate_job_records", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM job_records WHERE job_id = ?")
                .bind(&job)
                .execute(&mut *tx)
                .await?;
            let inserted = sqlx::query(&sql)
                .bind(selector.category.map(|c| c.as_str()))
                .bind(selector.source_table.as_deref())
                .bind(limit_of(selector))
                .bind(&job)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(inserted.rows_affected())
        })
        .await
    }

    async fn load_job_records(
        &self,
        job_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<NormalizationRecord>> {
        let rows = sqlx::query(
            "SELECT jr.seq, s.id, s.category, s.source_table, s.raw_name, s.raw_code
             FROM job_records jr
             JOIN source_records s ON s.id = jr.record_id
             WHERE jr.job_id = ? AND jr.seq >= ?
             ORDER BY jr.seq
             LIMIT ?",
        )
        .bind(job_id.to_string())
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let category: String = row.get("category");
                let seq: i64 = row.get("seq");
                Ok(NormalizationRecord {
                    id: row.get("id"),
                    job_id,
                    seq: seq as u64,
                    category: parse_column(&category, "category")?,
                    source_table: row.get("source_table"),
                    raw_name: row.get("raw_name"),
                    raw_code: row.get("raw_code"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;
    use crate::models::RecordCategory;

    fn record(table: &str, category: RecordCategory, name: &str) -> NewSourceRecord {
        NewSourceRecord {
            source_table: table.to_string(),
            category,
            raw_name: name.to_string(),
            raw_code: None,
        }
    }

    #[tokio::test]
    async fn test_enumeration_is_stable_and_filtered() {
        let store = SqliteStore::new(init_memory_pool().await.unwrap());
        let ids = store
            .insert_source_records(&[
                record("erp_a", RecordCategory::Nomenclature, "Болт"),
                record("erp_a", RecordCategory::Counterparty, "ООО Ромашка"),
                record("erp_b", RecordCategory::Nomenclature, "Гайка"),
                record("erp_a", RecordCategory::Nomenclature, "Шайба"),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 4);

        let selector = SourceSelector {
            category: Some(RecordCategory::Nomenclature),
            ..Default::default()
        };
        assert_eq!(store.count_source_records(&selector).await.unwrap(), 3);

        let job_id = Uuid::new_v4();
        assert_eq!(store.enumerate_job_records(job_id, &selector).await.unwrap(), 3);
        // Re-enumeration replaces rather than duplicates
        assert_eq!(store.enumerate_job_records(job_id, &selector).await.unwrap(), 3);

        let tail = store.load_job_records(job_id, 1, 10).await.unwrap();
        let names: Vec<&str> = tail.iter().map(|r| r.raw_name.as_str()).collect();
        assert_eq!(names, vec!["Гайка", "Шайба"]);
        assert_eq!(tail[0].seq, 1);
        assert_eq!(tail[0].job_id, job_id);
    }

    #[tokio::test]
    async fn test_selector_limit_and_table() {
        let store = SqliteStore::new(init_memory_pool().await.unwrap());
        store
            .insert_source_records(&[
                record("erp_a", RecordCategory::Nomenclature, "1"),
                record("erp_a", RecordCategory::Nomenclature, "2"),
                record("erp_b", RecordCategory::Nomenclature, "3"),
            ])
            .await
            .unwrap();
        let selector = SourceSelector {
            source_table: Some("erp_a".to_string()),
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(store.count_source_records(&selector).await.unwrap(), 1);
    }
}
