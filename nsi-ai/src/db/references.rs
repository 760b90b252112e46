//! Reference classifier entries and benchmarks

use async_trait::async_trait;
use sqlx::Row;

use nsi_common::db_retry::retry_on_lock;
use nsi_common::time::now_rfc3339;
use nsi_common::Result;

use super::{parse_column, SqliteStore};
use crate::models::{Benchmark, NewBenchmark, ReferenceEntry, ReferenceTable};
use crate::repository::{BenchmarkRepository, ReferenceRepository};
use crate::similarity::normalize_text;

#[async_trait]
impl ReferenceRepository for SqliteStore {
    async fn upsert_reference_entries(&self, entries: &[ReferenceEntry]) -> Result<u64> {
        retry_on_lock("upsert_reference_entries", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let mut written = 0u64;
            for entry in entries {
                written += sqlx::query(
                    "INSERT INTO reference_entries (ref_table, code, name, parent_code)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(ref_table, code) DO UPDATE SET
                         name = excluded.name,
                         parent_code = excluded.parent_code",
                )
                .bind(entry.table.as_str())
                .bind(entry.code.trim())
                .bind(entry.name.trim())
                .bind(&entry.parent_code)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
            tx.commit().await?;
            Ok(written)
        })
        .await
    }

    async fn load_reference_table(&self, table: ReferenceTable) -> Result<Vec<ReferenceEntry>> {
        let rows = sqlx::query(
            "SELECT code, name, parent_code FROM reference_entries WHERE ref_table = ? ORDER BY code",
        )
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ReferenceEntry {
                table,
                code: row.get("code"),
                name: row.get("name"),
                parent_code: row.get("parent_code"),
            })
            .collect())
    }
}

#[async_trait]
impl BenchmarkRepository for SqliteStore {
    async fn upsert_benchmarks(&self, benchmarks: &[NewBenchmark]) -> Result<Vec<i64>> {
        let created_at = now_rfc3339();
        retry_on_lock("upsert_benchmarks", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let mut ids = Vec::with_capacity(benchmarks.len());
            for benchmark in benchmarks {
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO benchmarks (category, name, normalized_name, code, label, approved, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(category, normalized_name) DO UPDATE SET
                         name = excluded.name,
                         code = excluded.code,
                         label = excluded.label,
                         approved = excluded.approved
                     RETURNING id",
                )
                .bind(benchmark.category.as_str())
                .bind(benchmark.name.trim())
                .bind(normalize_text(&benchmark.name))
                .bind(benchmark.code.trim())
                .bind(benchmark.label.trim())
                .bind(benchmark.approved)
                .bind(&created_at)
                .fetch_one(&mut *tx)
                .await?;
                ids.push(id);
            }
            tx.commit().await?;
            Ok(ids)
        })
        .await
    }

    async fn load_approved_benchmarks(&self) -> Result<Vec<Benchmark>> {
        let rows = sqlx::query(
            "SELECT id, category, name, code, label, approved FROM benchmarks WHERE approved = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let category: String = row.get("category");
                Ok(Benchmark {
                    id: row.get("id"),
                    category: parse_column(&category, "category")?,
                    name: row.get("name"),
                    code: row.get("code"),
                    label: row.get("label"),
                    approved: row.get("approved"),
                })
            })
            .collect()
    }
}
