//! Classification results

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use nsi_common::db_retry::retry_on_lock;
use nsi_common::time::parse_rfc3339;
use nsi_common::Result;

use super::{parse_column, parse_uuid, SqliteStore};
use crate::models::{
    ClassificationResult, PipelineStage, QualityLevel, QualityScope, RecordCategory,
    ReferenceTable, ResolutionMethod,
};
use crate::repository::{ResultRepository, ResultWithRecord};

const RESULT_COLUMNS: &str = "r.job_id, r.record_id, r.stage_reached, r.method, r.category_code, \
     r.category_name, r.reference_table, r.matched_reference_id, r.confidence, r.quality_level, \
     r.manual_review, r.provider_used, r.error, r.created_at";

fn result_from_row(row: &SqliteRow) -> Result<ClassificationResult> {
    let job_id: String = row.get("job_id");
    let stage: String = row.get("stage_reached");
    let method: String = row.get("method");
    let reference_table: Option<String> = row.get("reference_table");
    let quality_level: String = row.get("quality_level");
    let created_at: String = row.get("created_at");

    Ok(ClassificationResult {
        job_id: parse_uuid(&job_id)?,
        record_id: row.get("record_id"),
        stage_reached: parse_column::<PipelineStage>(&stage, "stage_reached")?,
        method: parse_column::<ResolutionMethod>(&method, "method")?,
        category_code: row.get("category_code"),
        category_name: row.get("category_name"),
        reference_table: reference_table
            .as_deref()
            .map(|t| parse_column::<ReferenceTable>(t, "reference_table"))
            .transpose()?,
        matched_reference_id: row.get("matched_reference_id"),
        confidence: row.get("confidence"),
        quality_level: parse_column::<QualityLevel>(&quality_level, "quality_level")?,
        manual_review: row.get("manual_review"),
        provider_used: row.get("provider_used"),
        error: row.get("error"),
        created_at: parse_rfc3339(&created_at)?,
    })
}

#[async_trait]
impl ResultRepository for SqliteStore {
    async fn upsert_result(&self, result: &ClassificationResult) -> Result<()> {
        let job_id = result.job_id.to_string();
        let created_at = result.created_at.to_rfc3339();

        retry_on_lock("upsert_result", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO classification_results (
                    job_id, record_id, stage_reached, method, category_code, category_name,
                    reference_table, matched_reference_id, confidence, quality_level,
                    manual_review, provider_used, error, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(job_id, record_id) DO UPDATE SET
                    stage_reached = excluded.stage_reached,
                    method = excluded.method,
                    category_code = excluded.category_code,
                    category_name = excluded.category_name,
                    reference_table = excluded.reference_table,
                    matched_reference_id = excluded.matched_reference_id,
                    confidence = excluded.confidence,
                    quality_level = excluded.quality_level,
                    manual_review = excluded.manual_review,
                    provider_used = excluded.provider_used,
                    error = excluded.error,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&job_id)
            .bind(result.record_id)
            .bind(result.stage_reached.as_str())
            .bind(result.method.as_str())
            .bind(&result.category_code)
            .bind(&result.category_name)
            .bind(result.reference_table.map(|t| t.as_str()))
            .bind(&result.matched_reference_id)
            .bind(result.confidence)
            .bind(result.quality_level.as_str())
            .bind(result.manual_review)
            .bind(&result.provider_used)
            .bind(&result.error)
            .bind(&created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Results joined with their source rows
    ///
    /// Without a job in scope only the newest result of each record is returned.
    async fn load_results(&self, scope: &QualityScope) -> Result<Vec<ResultWithRecord>> {
        let sql = format!(
            r#"
            SELECT {cols}, s.category, s.source_table, s.raw_name, s.raw_code
            FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY record_id ORDER BY created_at DESC
                ) AS rn
                FROM classification_results
                WHERE (?1 IS NULL OR job_id = ?1)
            ) r
            JOIN source_records s ON s.id = r.record_id
            WHERE (?1 IS NOT NULL OR r.rn = 1)
              AND (?2 IS NULL OR s.category = ?2)
            ORDER BY r.record_id
            "#,
            cols = RESULT_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(scope.job_id.map(|id| id.to_string()))
            .bind(scope.category.map(|c| c.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let category: String = row.get("category");
                Ok(ResultWithRecord {
                    result: result_from_row(row)?,
                    category: parse_column::<RecordCategory>(&category, "category")?,
                    source_table: row.get("source_table"),
                    raw_name: row.get("raw_name"),
                    raw_code: row.get("raw_code"),
                })
            })
            .collect()
    }

    async fn load_job_results(&self, job_id: Uuid) -> Result<Vec<ClassificationResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM classification_results r WHERE r.job_id = ? ORDER BY r.record_id",
            RESULT_COLUMNS
        ))
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }
}
