//! Durable record of every product folder the watcher has seen.
//!
//! The table is keyed by folder name and doubles as the idempotency record for
//! the ingest pipeline: a folder marked `done` is never processed again.

use crate::models::{MatchConfidence, WatchLogEntry, WatchStats, WatchStatus};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WatchLogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt watch log row {id}: {message}")]
    Corrupt { id: i64, message: String },
}

/// Fields written when a folder is (re)observed.
#[derive(Debug, Clone)]
pub struct FolderDetection {
    pub folder_name: String,
    pub folder_path: String,
    pub preset_name: String,
    pub parsed_product_name: String,
    pub parsed_serial_suffix: Option<String>,
}

#[derive(Clone)]
pub struct WatchLog {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str = "id, folder_name, folder_path, preset_name, parsed_product_name, \
     parsed_serial_suffix, shopify_product_id, shopify_title, match_confidence, image_count, \
     status, error, detected_at, processed_at, created_at, updated_at";

impl WatchLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a `detected` row, or refreshes the location and parsed fields of
    /// the existing one. Status and match data survive a re-detection.
    pub async fn upsert_detected(
        &self,
        detection: &FolderDetection,
    ) -> Result<WatchLogEntry, WatchLogError> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO watch_log (folder_name, folder_path, preset_name, parsed_product_name, \
                 parsed_serial_suffix, image_count, status, detected_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'detected', ?6, ?6, ?6) \
             ON CONFLICT(folder_name) DO UPDATE SET \
                 folder_path = excluded.folder_path, \
                 preset_name = excluded.preset_name, \
                 parsed_product_name = excluded.parsed_product_name, \
                 parsed_serial_suffix = excluded.parsed_serial_suffix, \
                 detected_at = excluded.detected_at, \
                 updated_at = excluded.updated_at \
             RETURNING {SELECT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&detection.folder_name)
            .bind(&detection.folder_path)
            .bind(&detection.preset_name)
            .bind(&detection.parsed_product_name)
            .bind(detection.parsed_serial_suffix.as_deref())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        entry_from_row(&row)
    }

    pub async fn find_by_folder(
        &self,
        folder_name: &str,
    ) -> Result<Option<WatchLogEntry>, WatchLogError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM watch_log WHERE folder_name = ?1");
        let row = sqlx::query(&sql)
            .bind(folder_name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn find(&self, id: i64) -> Result<Option<WatchLogEntry>, WatchLogError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM watch_log WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn mark_matched(
        &self,
        id: i64,
        product_id: &str,
        title: &str,
        confidence: MatchConfidence,
    ) -> Result<(), WatchLogError> {
        sqlx::query(
            "UPDATE watch_log SET status = 'matched', shopify_product_id = ?2, shopify_title = ?3, \
                 match_confidence = ?4, error = NULL, updated_at = ?5 \
             WHERE id = ?1 AND status <> 'done'",
        )
        .bind(id)
        .bind(product_id)
        .bind(title)
        .bind(confidence.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_unmatched(&self, id: i64) -> Result<(), WatchLogError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE watch_log SET status = 'unmatched', match_confidence = 'unmatched', \
                 shopify_product_id = NULL, shopify_title = NULL, error = NULL, \
                 processed_at = ?2, updated_at = ?2 \
             WHERE id = ?1 AND status <> 'done'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_uploading(&self, id: i64, image_count: i64) -> Result<(), WatchLogError> {
        sqlx::query(
            "UPDATE watch_log SET status = 'uploading', image_count = ?2, error = NULL, \
                 updated_at = ?3 \
             WHERE id = ?1 AND status <> 'done'",
        )
        .bind(id)
        .bind(image_count)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a finished upload with the number of images that actually made it.
    pub async fn mark_done(&self, id: i64, uploaded: i64) -> Result<(), WatchLogError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE watch_log SET status = 'done', image_count = ?2, error = NULL, \
                 processed_at = ?3, updated_at = ?3 \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(uploaded)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_error(&self, id: i64, message: &str) -> Result<(), WatchLogError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE watch_log SET status = 'error', error = ?2, processed_at = ?3, updated_at = ?3 \
             WHERE id = ?1 AND status <> 'done'",
        )
        .bind(id)
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a folder that holds no images: `error` with an image count of 0,
    /// whatever an earlier pass counted.
    pub async fn mark_no_images(&self, id: i64) -> Result<(), WatchLogError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE watch_log SET status = 'error', error = 'no images', image_count = 0, \
                 processed_at = ?2, updated_at = ?2 \
             WHERE id = ?1 AND status <> 'done'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rolls back rows left `uploading` by a crashed process so the next scan
    /// retries the upload with the stored match.
    pub async fn recover_interrupted(&self) -> Result<u64, WatchLogError> {
        let result = sqlx::query(
            "UPDATE watch_log SET status = 'matched', updated_at = ?1 WHERE status = 'uploading'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(
                target = "ingest.watch_log",
                recovered, "rolled back interrupted uploads to matched"
            );
        }
        Ok(recovered)
    }

    /// Operator override: attach a catalog product to a folder the matcher gave up on.
    pub async fn link_manual(
        &self,
        id: i64,
        product_id: &str,
        title: &str,
    ) -> Result<Option<WatchLogEntry>, WatchLogError> {
        let sql = format!(
            "UPDATE watch_log SET status = 'matched', shopify_product_id = ?2, shopify_title = ?3, \
                 match_confidence = 'manual', error = NULL, updated_at = ?4 \
             WHERE id = ?1 AND status NOT IN ('done', 'uploading') \
             RETURNING {SELECT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(product_id)
            .bind(title)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;
        let entry = row.as_ref().map(entry_from_row).transpose()?;
        if let Some(entry) = &entry {
            info!(
                target = "ingest.watch_log",
                folder = %entry.folder_name,
                product_id,
                "folder linked manually"
            );
        }
        Ok(entry)
    }

    pub async fn delete(&self, id: i64) -> Result<bool, WatchLogError> {
        let result = sqlx::query("DELETE FROM watch_log WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_unmatched(&self, limit: i64) -> Result<Vec<WatchLogEntry>, WatchLogError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM watch_log WHERE status = 'unmatched' \
             ORDER BY detected_at DESC, id DESC LIMIT ?1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<WatchLogEntry>, WatchLogError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM watch_log ORDER BY updated_at DESC, id DESC LIMIT ?1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn stats(&self) -> Result<WatchStats, WatchLogError> {
        let mut stats = WatchStats::default();
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM watch_log GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            stats.total += count;
            match WatchStatus::parse(&status) {
                Some(WatchStatus::Detected) => stats.detected = count,
                Some(WatchStatus::Matched) => stats.matched = count,
                Some(WatchStatus::Unmatched) => stats.unmatched = count,
                Some(WatchStatus::Uploading) => stats.uploading = count,
                Some(WatchStatus::Done) => stats.done = count,
                Some(WatchStatus::Error) => stats.error = count,
                None => warn!(target = "ingest.watch_log", status, "unknown status in stats"),
            }
        }

        stats.images_uploaded = sqlx::query(
            "SELECT COALESCE(SUM(image_count), 0) AS images FROM watch_log WHERE status = 'done'",
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("images")?;

        stats.last_processed_at = sqlx::query(
            "SELECT processed_at FROM watch_log WHERE processed_at IS NOT NULL \
             ORDER BY processed_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.try_get::<DateTime<Utc>, _>("processed_at"))
        .transpose()?;

        Ok(stats)
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<WatchLogEntry, WatchLogError> {
    let id: i64 = row.try_get("id")?;
    let status_raw: String = row.try_get("status")?;
    let status = WatchStatus::parse(&status_raw).ok_or_else(|| WatchLogError::Corrupt {
        id,
        message: format!("unknown status `{status_raw}`"),
    })?;
    let match_confidence = row
        .try_get::<Option<String>, _>("match_confidence")?
        .map(|raw| {
            MatchConfidence::parse(&raw).ok_or_else(|| WatchLogError::Corrupt {
                id,
                message: format!("unknown match confidence `{raw}`"),
            })
        })
        .transpose()?;

    Ok(WatchLogEntry {
        id,
        folder_name: row.try_get("folder_name")?,
        folder_path: row.try_get("folder_path")?,
        preset_name: row.try_get("preset_name")?,
        parsed_product_name: row.try_get("parsed_product_name")?,
        parsed_serial_suffix: row.try_get("parsed_serial_suffix")?,
        shopify_product_id: row.try_get("shopify_product_id")?,
        shopify_title: row.try_get("shopify_title")?,
        match_confidence,
        image_count: row.try_get("image_count")?,
        status,
        error: row.try_get("error")?,
        detected_at: row.try_get("detected_at")?,
        processed_at: row.try_get("processed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    fn detection(folder_name: &str) -> FolderDetection {
        FolderDetection {
            folder_name: folder_name.to_string(),
            folder_path: format!("/share/studio/{folder_name}"),
            preset_name: "studio".to_string(),
            parsed_product_name: "sigma 24-70".to_string(),
            parsed_serial_suffix: Some("624".to_string()),
        }
    }

    #[tokio::test]
    async fn redetection_updates_the_same_row() {
        let log = WatchLog::new(memory_pool().await);
        let first = log
            .upsert_detected(&detection("sigma 24-70 #624"))
            .await
            .expect("insert");
        assert_eq!(first.status, WatchStatus::Detected);

        let mut moved = detection("sigma 24-70 #624");
        moved.folder_path = "/share/outdoor/sigma 24-70 #624".to_string();
        moved.preset_name = "outdoor".to_string();
        let second = log.upsert_detected(&moved).await.expect("update");

        assert_eq!(first.id, second.id);
        assert_eq!(second.preset_name, "outdoor");
        assert_eq!(log.stats().await.expect("stats").total, 1);
    }

    #[tokio::test]
    async fn redetection_keeps_status_and_match() {
        let log = WatchLog::new(memory_pool().await);
        let entry = log
            .upsert_detected(&detection("leica m6"))
            .await
            .expect("insert");
        log.mark_matched(entry.id, "gid-1", "Leica M6", MatchConfidence::Exact)
            .await
            .expect("match");

        let again = log
            .upsert_detected(&detection("leica m6"))
            .await
            .expect("upsert");
        assert_eq!(again.status, WatchStatus::Matched);
        assert_eq!(again.shopify_product_id.as_deref(), Some("gid-1"));
        assert_eq!(again.match_confidence, Some(MatchConfidence::Exact));
    }

    #[tokio::test]
    async fn recovery_rolls_back_only_uploading_rows() {
        let log = WatchLog::new(memory_pool().await);
        let uploading = log.upsert_detected(&detection("a")).await.expect("a");
        let done = log.upsert_detected(&detection("b")).await.expect("b");
        let unmatched = log.upsert_detected(&detection("c")).await.expect("c");

        log.mark_matched(uploading.id, "1", "A", MatchConfidence::Fuzzy)
            .await
            .expect("match");
        log.mark_uploading(uploading.id, 4).await.expect("uploading");
        log.mark_done(done.id, 2).await.expect("done");
        log.mark_unmatched(unmatched.id).await.expect("unmatched");

        assert_eq!(log.recover_interrupted().await.expect("recover"), 1);

        let recovered = log.find(uploading.id).await.expect("find").expect("row");
        assert_eq!(recovered.status, WatchStatus::Matched);
        assert_eq!(recovered.shopify_product_id.as_deref(), Some("1"));
        let done = log.find(done.id).await.expect("find").expect("row");
        assert_eq!(done.status, WatchStatus::Done);
        let unmatched = log.find(unmatched.id).await.expect("find").expect("row");
        assert_eq!(unmatched.status, WatchStatus::Unmatched);
    }

    #[tokio::test]
    async fn done_is_terminal() {
        let log = WatchLog::new(memory_pool().await);
        let entry = log.upsert_detected(&detection("x")).await.expect("insert");
        log.mark_done(entry.id, 3).await.expect("done");
        log.mark_error(entry.id, "late failure").await.expect("error");

        let entry = log.find(entry.id).await.expect("find").expect("row");
        assert_eq!(entry.status, WatchStatus::Done);
        assert_eq!(entry.image_count, 3);
        assert!(entry.error.is_none());
        assert!(
            log.link_manual(entry.id, "2", "Other")
                .await
                .expect("link")
                .is_none()
        );
    }

    #[tokio::test]
    async fn unmatched_listing_and_manual_link() {
        let log = WatchLog::new(memory_pool().await);
        let lost = log.upsert_detected(&detection("mystery lens")).await.expect("a");
        let found = log.upsert_detected(&detection("known lens")).await.expect("b");
        log.mark_unmatched(lost.id).await.expect("unmatched");
        log.mark_matched(found.id, "9", "Known Lens", MatchConfidence::Exact)
            .await
            .expect("matched");

        let unmatched = log.list_unmatched(10).await.expect("list");
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].folder_name, "mystery lens");

        let linked = log
            .link_manual(lost.id, "42", "Mystery Lens 50mm")
            .await
            .expect("link")
            .expect("row");
        assert_eq!(linked.status, WatchStatus::Matched);
        assert_eq!(linked.match_confidence, Some(MatchConfidence::Manual));
        assert!(log.list_unmatched(10).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn stats_aggregate_by_status() {
        let log = WatchLog::new(memory_pool().await);
        let a = log.upsert_detected(&detection("a")).await.expect("a");
        let b = log.upsert_detected(&detection("b")).await.expect("b");
        let c = log.upsert_detected(&detection("c")).await.expect("c");
        log.mark_done(a.id, 5).await.expect("done");
        log.mark_done(b.id, 3).await.expect("done");
        log.mark_error(c.id, "no images").await.expect("error");

        let stats = log.stats().await.expect("stats");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.done, 2);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.images_uploaded, 8);
        assert!(stats.last_processed_at.is_some());

        assert!(log.delete(c.id).await.expect("delete"));
        assert!(!log.delete(c.id).await.expect("delete twice"));
        assert_eq!(log.list_recent(10).await.expect("recent").len(), 2);
    }
}
