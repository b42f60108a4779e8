//! src/services/content_store.rs
//!
//! ContentStore: content-addressed blob storage backed by SQLite for
//! metadata and local disk for payloads. Payloads are laid out beneath
//! `base_path/{kind}/{aa}/{bb}/{digest}{ext}` where `aa`/`bb` are the first
//! two byte pairs of the SHA-256 digest.
//!
//! The `reference_count` column is the reference ledger: it is only ever
//! changed by single-statement atomic updates, so claims, releases and the
//! guarded delete are linearizable per blob without application-level
//! read-modify-write.

use crate::{
    models::blob::{BLOB_COLUMNS, BlobKind, StoredBlob},
    services::digest::ContentDigest,
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::{
    io::{self, Cursor, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Media types accepted by [`ContentStore::ingest`].
pub const SUPPORTED_MEDIA_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("blob `{id}` is still referenced by {count} job(s)")]
    StillReferenced { id: Uuid, count: i64 },
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("blob inspection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Upload constraints checked before anything is written.
#[derive(Debug, Clone)]
pub struct IngestLimits {
    pub max_bytes: usize,
    pub min_dimension: u32,
    pub max_dimension: u32,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            min_dimension: 64,
            max_dimension: 4096,
        }
    }
}

impl IngestLimits {
    fn check_dimensions(&self, width: u32, height: u32) -> StorageResult<()> {
        if width > self.max_dimension || height > self.max_dimension {
            return Err(StorageError::Validation(format!(
                "image dimensions too large: {}x{}, max {}x{}",
                width, height, self.max_dimension, self.max_dimension
            )));
        }
        if width < self.min_dimension || height < self.min_dimension {
            return Err(StorageError::Validation(format!(
                "image dimensions too small: {}x{}, min {}x{}",
                width, height, self.min_dimension, self.min_dimension
            )));
        }
        Ok(())
    }
}

/// Result of an ingest: the record plus whether it already existed.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub blob: StoredBlob,
    pub is_duplicate: bool,
}

/// Outcome of one reclamation sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Zero-reference blobs idle past the retention window at scan time.
    pub candidates: usize,
    pub reclaimed: usize,
    /// Tombstones hard-deleted because nothing references them any more.
    pub purged: usize,
    pub failed: usize,
}

/// Striped async locks keyed by digest. Serializes the physical write of a
/// novel digest against the unlink of the same digest's bytes.
struct DigestLocks {
    stripes: Vec<Mutex<()>>,
}

impl DigestLocks {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, digest: &ContentDigest) -> MutexGuard<'_, ()> {
        self.stripes[digest.stripe(LOCK_STRIPES)].lock().await
    }
}

/// ContentStore provides the blob operations used by uploads and jobs:
/// - Ingest (validate, hash, dedup-or-store)
/// - Resolve by id or digest, retrieve bytes
/// - Claim / release references
/// - Guarded removal, tombstoning and orphan reclamation
#[derive(Clone)]
pub struct ContentStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where blob payloads are stored.
    pub base_path: PathBuf,

    limits: IngestLimits,
    locks: Arc<DigestLocks>,
}

impl ContentStore {
    /// Create a new ContentStore backed by the provided SQLite pool and
    /// using `base_path` as the root directory for payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            limits: IngestLimits::default(),
            locks: Arc::new(DigestLocks::new()),
        }
    }

    pub fn with_limits(mut self, limits: IngestLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Same store on a different connection pool. Digest locks are shared, so
    /// the two handles stay serialized against each other.
    pub fn with_pool(&self, db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            base_path: self.base_path.clone(),
            limits: self.limits.clone(),
            locks: self.locks.clone(),
        }
    }

    pub fn limits(&self) -> &IngestLimits {
        &self.limits
    }

    /// Absolute on-disk path for a blob's payload.
    pub fn path_of(&self, blob: &StoredBlob) -> PathBuf {
        self.base_path.join(&blob.storage_path)
    }

    fn validate_upload(&self, media_type: &str, len: usize) -> StorageResult<()> {
        if !SUPPORTED_MEDIA_TYPES.contains(&media_type) {
            return Err(StorageError::Validation(format!(
                "invalid file type: {}. Allowed: {}",
                media_type,
                SUPPORTED_MEDIA_TYPES.join(", ")
            )));
        }
        if len == 0 {
            return Err(StorageError::Validation("file is empty".into()));
        }
        if len > self.limits.max_bytes {
            return Err(StorageError::Validation(format!(
                "file too large: {} bytes. Max: {} bytes",
                len, self.limits.max_bytes
            )));
        }
        Ok(())
    }

    /// Accept raw bytes and return the stored record for that content.
    ///
    /// Validation (media type, size, decodable image within the dimension
    /// bounds) happens before any write. A digest hit refreshes
    /// `last_touched_at` and returns the existing record without touching
    /// disk; a miss writes the payload and inserts a row with zero references.
    pub async fn ingest(
        &self,
        data: Bytes,
        media_type: &str,
        kind: BlobKind,
        filename: &str,
    ) -> StorageResult<Ingested> {
        let media_type = normalize_media_type(media_type);
        self.validate_upload(&media_type, data.len())?;

        let limits = self.limits.clone();
        let inspect = data.clone();
        let (digest, (width, height)) = tokio::task::spawn_blocking(move || {
            let dims = image_dimensions(&inspect)?;
            limits.check_dimensions(dims.0, dims.1)?;
            Ok::<_, StorageError>((ContentDigest::compute(&inspect), dims))
        })
        .await??;

        let _guard = self.locks.lock(&digest).await;

        if let Some(existing) = self.touch_by_digest(&digest).await? {
            debug!(blob_id = %existing.id, %digest, "dedup hit");
            return Ok(Ingested {
                blob: existing,
                is_duplicate: true,
            });
        }

        let storage_path = storage_location(kind, &digest, &media_type);
        self.write_payload(&storage_path, &data).await?;

        let now = Utc::now();
        let insert_result = sqlx::query_as::<_, StoredBlob>(&format!(
            "INSERT INTO blobs (
                id, digest, kind, filename, media_type, byte_size, width, height,
                storage_path, reference_count, created_at, last_touched_at, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 0)
            RETURNING {BLOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(digest.to_hex())
        .bind(kind)
        .bind(sanitize_filename(filename, &digest, &media_type))
        .bind(&media_type)
        .bind(data.len() as i64)
        .bind(width as i64)
        .bind(height as i64)
        .bind(&storage_path)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(blob) => {
                info!(blob_id = %blob.id, %digest, kind = %kind, size = blob.byte_size, "stored new blob");
                Ok(Ingested {
                    blob,
                    is_duplicate: false,
                })
            }
            // Another writer on the same database won the race for this digest.
            Err(err) if is_unique_violation(&err) => match self.touch_by_digest(&digest).await? {
                Some(existing) => Ok(Ingested {
                    blob: existing,
                    is_duplicate: true,
                }),
                None => Err(StorageError::Sqlx(err)),
            },
            Err(err) => {
                if let Err(cleanup) = self.discard_payload(&storage_path).await {
                    warn!(%storage_path, error = %cleanup, "failed to clean up payload after insert error");
                }
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Refresh `last_touched_at` on the live row for `digest`, if any.
    async fn touch_by_digest(&self, digest: &ContentDigest) -> StorageResult<Option<StoredBlob>> {
        let blob = sqlx::query_as::<_, StoredBlob>(&format!(
            "UPDATE blobs SET last_touched_at = ?
             WHERE digest = ? AND is_deleted = 0
             RETURNING {BLOB_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(digest.to_hex())
        .fetch_optional(&*self.db)
        .await?;
        Ok(blob)
    }

    /// Write a payload to its content-addressed location.
    ///
    /// - Writes to a temporary file in the shard directory and fsyncs it.
    /// - Atomically renames into the final path.
    /// - Skips the write when the path already holds the bytes (the path is
    ///   derived from the digest, so existing content is identical).
    async fn write_payload(&self, storage_path: &str, data: &[u8]) -> StorageResult<()> {
        let file_path = self.base_path.join(storage_path);
        if fs::try_exists(&file_path).await? {
            debug!(path = %file_path.display(), "payload already on disk");
            return Ok(());
        }

        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &file_path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    /// Fetch a live (non-tombstoned) blob by id.
    pub async fn resolve(&self, id: Uuid) -> StorageResult<StoredBlob> {
        sqlx::query_as::<_, StoredBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM blobs WHERE id = ? AND is_deleted = 0"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("blob `{}`", id)))
    }

    /// Fetch a live blob by its hex digest.
    pub async fn resolve_by_digest(&self, digest: &str) -> StorageResult<StoredBlob> {
        let digest = ContentDigest::from_hex(digest).map_err(StorageError::InvalidDigest)?;
        sqlx::query_as::<_, StoredBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM blobs WHERE digest = ? AND is_deleted = 0"
        ))
        .bind(digest.to_hex())
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("blob with digest `{}`", digest)))
    }

    /// Fetch a blob by id including tombstoned rows. Jobs keep using blobs
    /// they claimed even after the blob is hidden from new lookups.
    pub async fn locate(&self, id: Uuid) -> StorageResult<Option<StoredBlob>> {
        let blob = sqlx::query_as::<_, StoredBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM blobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(blob)
    }

    /// Open a blob's payload for reading.
    ///
    /// A row whose bytes are missing from disk is a storage inconsistency: it
    /// is logged and reported to the caller as NotFound.
    pub async fn retrieve(&self, id: Uuid) -> StorageResult<(StoredBlob, File)> {
        let blob = self.resolve(id).await?;
        let file_path = self.path_of(&blob);
        match File::open(&file_path).await {
            Ok(file) => Ok((blob, file)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                error!(
                    blob_id = %blob.id,
                    digest = %blob.digest,
                    path = %file_path.display(),
                    "storage inconsistency: metadata row has no payload on disk"
                );
                Err(StorageError::NotFound(format!("payload for blob `{}`", id)))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Add one reference to a live blob and refresh its touch time.
    pub async fn claim(&self, id: Uuid) -> StorageResult<()> {
        let mut conn = self.db.acquire().await?;
        claim_in(&mut conn, id).await
    }

    /// Drop one reference, floored at zero. Returns whether a reference was
    /// actually dropped; releasing an unreferenced or unknown blob is a no-op.
    pub async fn release(&self, id: Uuid) -> StorageResult<bool> {
        let mut conn = self.db.acquire().await?;
        release_in(&mut conn, id).await
    }

    /// Hard-delete a live blob that has no references.
    ///
    /// Returns `Ok(false)` if the blob is unknown or already gone and
    /// [`StorageError::StillReferenced`] if any job still holds it.
    pub async fn remove(&self, id: Uuid) -> StorageResult<bool> {
        self.remove_guarded(id, Removal::Live).await
    }

    /// Hide a blob from lookups without touching its bytes or references.
    pub async fn tombstone(&self, id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("UPDATE blobs SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .execute(&*self.db)
            .await?;
        let hidden = result.rows_affected() > 0;
        if hidden {
            info!(blob_id = %id, "tombstoned blob");
        }
        Ok(hidden)
    }

    /// Hard-delete a tombstoned blob once its last reference is gone.
    ///
    /// Returns `Ok(false)` for live blobs, unknown ids and tombstones that
    /// some job still holds.
    pub async fn purge_tombstone(&self, id: Uuid) -> StorageResult<bool> {
        self.remove_guarded(id, Removal::Tombstone).await
    }

    /// Remove every zero-reference blob idle for longer than `retention`,
    /// then purge tombstones nothing holds any more.
    ///
    /// Candidates are processed one at a time; a failure on one is logged and
    /// counted without aborting the sweep. A failed candidate keeps its row,
    /// so the next sweep picks it up again.
    pub async fn reclaim_orphans(&self, retention: Duration) -> StorageResult<ReclaimReport> {
        let cutoff = Utc::now() - retention;
        let candidates: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM blobs
             WHERE reference_count = 0 AND is_deleted = 0 AND last_touched_at < ?
             ORDER BY last_touched_at",
        )
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;
        let tombstones: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM blobs WHERE reference_count = 0 AND is_deleted = 1",
        )
        .fetch_all(&*self.db)
        .await?;

        let mut report = ReclaimReport {
            candidates: candidates.len(),
            ..ReclaimReport::default()
        };

        for id in candidates {
            match self.remove_guarded(id, Removal::IdleBefore(cutoff)).await {
                Ok(true) => report.reclaimed += 1,
                Ok(false) => debug!(blob_id = %id, "reclaim candidate already gone or touched"),
                Err(StorageError::StillReferenced { count, .. }) => {
                    debug!(blob_id = %id, count, "reclaim candidate claimed during sweep")
                }
                Err(err) => {
                    warn!(blob_id = %id, error = %err, "failed to reclaim blob");
                    report.failed += 1;
                }
            }
        }

        for id in tombstones {
            match self.purge_tombstone(id).await {
                Ok(true) => report.purged += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(blob_id = %id, error = %err, "failed to purge tombstone");
                    report.failed += 1;
                }
            }
        }

        info!(
            candidates = report.candidates,
            reclaimed = report.reclaimed,
            purged = report.purged,
            failed = report.failed,
            retention_secs = retention.num_seconds(),
            "reclamation sweep finished"
        );
        Ok(report)
    }

    /// Delete the row if `removal` still holds for it and unlink its payload.
    ///
    /// The delete, the sharer count and the unlink run in one transaction
    /// under the digest lock. The transaction commits only once the bytes are
    /// gone (or were already missing); any other unlink error rolls the row
    /// back so a later sweep can retry.
    async fn remove_guarded(&self, id: Uuid, removal: Removal) -> StorageResult<bool> {
        let Some(blob) = self.locate(id).await? else {
            return Ok(false);
        };
        let digest = ContentDigest::from_hex(&blob.digest).map_err(StorageError::InvalidDigest)?;
        let _guard = self.locks.lock(&digest).await;

        let mut tx = self.db.begin().await?;
        let result = match removal {
            Removal::Live => {
                sqlx::query(
                    "DELETE FROM blobs WHERE id = ? AND is_deleted = 0 AND reference_count = 0",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?
            }
            Removal::IdleBefore(cutoff) => {
                sqlx::query(
                    "DELETE FROM blobs
                     WHERE id = ? AND is_deleted = 0 AND reference_count = 0
                       AND last_touched_at < ?",
                )
                .bind(id)
                .bind(cutoff)
                .execute(&mut *tx)
                .await?
            }
            Removal::Tombstone => {
                sqlx::query(
                    "DELETE FROM blobs WHERE id = ? AND is_deleted = 1 AND reference_count = 0",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            if matches!(removal, Removal::Tombstone) {
                return Ok(false);
            }
            return match self.resolve(id).await {
                Ok(current) if current.reference_count > 0 => Err(StorageError::StillReferenced {
                    id,
                    count: current.reference_count,
                }),
                Ok(_) | Err(StorageError::NotFound(_)) => Ok(false),
                Err(err) => Err(err),
            };
        }

        // Dropping `tx` on error rolls the delete back.
        let unlinked = self.unlink_unshared(&mut tx, &blob.storage_path).await?;
        tx.commit().await?;

        if unlinked {
            self.prune_empty_dirs(&blob.storage_path).await;
        }
        info!(blob_id = %id, %digest, tombstone = blob.is_deleted, "removed blob");
        Ok(true)
    }

    /// Unlink a payload unless another row (a tombstone, typically) still
    /// points at it. A missing file is not an error. Returns whether the
    /// file is gone.
    async fn unlink_unshared(
        &self,
        conn: &mut SqliteConnection,
        storage_path: &str,
    ) -> StorageResult<bool> {
        let sharers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blobs WHERE storage_path = ?")
            .bind(storage_path)
            .fetch_one(&mut *conn)
            .await?;
        if sharers > 0 {
            debug!(%storage_path, sharers, "payload still shared, keeping bytes");
            return Ok(false);
        }

        let file_path = self.base_path.join(storage_path);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        Ok(true)
    }

    /// Drop a payload written for a row that never made it into the table.
    async fn discard_payload(&self, storage_path: &str) -> StorageResult<()> {
        let mut conn = self.db.acquire().await?;
        if self.unlink_unshared(&mut conn, storage_path).await? {
            self.prune_empty_dirs(storage_path).await;
        }
        Ok(())
    }

    /// Remove empty shard directories above a payload, stopping below
    /// `base_path/{kind}`.
    ///
    /// The kind directory spans every lock stripe and is never removed. Stops
    /// when a directory is not empty or is missing, and on any other error.
    async fn prune_empty_dirs(&self, storage_path: &str) {
        let relative = Path::new(storage_path);
        let Some(kind_dir) = relative.components().next() else {
            return;
        };
        let stop = self.base_path.join(kind_dir);
        let Some(mut current) = self.base_path.join(relative).parent().map(Path::to_path_buf)
        else {
            return;
        };

        while current.starts_with(&stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Which rows a guarded removal may delete.
#[derive(Debug, Clone, Copy)]
enum Removal {
    /// Live and unreferenced.
    Live,
    /// Live, unreferenced and not touched since the cutoff.
    IdleBefore(DateTime<Utc>),
    /// Tombstoned and unreferenced.
    Tombstone,
}

/// Claim a live blob on an existing connection or transaction.
pub(crate) async fn claim_in(conn: &mut SqliteConnection, id: Uuid) -> StorageResult<()> {
    let result = sqlx::query(
        "UPDATE blobs SET reference_count = reference_count + 1, last_touched_at = ?
         WHERE id = ? AND is_deleted = 0",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound(format!("blob `{}`", id)));
    }
    debug!(blob_id = %id, "claimed blob");
    Ok(())
}

/// Release a blob on an existing connection or transaction. Tombstoned blobs
/// are released too, since the job claimed them while they were live.
pub(crate) async fn release_in(conn: &mut SqliteConnection, id: Uuid) -> StorageResult<bool> {
    let result = sqlx::query(
        "UPDATE blobs SET reference_count = reference_count - 1
         WHERE id = ? AND reference_count > 0",
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;
    let released = result.rows_affected() > 0;
    if released {
        debug!(blob_id = %id, "released blob");
    } else {
        debug!(blob_id = %id, "release ignored, no outstanding reference");
    }
    Ok(released)
}

/// Relative storage location: `{kind}/{aa}/{bb}/{digest}{ext}`.
pub fn storage_location(kind: BlobKind, digest: &ContentDigest, media_type: &str) -> String {
    let (shard_a, shard_b) = digest.shard();
    format!(
        "{}/{}/{}/{}{}",
        kind.as_str(),
        shard_a,
        shard_b,
        digest.to_hex(),
        extension_for(media_type)
    )
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" => ".jpg",
        "image/webp" => ".webp",
        _ => ".png",
    }
}

/// Lowercase and drop parameters (`image/png; charset=...` -> `image/png`).
fn normalize_media_type(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Keep only the final path component of a client filename; fall back to the
/// digest when nothing usable was supplied.
fn sanitize_filename(filename: &str, digest: &ContentDigest, media_type: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base.chars().any(|c| c.is_control()) {
        format!("{}{}", digest.to_hex(), extension_for(media_type))
    } else {
        base.to_string()
    }
}

/// Read pixel dimensions from the image header without decoding pixels.
fn image_dimensions(data: &[u8]) -> StorageResult<(u32, u32)> {
    image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .into_dimensions()
        .map_err(|err| StorageError::Validation(format!("invalid image file: {}", err)))
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_is_sharded_by_digest() {
        let digest = ContentDigest::compute(b"layout");
        let hex = digest.to_hex();
        let location = storage_location(BlobKind::PoseReference, &digest, "image/jpeg");
        assert_eq!(
            location,
            format!("pose-reference/{}/{}/{}.jpg", &hex[0..2], &hex[2..4], hex)
        );
    }

    #[test]
    fn media_type_parameters_are_dropped() {
        assert_eq!(normalize_media_type("Image/PNG; q=1"), "image/png");
    }

    #[test]
    fn filenames_lose_directories() {
        let digest = ContentDigest::compute(b"name");
        assert_eq!(
            sanitize_filename("../../etc/pose.png", &digest, "image/png"),
            "pose.png"
        );
        assert_eq!(
            sanitize_filename("", &digest, "image/webp"),
            format!("{}.webp", digest)
        );
    }

    #[test]
    fn dimension_bounds_are_inclusive() {
        let limits = IngestLimits::default();
        assert!(limits.check_dimensions(64, 4096).is_ok());
        assert!(limits.check_dimensions(63, 100).is_err());
        assert!(limits.check_dimensions(100, 4097).is_err());
    }
}
