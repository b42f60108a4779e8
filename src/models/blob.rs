//! Represents a content-addressed blob (an uploaded reference image).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Category tag for an uploaded blob.
///
/// The kind partitions the on-disk layout (`{kind}/{aa}/{bb}/{digest}{ext}`)
/// but is not part of a blob's identity: identical bytes uploaded under two
/// kinds resolve to the first stored record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum BlobKind {
    PoseReference,
    StyleReference,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::PoseReference => "pose-reference",
            BlobKind::StyleReference => "style-reference",
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pose-reference" => Ok(BlobKind::PoseReference),
            "style-reference" => Ok(BlobKind::StyleReference),
            other => Err(format!("unknown blob kind `{}`", other)),
        }
    }
}

/// Metadata row for a stored blob. The bytes themselves live on disk at
/// `storage_path`, relative to the store's root directory.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredBlob {
    /// Opaque stable identifier handed to clients.
    pub id: Uuid,

    /// Lowercase hex SHA-256 of the raw bytes; the dedup key.
    pub digest: String,

    pub kind: BlobKind,

    /// Filename supplied with the first upload of this content.
    pub filename: String,

    pub media_type: String,

    pub byte_size: i64,

    pub width: Option<i64>,

    pub height: Option<i64>,

    /// Relative path, sharded by digest prefix.
    pub storage_path: String,

    /// Number of generation jobs currently holding this blob.
    pub reference_count: i64,

    pub created_at: DateTime<Utc>,

    /// Refreshed on every dedup hit and claim; drives reclamation.
    pub last_touched_at: DateTime<Utc>,

    /// Tombstone: hidden from lookups while the bytes stay on disk.
    pub is_deleted: bool,
}

/// Column list shared by every blob query.
pub const BLOB_COLUMNS: &str = "id, digest, kind, filename, media_type, byte_size, width, height, \
     storage_path, reference_count, created_at, last_touched_at, is_deleted";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [BlobKind::PoseReference, BlobKind::StyleReference] {
            assert_eq!(kind.as_str().parse::<BlobKind>().unwrap(), kind);
        }
        assert!("pose_image".parse::<BlobKind>().is_err());
    }
}
