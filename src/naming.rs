// On-disk naming scheme shared by the recorder, detector, retention and catalog.
//
// Names embed a fixed-width UTC timestamp so lexical order is chronological:
//   video_20261014_073100_123.seg
//   anomaly_20261014_073100_123.jpg (+ anomaly_20261014_073100_123.json)
// Files still being written carry an extra ".part" suffix and never match.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::io;
use std::path::{Path, PathBuf};

pub const PARTIAL_SUFFIX: &str = ".part";
pub const SIDECAR_EXTENSION: &str = "json";

const DATE_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Kind of artifact managed on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Segments,
    Snapshots,
}

impl Category {
    pub fn prefix(self) -> &'static str {
        match self {
            Category::Segments => "video_",
            Category::Snapshots => "anomaly_",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Category::Segments => "seg",
            Category::Snapshots => "jpg",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Segments => "segments",
            Category::Snapshots => "snapshots",
        }
    }

    /// Final (visible) file name for an artifact starting at `timestamp`
    pub fn file_name(self, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}{}.{}",
            self.prefix(),
            format_timestamp(timestamp),
            self.extension()
        )
    }

    /// Hidden in-progress name for the same artifact
    pub fn partial_name(self, timestamp: DateTime<Utc>) -> String {
        format!("{}{}", self.file_name(timestamp), PARTIAL_SUFFIX)
    }

    /// Parse the timestamp out of a finalized file name.
    ///
    /// Accepts names with or without the millisecond field.
    pub fn parse(self, name: &str) -> Option<DateTime<Utc>> {
        let stem = name
            .strip_prefix(self.prefix())?
            .strip_suffix(self.extension())?
            .strip_suffix('.')?;
        parse_timestamp(stem)
    }
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    format!(
        "{}_{:03}",
        timestamp.format(DATE_FORMAT),
        timestamp.timestamp_subsec_millis()
    )
}

fn parse_timestamp(stem: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(stem, DATE_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }

    let (date, millis) = stem.rsplit_once('_')?;
    if millis.len() != 3 || !millis.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let millis: i64 = millis.parse().ok()?;
    let naive = NaiveDateTime::parse_from_str(date, DATE_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive) + chrono::Duration::milliseconds(millis))
}

/// Sidecar metadata name for a snapshot image name
pub fn sidecar_name(snapshot_name: &str) -> String {
    let stem = snapshot_name
        .strip_suffix(Category::Snapshots.extension())
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(snapshot_name);
    format!("{}.{}", stem, SIDECAR_EXTENSION)
}

/// True for names that are a bare file name (no separators or parent refs)
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// A finalized artifact found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedEntry {
    pub name: String,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// List the finalized entries of `category` under `dir`, oldest first.
///
/// Partial files and names that do not match the scheme are ignored. A
/// missing directory lists as empty.
pub async fn list_closed(dir: &Path, category: Category) -> io::Result<Vec<ClosedEntry>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut closed = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(timestamp) = category.parse(&name) else {
            continue;
        };
        closed.push(ClosedEntry {
            path: entry.path(),
            name,
            timestamp,
        });
    }

    closed.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
    Ok(closed)
}
