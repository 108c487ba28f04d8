// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Storage traits for segment and snapshot artifacts

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::protocol::AnomalyEvent;

/// Destination for recorded segments
///
/// Implementations must make a segment visible under its final name only once
/// `finalize` has completed; until then it must not look closed to a listing.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Prepare the store (create directories, clear leftovers from a crash)
    async fn initialize(&self) -> Result<()>;

    /// Open a new, not yet visible segment starting at `start`
    async fn open_segment(&self, start: DateTime<Utc>) -> Result<Box<dyn SegmentSink>>;

    /// Health check
    async fn health_check(&self) -> Result<bool>;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;
}

/// An open segment file
#[async_trait]
pub trait SegmentSink: Send {
    /// Name the segment will carry once finalized
    fn final_path(&self) -> &Path;

    /// Append bytes to the segment
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Flush, sync and publish the segment under its final name
    async fn finalize(self: Box<Self>) -> Result<PathBuf>;

    /// Discard the segment without ever making it visible
    async fn abandon(self: Box<Self>) -> Result<()>;
}

/// Snapshot content handed to a `SnapshotStore`
#[derive(Debug, Clone)]
pub struct SnapshotDraft {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub score: f32,
    pub threshold: f32,
    pub jpeg: Vec<u8>,
}

/// Destination for anomaly snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    /// Persist the snapshot and return the resulting event
    async fn persist(&self, draft: SnapshotDraft) -> Result<AnomalyEvent>;

    async fn health_check(&self) -> Result<bool>;

    fn backend_type(&self) -> &str;
}
