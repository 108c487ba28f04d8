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

// Retention manager
//
// Periodic age and count eviction over the segment and snapshot
// directories. Works purely on file names; the frame path is never touched.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{CategoryPolicy, RecorderConfig};
use crate::error::PipelineError;
use crate::naming::{list_closed, sidecar_name, Category, ClosedEntry};
use crate::status::StatusTracker;

struct ManagedCategory {
    category: Category,
    dir: PathBuf,
    policy: CategoryPolicy,
}

/// Outcome of one scan over one category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: Category,
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub categories: Vec<CategoryReport>,
    /// The scan stopped early because shutdown was signalled
    pub interrupted: bool,
}

impl RetentionReport {
    pub fn total_deleted(&self) -> usize {
        self.categories.iter().map(|c| c.deleted).sum()
    }

    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == category)
    }
}

pub struct RetentionManager {
    categories: Vec<ManagedCategory>,
    interval: Duration,
    status: Option<Arc<StatusTracker>>,
}

impl RetentionManager {
    pub fn new(interval: Duration) -> Self {
        Self {
            categories: Vec::new(),
            interval,
            status: None,
        }
    }

    /// Manager for both categories as configured
    pub fn from_config(config: &RecorderConfig) -> Self {
        let mut manager = Self::new(config.retention.scan_interval()).with_category(
            Category::Segments,
            &config.recorder.segment_dir,
            config.retention.segments.clone(),
        );
        if config.detector.enabled {
            manager = manager.with_category(
                Category::Snapshots,
                &config.detector.snapshot_dir,
                config.retention.snapshots.clone(),
            );
        }
        manager
    }

    pub fn with_category(
        mut self,
        category: Category,
        dir: impl AsRef<Path>,
        policy: CategoryPolicy,
    ) -> Self {
        if policy.is_unbounded() {
            info!("Retention for {} is unbounded", category.as_str());
        }
        self.categories.push(ManagedCategory {
            category,
            dir: dir.as_ref().to_path_buf(),
            policy,
        });
        self
    }

    pub fn with_status(mut self, status: Arc<StatusTracker>) -> Self {
        self.status = Some(status);
        self
    }

    /// Scan every category once against the current time
    pub async fn scan(&self) -> RetentionReport {
        self.scan_at(Utc::now(), None).await
    }

    /// Scan every category once, treating `now` as the current time.
    ///
    /// When a shutdown receiver is given it is checked between deletions.
    pub async fn scan_at(
        &self,
        now: DateTime<Utc>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> RetentionReport {
        let mut report = RetentionReport::default();
        for managed in &self.categories {
            let (category_report, interrupted) = self.scan_category(managed, now, shutdown).await;
            report.categories.push(category_report);
            if interrupted {
                report.interrupted = true;
                break;
            }
        }

        let deleted = report.total_deleted();
        if deleted > 0 {
            if let Some(status) = &self.status {
                status.record_deletions(deleted as u64);
            }
        }
        report
    }

    async fn scan_category(
        &self,
        managed: &ManagedCategory,
        now: DateTime<Utc>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> (CategoryReport, bool) {
        let mut report = CategoryReport {
            category: managed.category,
            scanned: 0,
            deleted: 0,
            failed: 0,
            remaining: 0,
        };

        let entries = match list_closed(&managed.dir, managed.category).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Retention could not list {}: {}",
                    managed.dir.display(),
                    e
                );
                return (report, false);
            }
        };
        report.scanned = entries.len();

        let max_age = managed
            .policy
            .max_age()
            .and_then(|age| chrono::Duration::from_std(age).ok());
        let mut present = entries.len();
        let mut interrupted = false;

        for entry in &entries {
            let too_old = max_age.is_some_and(|age| now - entry.timestamp > age);
            let too_many = managed.policy.max_count.is_some_and(|max| present > max);
            if !too_old && !too_many {
                // Oldest first: nothing newer can be eligible
                break;
            }
            if shutdown.is_some_and(|signal| *signal.borrow()) {
                interrupted = true;
                break;
            }

            match delete_entry(managed.category, entry).await {
                Ok(()) => {
                    report.deleted += 1;
                    present -= 1;
                    debug!(
                        "Retention removed {} ({})",
                        entry.name,
                        if too_old { "age" } else { "count" }
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    if matches!(&e, DeleteFailure::Gone(_)) {
                        present -= 1;
                    }
                    warn!("{}", PipelineError::from(e));
                }
            }
        }

        report.remaining = present;
        if report.deleted > 0 || report.failed > 0 {
            info!(
                "Retention {}: scanned {}, deleted {}, failed {}, {} remaining",
                managed.category.as_str(),
                report.scanned,
                report.deleted,
                report.failed,
                report.remaining
            );
        }
        (report, interrupted)
    }

    /// Scan at startup and then every interval until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        info!("Retention manager started (interval {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let signal = shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.scan_at(Utc::now(), Some(&signal)).await;
                    if report.interrupted {
                        info!("Retention scan interrupted by shutdown");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Retention manager stopped");
        Ok(())
    }
}

enum DeleteFailure {
    /// Already removed by someone else
    Gone(PathBuf),
    Other(PathBuf, io::Error),
}

impl From<DeleteFailure> for PipelineError {
    fn from(failure: DeleteFailure) -> Self {
        match failure {
            DeleteFailure::Gone(path) => PipelineError::Delete {
                path,
                reason: "already gone".to_string(),
            },
            DeleteFailure::Other(path, e) => PipelineError::Delete {
                path,
                reason: e.to_string(),
            },
        }
    }
}

async fn delete_entry(category: Category, entry: &ClosedEntry) -> Result<(), DeleteFailure> {
    match fs::remove_file(&entry.path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DeleteFailure::Gone(entry.path.clone()))
        }
        Err(e) => return Err(DeleteFailure::Other(entry.path.clone(), e)),
    }

    if category == Category::Snapshots {
        let sidecar = entry.path.with_file_name(sidecar_name(&entry.name));
        match fs::remove_file(&sidecar).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove sidecar {}: {}", sidecar.display(), e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn touch(dir: &Path, category: Category, hours_ago: i64) -> PathBuf {
        let path = dir.join(category.file_name(now() - chrono::Duration::hours(hours_ago)));
        std::fs::write(&path, b"data").unwrap();
        path
    }

    #[tokio::test]
    async fn test_age_limit() {
        let dir = TempDir::new().unwrap();
        let old = touch(dir.path(), Category::Segments, 30);
        let fresh = touch(dir.path(), Category::Segments, 1);
        let manager = RetentionManager::new(Duration::from_secs(60)).with_category(
            Category::Segments,
            dir.path(),
            CategoryPolicy {
                max_age_seconds: Some(24 * 3600),
                max_count: None,
            },
        );

        let report = manager.scan_at(now(), None).await;
        assert_eq!(report.total_deleted(), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_snapshot_sidecar_removed_with_image() {
        let dir = TempDir::new().unwrap();
        let image = touch(dir.path(), Category::Snapshots, 5);
        let name = image.file_name().unwrap().to_str().unwrap().to_string();
        let sidecar = dir.path().join(sidecar_name(&name));
        std::fs::write(&sidecar, b"{}").unwrap();

        let manager = RetentionManager::new(Duration::from_secs(60)).with_category(
            Category::Snapshots,
            dir.path(),
            CategoryPolicy {
                max_age_seconds: Some(3600),
                max_count: None,
            },
        );
        manager.scan_at(now(), None).await;
        assert!(!image.exists());
        assert!(!sidecar.exists());
    }

    #[tokio::test]
    async fn test_partial_files_never_deleted() {
        let dir = TempDir::new().unwrap();
        let partial = dir
            .path()
            .join(Category::Segments.partial_name(now() - chrono::Duration::days(30)));
        std::fs::write(&partial, b"open").unwrap();

        let manager = RetentionManager::new(Duration::from_secs(60)).with_category(
            Category::Segments,
            dir.path(),
            CategoryPolicy {
                max_age_seconds: Some(60),
                max_count: Some(1),
            },
        );
        let report = manager.scan_at(now(), None).await;
        assert_eq!(report.total_deleted(), 0);
        assert!(partial.exists());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_scan() {
        let dir = TempDir::new().unwrap();
        for hours in 10..15 {
            touch(dir.path(), Category::Segments, hours);
        }
        let (tx, rx) = watch::channel(true);
        let manager = RetentionManager::new(Duration::from_secs(60)).with_category(
            Category::Segments,
            dir.path(),
            CategoryPolicy {
                max_age_seconds: Some(3600),
                max_count: None,
            },
        );

        let report = manager.scan_at(now(), Some(&rx)).await;
        assert!(report.interrupted);
        assert_eq!(report.total_deleted(), 0);
        drop(tx);
    }
}
