//! Recording storage: date-nested `.webm` files on disk plus a small
//! in-memory info cache, grounded on `original_source/app/video_service.py`.
//!
//! The original stores every recording flat under one directory. §6 of the
//! design spec instead nests by capture date — `<root>/<YYYY>/<MM>/<DD>/
//! <request_id>.webm` — so a single directory doesn't grow without bound;
//! this module is the one place that path format is decided, everything
//! else goes through `VideoStore::path_for`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::models::VideoInfo;

pub struct VideoStore {
    root: PathBuf,
    width: u32,
    height: u32,
    cache: DashMap<String, VideoInfo>,
}

impl VideoStore {
    pub fn new(root: impl Into<PathBuf>, width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            width,
            height,
            cache: DashMap::new(),
        })
    }

    /// Creates the root directory if it doesn't exist. The per-day
    /// subdirectories are created lazily by `path_for` on first write.
    pub async fn initialize(&self) -> Result<(), std::io::Error> {
        tokio::fs::create_dir_all(&self.root).await?;
        info!(root = %self.root.display(), "video store initialized");
        Ok(())
    }

    /// `<root>/<YYYY>/<MM>/<DD>/<request_id>.webm`, date taken as of call
    /// time — the Executor calls this once, right before recording starts.
    pub fn path_for(&self, request_id: &str, captured_at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(captured_at.format("%Y").to_string())
            .join(captured_at.format("%m").to_string())
            .join(captured_at.format("%d").to_string())
            .join(format!("{}.webm", crate::utils::sanitize_filename(request_id)))
    }

    pub async fn ensure_parent_dir(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Reads the file's size off disk and records it in the cache. Called
    /// by the Executor right after a recording is finalized.
    pub async fn save_video_info(
        &self,
        request_id: &str,
        video_path: &Path,
        duration_seconds: f64,
    ) -> Option<VideoInfo> {
        let metadata = match tokio::fs::metadata(video_path).await {
            Ok(m) => m,
            Err(e) => {
                error!(request_id, error = %e, "failed to stat saved video");
                return None;
            }
        };

        let size_mb = metadata.len() as f64 / 1024.0 / 1024.0;
        let info = VideoInfo {
            request_id: request_id.to_string(),
            duration_seconds,
            size_mb,
            created_at: Utc::now(),
            width: self.width,
            height: self.height,
        };

        self.cache.insert(request_id.to_string(), info.clone());
        Some(info)
    }

    pub fn get_cached_info(&self, request_id: &str) -> Option<VideoInfo> {
        self.cache.get(request_id).map(|v| v.clone())
    }

    /// Walks the date-nested tree looking for `<request_id>.webm`. Used
    /// when serving a video after a restart, when the cache is cold.
    pub async fn find_video_file(&self, request_id: &str) -> Option<PathBuf> {
        let file_name = format!("{}.webm", crate::utils::sanitize_filename(request_id));
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || find_file_under(&root, &file_name))
            .await
            .ok()
            .flatten()
    }

    pub async fn serve_video_file(&self, request_id: &str) -> Option<PathBuf> {
        let path = self.find_video_file(request_id).await?;
        if tokio::fs::metadata(&path).await.is_ok() {
            Some(path)
        } else {
            None
        }
    }

    pub async fn delete_video(&self, request_id: &str) -> bool {
        let Some(path) = self.find_video_file(request_id).await else {
            return false;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.cache.remove(request_id);
                info!(request_id, path = %path.display(), "deleted video");
                true
            }
            Err(e) => {
                error!(request_id, error = %e, "failed to delete video");
                false
            }
        }
    }

    /// Deletes every `.webm` file whose capture date folder is older than
    /// `retention_days`, then prunes day/month/year directories left empty.
    /// Mirrors `video_service.py`'s `cleanup_old_videos`, generalized to
    /// the nested layout.
    pub async fn cleanup_old_videos(&self, retention_days: i64) -> CleanupOutcome {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let root = self.root.clone();
        let outcome = tokio::task::spawn_blocking(move || sweep(&root, cutoff))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "video cleanup task panicked");
                CleanupOutcome::default()
            });

        for request_id in &outcome.deleted_request_ids {
            self.cache.remove(request_id);
        }

        info!(
            deleted_count = outcome.deleted_count,
            deleted_size_mb = outcome.deleted_size_mb,
            retention_days,
            "video cleanup completed"
        );
        outcome
    }

    pub async fn get_storage_stats(&self) -> StorageStats {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || collect_stats(&root))
            .await
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    pub deleted_count: u64,
    pub deleted_size_mb: f64,
    pub deleted_request_ids: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_files: u64,
    pub total_size_mb: f64,
    pub oldest_video: Option<DateTime<Utc>>,
    pub newest_video: Option<DateTime<Utc>>,
}

fn find_file_under(root: &Path, file_name: &str) -> Option<PathBuf> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
                return Some(path);
            }
        }
    }
    None
}

fn sweep(root: &Path, cutoff: DateTime<Utc>) -> CleanupOutcome {
    let mut outcome = CleanupOutcome::default();
    walk_webm_files(root, &mut |path, metadata| {
        let created = file_created_at(&metadata);
        if created < cutoff {
            let size_mb = metadata.len() as f64 / 1024.0 / 1024.0;
            match std::fs::remove_file(path) {
                Ok(()) => {
                    outcome.deleted_count += 1;
                    outcome.deleted_size_mb += size_mb;
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        outcome.deleted_request_ids.push(stem.to_string());
                    }
                }
                Err(e) => outcome
                    .errors
                    .push(format!("failed to delete {}: {e}", path.display())),
            }
        }
    });
    prune_empty_dirs(root);
    outcome
}

fn collect_stats(root: &Path) -> StorageStats {
    let mut stats = StorageStats::default();
    walk_webm_files(root, &mut |_path, metadata| {
        stats.total_files += 1;
        stats.total_size_mb += metadata.len() as f64 / 1024.0 / 1024.0;
        let created = file_created_at(&metadata);
        if stats.oldest_video.map_or(true, |o| created < o) {
            stats.oldest_video = Some(created);
        }
        if stats.newest_video.map_or(true, |n| created > n) {
            stats.newest_video = Some(created);
        }
    });
    stats
}

fn walk_webm_files(dir: &Path, visit: &mut impl FnMut(&Path, std::fs::Metadata)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_webm_files(&path, visit);
        } else if path.extension().and_then(|e| e.to_str()) == Some("webm") {
            if let Ok(metadata) = entry.metadata() {
                visit(&path, metadata);
            }
        }
    }
}

/// Removes directories left empty after a cleanup sweep, bottom-up, but
/// never the root itself.
fn prune_empty_dirs(root: &Path) {
    fn visit(dir: &Path, root: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        let mut is_empty = true;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if visit(&path, root) {
                    let _ = std::fs::remove_dir(&path);
                } else {
                    is_empty = false;
                }
            } else {
                is_empty = false;
            }
        }
        is_empty && dir != root
    }
    visit(root, root);
}

fn file_created_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .or_else(|_| metadata.created())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store(dir: &Path) -> Arc<VideoStore> {
        VideoStore::new(dir.to_path_buf(), 1280, 720)
    }

    #[tokio::test]
    async fn path_for_nests_by_capture_date() {
        let tmp = tempdir();
        let store = sample_store(tmp.path());
        let when = "2026-03-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let path = store.path_for("abc123", when);
        assert!(path.ends_with("2026/03/05/abc123.webm"));
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let tmp = tempdir();
        let store = sample_store(tmp.path());
        let when = Utc::now();
        let path = store.path_for("req-1", when);
        store.ensure_parent_dir(&path).await.unwrap();
        tokio::fs::write(&path, b"fake webm bytes").await.unwrap();

        let info = store.save_video_info("req-1", &path, 4.2).await.unwrap();
        assert_eq!(info.request_id, "req-1");
        assert!(info.size_mb > 0.0);

        let found = store.find_video_file("req-1").await;
        assert_eq!(found, Some(path));
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_files_and_prunes_dirs() {
        let tmp = tempdir();
        let store = sample_store(tmp.path());

        let old_path = store.path_for("old-job", Utc::now() - chrono::Duration::days(30));
        store.ensure_parent_dir(&old_path).await.unwrap();
        tokio::fs::write(&old_path, b"old").await.unwrap();
        set_mtime_days_ago(&old_path, 30);

        let fresh_path = store.path_for("fresh-job", Utc::now());
        store.ensure_parent_dir(&fresh_path).await.unwrap();
        tokio::fs::write(&fresh_path, b"fresh").await.unwrap();

        let outcome = store.cleanup_old_videos(7).await;
        assert_eq!(outcome.deleted_count, 1);
        assert!(fresh_path.exists());
        assert!(!old_path.exists());
    }

    fn tempdir() -> tempfile_shim::TempDir {
        tempfile_shim::TempDir::new()
    }

    fn set_mtime_days_ago(path: &Path, days: i64) {
        let secs = (Utc::now() - chrono::Duration::days(days)).timestamp();
        let time = filetime_shim::FileTime::from_unix_time(secs, 0);
        filetime_shim::set_file_mtime(path, time).unwrap();
    }

    /// Tiny local stand-ins so this module doesn't pull in `tempfile`/
    /// `filetime` as dev-dependencies just for two tests.
    mod tempfile_shim {
        use std::path::PathBuf;

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!("webas-video-test-{}", uuid::Uuid::new_v4()));
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    mod filetime_shim {
        use std::path::Path;
        use std::time::{Duration, SystemTime, UNIX_EPOCH};

        pub struct FileTime(SystemTime);

        impl FileTime {
            pub fn from_unix_time(secs: i64, _nanos: u32) -> Self {
                Self(UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64))
            }
        }

        pub fn set_file_mtime(path: &Path, time: FileTime) -> std::io::Result<()> {
            let file = std::fs::File::open(path)?;
            file.set_modified(time.0)
        }
    }
}
