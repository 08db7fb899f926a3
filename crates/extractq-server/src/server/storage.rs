//! Free-space checks on the cache volume.
//!
//! The guard only alerts; it never blocks a job. It is consulted before each
//! fetch and again after the fetched bytes are written.

use crate::server::notify::Notifier;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

#[async_trait]
pub trait StorageGuard: Send + Sync {
    async fn check_free_space(&self);
}

/// Alerts once when free space under `dir` drops below `min_free_bytes`, and
/// again only after space has recovered and dropped a second time.
pub struct FreeSpaceGuard {
    dir: PathBuf,
    min_free_bytes: u64,
    notifier: Arc<dyn Notifier>,
    low: Mutex<bool>,
}

impl FreeSpaceGuard {
    pub fn new(dir: impl Into<PathBuf>, min_free_bytes: u64, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            dir: dir.into(),
            min_free_bytes,
            notifier,
            low: Mutex::new(false),
        }
    }

    async fn available(&self) -> std::io::Result<u64> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || fs2::available_space(&dir))
            .await
            .map_err(std::io::Error::other)?
    }
}

#[async_trait]
impl StorageGuard for FreeSpaceGuard {
    async fn check_free_space(&self) {
        let available = match self.available().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Unable to query free space");
                return;
            }
        };

        let is_low = available < self.min_free_bytes;
        let newly_low = {
            let mut low = self.low.lock();
            let newly_low = is_low && !*low;
            *low = is_low;
            newly_low
        };

        if newly_low {
            let body = format!(
                "Free space under {} is {} MiB, below the {} MiB threshold.",
                self.dir.display(),
                available / (1024 * 1024),
                self.min_free_bytes / (1024 * 1024),
            );
            self.notifier.notify("Low disk space", &body).await;
        } else if is_low {
            tracing::debug!(available, "Free space still below threshold");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _subject: &str, _body: &str) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn alerts_once_while_low() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        let guard = FreeSpaceGuard::new(dir.path(), u64::MAX, notifier.clone());

        guard.check_free_space().await;
        guard.check_free_space().await;
        assert_eq!(notifier.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn quiet_when_space_is_plentiful() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        let guard = FreeSpaceGuard::new(dir.path(), 0, notifier.clone());

        guard.check_free_space().await;
        assert_eq!(notifier.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn missing_directory_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        let guard = FreeSpaceGuard::new(dir.path().join("nope"), u64::MAX, notifier.clone());

        guard.check_free_space().await;
        assert_eq!(notifier.calls.load(Ordering::Relaxed), 0);
    }
}
