//! Advisory cross-process lock for the document file.
//!
//! The lock is a directory next to the document (`data.json.lock`),
//! created with an atomic `create_dir`. The holder writes an owner file
//! containing a random token and refreshes it on a heartbeat interval; a
//! lock whose owner file has not been refreshed within the staleness
//! window is presumed dead and may be taken over. If the owner token
//! changes while we nominally hold the lock, the lock is *compromised*:
//! another process stole it after staleness, and release reports it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use wacast_core::config::LockConfig;
use wacast_core::error::{Result, WacastError};

fn lock_dir_for(doc_path: &Path) -> PathBuf {
    let mut name = doc_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".into());
    name.push_str(".lock");
    doc_path.with_file_name(name)
}

fn owner_path(lock_dir: &Path) -> PathBuf {
    lock_dir.join("owner")
}

/// Whether the lock at `lock_dir` has gone stale (holder presumed dead).
fn is_stale(lock_dir: &Path, stale_ms: u64) -> bool {
    let meta = std::fs::metadata(owner_path(lock_dir))
        .or_else(|_| std::fs::metadata(lock_dir));
    let Ok(meta) = meta else {
        // Owner file not written yet and dir unreadable; treat as live.
        return false;
    };
    match meta.modified().ok().and_then(|m| m.elapsed().ok()) {
        Some(age) => age > Duration::from_millis(stale_ms),
        None => false,
    }
}

/// A held document lock. Must be released via [`DocumentLock::release`]
/// so compromise is surfaced; dropping without release still cleans up
/// best-effort.
#[derive(Debug)]
pub struct DocumentLock {
    lock_dir: PathBuf,
    token: String,
    compromised: Arc<AtomicBool>,
    heartbeat: tokio::task::JoinHandle<()>,
    released: bool,
}

/// Re-export of the lock tuning block for callers that only use this module.
pub type LockOptions = LockConfig;

impl DocumentLock {
    /// Acquire the lock for `doc_path`, retrying with bounded jittered
    /// backoff. All failure modes map to [`WacastError::StoreBusy`].
    pub async fn acquire(doc_path: &Path, opts: &LockConfig) -> Result<Self> {
        let lock_dir = lock_dir_for(doc_path);
        let mut delay = opts.retry_min_delay_ms.max(1);
        let mut attempts = 0u32;

        loop {
            match std::fs::create_dir(&lock_dir) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&lock_dir, opts.stale_ms) {
                        tracing::warn!(lock = %lock_dir.display(), "taking over stale document lock");
                        let _ = std::fs::remove_dir_all(&lock_dir);
                        continue;
                    }
                }
                Err(e) => {
                    return Err(WacastError::StoreBusy(format!(
                        "cannot create lock dir {}: {e}",
                        lock_dir.display()
                    )));
                }
            }

            attempts += 1;
            if attempts >= opts.retries {
                return Err(WacastError::StoreBusy(
                    "document lock is held by another process".into(),
                ));
            }

            let jitter = rand::thread_rng().gen_range(0..=delay / 4 + 1);
            tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
            delay = (delay * 2).min(opts.retry_max_delay_ms.max(opts.retry_min_delay_ms));
        }

        let token = uuid::Uuid::new_v4().to_string();
        if let Err(e) = std::fs::write(owner_path(&lock_dir), &token) {
            let _ = std::fs::remove_dir_all(&lock_dir);
            return Err(WacastError::StoreBusy(format!("cannot write lock owner: {e}")));
        }

        let compromised = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat_loop(
            lock_dir.clone(),
            token.clone(),
            opts.heartbeat_ms,
            Arc::clone(&compromised),
        ));

        Ok(Self {
            lock_dir,
            token,
            compromised,
            heartbeat,
            released: false,
        })
    }

    /// Release the lock. Returns `StoreBusy` if the lock was found
    /// compromised while held — the caller's write may have raced another
    /// process and should be treated as contended.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.heartbeat.abort();

        let owned = std::fs::read_to_string(owner_path(&self.lock_dir))
            .map(|t| t == self.token)
            .unwrap_or(false);

        if owned {
            let _ = std::fs::remove_dir_all(&self.lock_dir);
        }

        if self.compromised.load(Ordering::SeqCst) || !owned {
            return Err(WacastError::StoreBusy(
                "document lock was compromised while held".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.heartbeat.abort();
        let still_ours = std::fs::read_to_string(owner_path(&self.lock_dir))
            .map(|t| t == self.token)
            .unwrap_or(false);
        if still_ours {
            let _ = std::fs::remove_dir_all(&self.lock_dir);
        }
    }
}

/// Refresh the owner file so other processes see the lock as live; stop
/// and flag compromise the moment the token no longer matches.
async fn heartbeat_loop(
    lock_dir: PathBuf,
    token: String,
    heartbeat_ms: u64,
    compromised: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(heartbeat_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // first tick fires immediately

    loop {
        interval.tick().await;
        let current = std::fs::read_to_string(owner_path(&lock_dir)).unwrap_or_default();
        if current != token {
            compromised.store(true, Ordering::SeqCst);
            tracing::warn!(lock = %lock_dir.display(), "document lock compromised");
            return;
        }
        if std::fs::write(owner_path(&lock_dir), &token).is_err() {
            compromised.store(true, Ordering::SeqCst);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_doc(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wacast-lock-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("data.json")
    }

    fn quick_opts() -> LockConfig {
        LockConfig {
            stale_ms: 60_000,
            heartbeat_ms: 50,
            retries: 3,
            retry_min_delay_ms: 10,
            retry_max_delay_ms: 20,
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let doc = temp_doc("basic");
        let lock = DocumentLock::acquire(&doc, &quick_opts()).await.unwrap();
        assert!(lock_dir_for(&doc).exists());
        lock.release().unwrap();
        assert!(!lock_dir_for(&doc).exists());
    }

    #[tokio::test]
    async fn test_contention_is_store_busy() {
        let doc = temp_doc("contend");
        let opts = quick_opts();
        let held = DocumentLock::acquire(&doc, &opts).await.unwrap();

        let err = DocumentLock::acquire(&doc, &opts).await.unwrap_err();
        assert!(err.is_store_busy());

        held.release().unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_takeover() {
        let doc = temp_doc("stale");
        let lock_dir = lock_dir_for(&doc);
        // Fake a dead holder: lock dir + owner file, no heartbeat.
        std::fs::create_dir(&lock_dir).unwrap();
        std::fs::write(owner_path(&lock_dir), "dead-process").unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let mut opts = quick_opts();
        opts.stale_ms = 50;
        let lock = DocumentLock::acquire(&doc, &opts).await.unwrap();
        lock.release().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_live() {
        let doc = temp_doc("live");
        let mut opts = quick_opts();
        opts.stale_ms = 200;
        opts.heartbeat_ms = 40;
        let held = DocumentLock::acquire(&doc, &opts).await.unwrap();

        // Long after the original mtime would have gone stale, the
        // heartbeat must still be defending the lock.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let err = DocumentLock::acquire(&doc, &opts).await.unwrap_err();
        assert!(err.is_store_busy());

        held.release().unwrap();
    }

    #[tokio::test]
    async fn test_compromised_lock_surfaces_on_release() {
        let doc = temp_doc("stolen");
        let opts = quick_opts();
        let held = DocumentLock::acquire(&doc, &opts).await.unwrap();

        // Another process "steals" the lock by rewriting the owner file.
        std::fs::write(owner_path(&lock_dir_for(&doc)), "thief").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let err = held.release().unwrap_err();
        assert!(err.is_store_busy());
    }
}
