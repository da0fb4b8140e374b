//! Worker process context.
//!
//! All the in-process mutable state of the worker lives here with the
//! lifetime of the process: cached per-user messengers, the in-flight
//! job guard, the tick re-entrancy flag, and the log rate limiters.
//! None of it is persistent; a restart starts clean.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use wacast_core::config::WorkerConfig;
use wacast_core::error::{Result, WacastError};
use wacast_core::time::now_ms;
use wacast_core::traits::{Messenger, MessengerFactory};
use wacast_store::DurableStore;

/// Shared context threaded through the tick and every per-job dispatch.
pub struct WorkerRuntime {
    pub store: DurableStore,
    pub config: WorkerConfig,
    factory: Arc<dyn MessengerFactory>,
    messengers: Mutex<HashMap<String, Arc<dyn Messenger>>>,
    connecting: Mutex<HashSet<String>>,
    in_flight: Mutex<HashSet<String>>,
    tick_running: AtomicBool,
    clocks: Mutex<RateClocks>,
}

#[derive(Default)]
struct RateClocks {
    last_guard_log_ms: i64,
    last_busy_log_ms: i64,
    last_sync_ms: i64,
    last_desync_by_user: HashMap<String, i64>,
}

impl WorkerRuntime {
    pub fn new(
        store: DurableStore,
        config: WorkerConfig,
        factory: Arc<dyn MessengerFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            factory,
            messengers: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            tick_running: AtomicBool::new(false),
            clocks: Mutex::new(RateClocks::default()),
        })
    }

    /// Cached messenger for a user, or a channel error if none is
    /// connected yet. Connections are established by [`Self::sync_messengers`].
    pub fn messenger_for(&self, user_id: &str) -> Result<Arc<dyn Messenger>> {
        self.messengers
            .lock()
            .map_err(|_| WacastError::Channel("messenger map poisoned".into()))?
            .get(user_id)
            .cloned()
            .ok_or_else(|| WacastError::Channel("whatsapp is not connected".into()))
    }

    /// Insert a live messenger, e.g. once a connect task completes.
    pub fn insert_messenger(&self, user_id: &str, messenger: Arc<dyn Messenger>) {
        if let Ok(mut map) = self.messengers.lock() {
            map.insert(user_id.to_string(), messenger);
        }
        if let Ok(mut connecting) = self.connecting.lock() {
            connecting.remove(user_id);
        }
    }

    /// Lazily connect messengers for users that lack one, at most once
    /// per sync interval. Connections run in the background so a slow
    /// handshake never stalls the tick.
    pub fn sync_messengers(self: &Arc<Self>, user_ids: &[String]) {
        {
            let Ok(mut clocks) = self.clocks.lock() else { return };
            let now = now_ms();
            if now - clocks.last_sync_ms < self.config.messenger_sync_interval_ms as i64 {
                return;
            }
            clocks.last_sync_ms = now;
        }

        for user_id in user_ids {
            let already = self
                .messengers
                .lock()
                .map(|m| m.contains_key(user_id))
                .unwrap_or(true);
            if already {
                continue;
            }
            {
                let Ok(mut connecting) = self.connecting.lock() else { continue };
                if !connecting.insert(user_id.clone()) {
                    continue;
                }
            }

            let runtime = Arc::clone(self);
            let user_id = user_id.clone();
            tokio::spawn(async move {
                match runtime.factory.connect(&user_id).await {
                    Ok(messenger) => {
                        tracing::info!(user = %user_id, "messenger connected");
                        runtime.insert_messenger(&user_id, messenger);
                    }
                    Err(e) => {
                        tracing::warn!(user = %user_id, "messenger connect failed: {e}");
                        if let Ok(mut connecting) = runtime.connecting.lock() {
                            connecting.remove(&user_id);
                        }
                    }
                }
            });
        }
    }

    /// Tick re-entrancy guard. Returns false when a previous tick is
    /// still running; the caller skips instead of queueing.
    pub fn try_begin_tick(&self) -> bool {
        !self.tick_running.swap(true, Ordering::SeqCst)
    }

    pub fn end_tick(&self) {
        self.tick_running.store(false, Ordering::SeqCst);
    }

    /// Per-job in-process guard against double-dispatch within one
    /// process. Key shape is `user:job`. Not a cross-process guard.
    /// A panicked holder cannot leave the set inconsistent, so a
    /// poisoned mutex is recovered rather than stalling all dispatch.
    pub fn try_begin_job(&self, user_id: &str, job_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(format!("{user_id}:{job_id}"))
    }

    pub fn end_job(&self, user_id: &str, job_id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&format!("{user_id}:{job_id}"));
    }

    /// Skipped-tick log throttle.
    pub fn should_log_guard(&self, now: i64) -> bool {
        let Ok(mut clocks) = self.clocks.lock() else { return false };
        if now - clocks.last_guard_log_ms >= self.config.guard_log_interval_ms {
            clocks.last_guard_log_ms = now;
            true
        } else {
            false
        }
    }

    /// Store-busy log throttle.
    pub fn should_log_busy(&self, now: i64) -> bool {
        let Ok(mut clocks) = self.clocks.lock() else { return false };
        if now - clocks.last_busy_log_ms >= self.config.guard_log_interval_ms {
            clocks.last_busy_log_ms = now;
            true
        } else {
            false
        }
    }

    /// Per-user session-desync log/flag throttle.
    pub fn should_flag_desync(&self, user_id: &str, now: i64) -> bool {
        let Ok(mut clocks) = self.clocks.lock() else { return false };
        let last = clocks.last_desync_by_user.get(user_id).copied().unwrap_or(0);
        if now - last >= self.config.desync_log_interval_ms {
            clocks.last_desync_by_user.insert(user_id.to_string(), now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use wacast_core::config::LockConfig;

    struct NoFactory;

    #[async_trait]
    impl MessengerFactory for NoFactory {
        async fn connect(&self, _user_id: &str) -> Result<Arc<dyn Messenger>> {
            Err(WacastError::Channel("unavailable".into()))
        }
    }

    fn runtime() -> Arc<WorkerRuntime> {
        let dir = std::env::temp_dir().join(format!("wacast-rt-{}", uuid::Uuid::new_v4()));
        let store = DurableStore::with_paths(dir, LockConfig::default(), "admin", "admin123");
        WorkerRuntime::new(store, WorkerConfig::default(), Arc::new(NoFactory))
    }

    #[tokio::test]
    async fn test_tick_guard_skips_overlap() {
        let rt = runtime();
        assert!(rt.try_begin_tick());
        assert!(!rt.try_begin_tick());
        rt.end_tick();
        assert!(rt.try_begin_tick());
    }

    #[tokio::test]
    async fn test_job_guard_is_per_user_and_job() {
        let rt = runtime();
        assert!(rt.try_begin_job("u1", "j1"));
        assert!(!rt.try_begin_job("u1", "j1"));
        assert!(rt.try_begin_job("u2", "j1"));
        rt.end_job("u1", "j1");
        assert!(rt.try_begin_job("u1", "j1"));
    }

    #[tokio::test]
    async fn test_job_guard_survives_poisoned_mutex() {
        let rt = runtime();
        let poisoner = Arc::clone(&rt);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.in_flight.lock().unwrap();
            panic!("poison the guard");
        })
        .join();

        assert!(rt.try_begin_job("u1", "j1"));
        assert!(!rt.try_begin_job("u1", "j1"));
        rt.end_job("u1", "j1");
        assert!(rt.try_begin_job("u1", "j1"));
    }

    #[tokio::test]
    async fn test_desync_throttle_is_per_user() {
        let rt = runtime();
        assert!(rt.should_flag_desync("u1", 100_000));
        assert!(!rt.should_flag_desync("u1", 100_500));
        assert!(rt.should_flag_desync("u2", 100_500));
        assert!(rt.should_flag_desync("u1", 100_000 + rt.config.desync_log_interval_ms));
    }

    #[tokio::test]
    async fn test_missing_messenger_is_channel_error() {
        let rt = runtime();
        let err = rt.messenger_for("nobody").err().unwrap();
        assert!(matches!(err, WacastError::Channel(_)));
    }
}
