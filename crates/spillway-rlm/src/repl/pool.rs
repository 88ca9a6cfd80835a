//! REPL pool: runtime selection, bounded concurrency, and cleanup.
//!
//! Every control-loop run acquires a fresh handle with its own context;
//! handles are never shared or reused across runs. The pool's job is to
//! bound how many children exist at once, park released handles, and sweep
//! the parked ones on a timer.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::repl::{ReplBackend, ReplHandle, Runtime};

/// Maximum handles alive at once (parked + in flight).
pub const MAX_POOL_SIZE: usize = 3;
/// Parked handles older than this are destroyed by the sweeper.
const IDLE_TTL: Duration = Duration::from_secs(300);
/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct ParkedRepl {
    handle: ReplHandle,
    parked_at: Instant,
}

#[derive(Default)]
struct PoolInner {
    parked: Vec<ParkedRepl>,
    in_flight: usize,
}

/// Bounded roster of REPL handles.
pub struct ReplPool {
    inner: Mutex<PoolInner>,
    data_root: PathBuf,
    max_size: usize,
    idle_ttl: Duration,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReplPool {
    /// Create a pool with default limits and start its sweeper.
    pub fn new(data_root: PathBuf) -> Arc<Self> {
        Self::with_limits(data_root, MAX_POOL_SIZE, IDLE_TTL)
    }

    /// Create a pool with explicit limits.
    pub fn with_limits(data_root: PathBuf, max_size: usize, idle_ttl: Duration) -> Arc<Self> {
        let pool = Arc::new(Self {
            inner: Mutex::new(PoolInner::default()),
            data_root,
            max_size: max_size.max(1),
            idle_ttl,
            sweeper: std::sync::Mutex::new(None),
        });

        let weak: Weak<ReplPool> = Arc::downgrade(&pool);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(pool) => pool.sweep().await,
                    None => break,
                }
            }
        });
        *pool.sweeper.lock().unwrap() = Some(sweeper);

        pool
    }

    /// Resolve the runtime to use, falling back when the preferred
    /// interpreter is missing.
    ///
    /// Fallback order: compiled, scripting-fast, scripting-default. The
    /// scripting-fast runtime reports itself always available, so selection
    /// terminates.
    pub async fn select_runtime(&self, preferred: Runtime) -> Runtime {
        if ReplBackend::for_runtime(preferred).available().await {
            return preferred;
        }
        tracing::warn!(preferred = %preferred, "Preferred REPL runtime unavailable, falling back");

        for candidate in [
            Runtime::Compiled,
            Runtime::ScriptingFast,
            Runtime::ScriptingDefault,
        ] {
            if candidate == preferred {
                continue;
            }
            if ReplBackend::for_runtime(candidate).available().await {
                return candidate;
            }
        }
        Runtime::ScriptingFast
    }

    /// Create a fresh handle with the given context loaded.
    ///
    /// When the roster would exceed capacity, the least-recently-used parked
    /// handle is destroyed first.
    pub async fn acquire(&self, runtime: Runtime, context: &str) -> Result<ReplHandle> {
        {
            let mut inner = self.inner.lock().await;
            while inner.parked.len() + inner.in_flight >= self.max_size
                && !inner.parked.is_empty()
            {
                let lru = inner
                    .parked
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, p)| p.parked_at)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let mut victim = inner.parked.remove(lru);
                tracing::debug!(handle = %victim.handle.id(), "Evicting LRU parked REPL");
                victim.handle.destroy().await;
            }
            inner.in_flight += 1;
        }

        let backend = ReplBackend::for_runtime(runtime);
        match backend.create(context, &self.data_root).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.inner.lock().await.in_flight -= 1;
                Err(e)
            }
        }
    }

    /// Return a handle to the pool; it is parked until swept or evicted.
    pub async fn release(&self, handle: ReplHandle) {
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.parked.push(ParkedRepl {
            handle,
            parked_at: Instant::now(),
        });
    }

    /// Destroy a handle immediately instead of parking it.
    pub async fn discard(&self, mut handle: ReplHandle) {
        handle.destroy().await;
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Destroy parked handles past the idle TTL.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let mut i = 0;
            while i < inner.parked.len() {
                if now.duration_since(inner.parked[i].parked_at) >= self.idle_ttl {
                    expired.push(inner.parked.remove(i));
                } else {
                    i += 1;
                }
            }
        }

        for mut parked in expired {
            tracing::debug!(handle = %parked.handle.id(), "Sweeping idle REPL");
            parked.handle.destroy().await;
        }
    }

    /// Destroy everything, parked and all.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.abort();
        }
        let parked = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.parked)
        };
        for mut p in parked {
            p.handle.destroy().await;
        }
    }

    /// Number of parked handles.
    pub async fn parked_count(&self) -> usize {
        self.inner.lock().await.parked.len()
    }

    /// Number of handles currently lent out.
    pub async fn in_flight_count(&self) -> usize {
        self.inner.lock().await.in_flight
    }
}

impl Drop for ReplPool {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.abort();
        }
    }
}
