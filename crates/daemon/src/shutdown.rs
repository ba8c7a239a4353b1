//! Daemon-wide cancellation.
//!
//! Blocked connection reads are woken by shutting down the read half of every
//! registered stream; sleeping loops wait on the token's condvar.

use std::collections::HashMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

#[derive(Default)]
struct State {
    cancelled: bool,
    streams: HashMap<u64, UnixStream>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    wake: Condvar,
    next_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Flag shutdown and wake everything waiting on this token.
    pub fn cancel(&self) {
        let mut state = self.inner.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        debug!(streams = state.streams.len(), "cancelling");
        for stream in state.streams.values() {
            let _ = stream.shutdown(Shutdown::Read);
        }
        self.inner.wake.notify_all();
    }

    /// Sleep up to `timeout`. Returns `true` if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.inner.lock();
        let (state, _) = self
            .inner
            .wake
            .wait_timeout_while(state, timeout, |s| !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        state.cancelled
    }

    /// Track `stream` so that cancellation interrupts reads on it. The
    /// registration lasts as long as the returned guard.
    #[must_use]
    pub fn register(&self, stream: &UnixStream) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.lock();
        match stream.try_clone() {
            Ok(clone) => {
                if state.cancelled {
                    let _ = clone.shutdown(Shutdown::Read);
                }
                state.streams.insert(id, clone);
            }
            Err(e) => trace!(%e, "cannot track stream for shutdown"),
        }
        Registration {
            inner: Arc::clone(&self.inner),
            id,
        }
    }
}

pub struct Registration {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.lock().streams.remove(&self.id);
    }
}
