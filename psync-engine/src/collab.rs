/// Collaborator seams supplied to the engine at construction
///
/// The engine never probes for optional collaborators at runtime; absence
/// is a typed `Option` or a provider that returns `None`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use psync_core::{ProgressRecord, Result};

/// Supplies the bearer token for progress API calls.
///
/// Returning `None` is a precondition failure, handled identically to
/// being offline: the operation goes to the outbox.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Reports whether the device currently has connectivity
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Invoked after every optimistic update and applied merge so local state
/// survives a process restart independent of network sync.
pub trait LocalPersistence: Send + Sync {
    fn persist(&self, records: &[ProgressRecord]) -> Result<()>;
}

/// Time source, injected so tests can run deterministically
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds
    fn now_ms(&self) -> i64;
}

/// Wall-clock time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Token provider holding a fixed, replaceable token
pub struct StaticTokenProvider {
    token: Mutex<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Mutex::new(token),
        }
    }

    /// Replace the stored token (e.g. after a refresh or sign-out)
    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock() = token;
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }
}

/// Probe that always reports connectivity
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Probe whose state tests flip between online and offline
pub struct SwitchableProbe {
    online: AtomicBool,
}

impl SwitchableProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl ConnectivityProbe for SwitchableProbe {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Manually advanced clock for deterministic tests
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
