use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Run mode, selected by CLI/config (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    NoBuild,
    KeysOnly,
}

/// Centralizes what the source kept in a global mutable `app.config` dict.
/// One `RunContext` per worker process; peers each own an independent value
/// pointing at the same shared filesystem paths. Counters are atomics so the
/// type stays `Sync`-safe even though the current design has no in-process
/// parallelism (see design notes on promotion).
pub struct RunContext {
    pub arch: String,
    pub target: String,
    pub defdir: PathBuf,
    pub tmp: PathBuf,
    pub artifacts: PathBuf,
    pub mode: Mode,
    pub instances: u32,
    pub fork: u32,
    /// Cleared (set to `None`) the first time a remote call fails, per
    /// "any failure disables the remote for the rest of the run".
    pub kbas_url: RefCell<Option<String>>,
    pub kbas_password: Option<String>,
    pub min_gigabytes: u64,
    pub artifact_version: Option<String>,
    pub reproduce: bool,
    pub cache_log: Option<PathBuf>,
    pub log_verbose: bool,

    pub total: AtomicU64,
    pub tasks: AtomicU64,
    pub keys: RefCell<Vec<String>>,
    pub reproduced: RefCell<Vec<(String, String)>>,
}

impl RunContext {
    pub fn is_lead(&self) -> bool {
        self.fork == 0
    }

    /// Whether a remote `GET` should be attempted. Only the URL is
    /// required — KBAS serves anonymous reads, and a password is a
    /// push-only gate.
    pub fn remote_readable(&self) -> bool {
        self.kbas_url.borrow().is_some()
    }

    /// Whether a remote `POST` (upload) should be attempted. Requires both
    /// a URL and a real password; the default "insecure" password never
    /// authorizes an upload.
    pub fn remote_writable(&self) -> bool {
        self.kbas_url.borrow().is_some()
            && self.kbas_password.as_deref().is_some_and(|p| p != "insecure")
    }

    pub fn disable_remote(&self) {
        *self.kbas_url.borrow_mut() = None;
    }

    pub fn record_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task(&self) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_live_key(&self, key: String) {
        self.keys.borrow_mut().push(key);
    }

    pub fn is_live_key(&self, key: &str) -> bool {
        self.keys.borrow().iter().any(|k| k == key)
    }

    pub fn record_reproduction(&self, md5: String, key: String) {
        self.reproduced.borrow_mut().push((md5, key));
    }
}
