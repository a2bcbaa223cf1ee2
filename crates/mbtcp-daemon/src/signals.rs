//! Unix signal handling for `mbtcp serve`.
//!
//! SIGTERM and SIGINT stop the server; SIGHUP is recorded so the serve loop
//! can report that live reload is unsupported. Handlers only touch atomics;
//! a watcher thread moves the flags into the shared [`SignalState`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Signal types that the daemon handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate = 1,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt = 2,
    /// SIGHUP - Hangup.
    Hangup = 3,
}

impl SignalKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Terminate),
            2 => Some(Self::Interrupt),
            3 => Some(Self::Hangup),
            _ => None,
        }
    }

    fn stops_server(self) -> bool {
        matches!(self, Self::Terminate | Self::Interrupt)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Signal flags shared between the watcher thread and the serve loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    reload_requested: AtomicBool,
    signal_count: AtomicU32,
    last_signal: AtomicU8,
}

impl SignalState {
    /// Create a state with no signal recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Check if reload has been requested (and clear the flag).
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::SeqCst)
    }

    /// Request shutdown (can be called from any thread).
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Record a delivered signal and raise the matching request.
    pub fn deliver(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::SeqCst);
        self.last_signal.store(kind as u8, Ordering::SeqCst);
        if kind.stops_server() {
            self.request_shutdown();
        } else {
            self.reload_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Total number of signals delivered.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// The most recent signal, if any.
    pub fn last_signal(&self) -> Option<SignalKind> {
        SignalKind::from_u8(self.last_signal.load(Ordering::SeqCst))
    }
}

/// Pending signal numbers, written only from the async-signal handler.
#[cfg(unix)]
static PENDING: [AtomicBool; 3] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

#[cfg(unix)]
extern "C" fn on_signal(signum: libc::c_int) {
    let slot = match signum {
        libc::SIGTERM => 0,
        libc::SIGINT => 1,
        libc::SIGHUP => 2,
        _ => return,
    };
    PENDING[slot].store(true, Ordering::SeqCst);
}

/// Handle for signal management.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Install handlers for SIGTERM, SIGINT and SIGHUP.
    ///
    /// On non-Unix platforms only [`SignalHandler::request_shutdown`] works.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a handler cannot be installed or the watcher
    /// thread cannot be spawned.
    pub fn install() -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::new()),
        };

        #[cfg(unix)]
        handler.register_unix_handlers()?;

        Ok(handler)
    }

    #[cfg(unix)]
    fn register_unix_handlers(&self) -> std::io::Result<()> {
        const KINDS: [SignalKind; 3] = [
            SignalKind::Terminate,
            SignalKind::Interrupt,
            SignalKind::Hangup,
        ];

        let state = Arc::clone(&self.state);
        thread::Builder::new()
            .name("mbtcp-signals".into())
            .spawn(move || loop {
                for (slot, kind) in KINDS.iter().enumerate() {
                    if PENDING[slot].swap(false, Ordering::SeqCst) {
                        info!(signal = %kind, "Signal received");
                        state.deliver(*kind);
                    }
                }
                if state.shutdown_requested() {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            })?;

        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        for signum in [libc::SIGTERM, libc::SIGINT, libc::SIGHUP] {
            // SAFETY: `on_signal` only stores to a static atomic, which is
            // async-signal-safe.
            let previous = unsafe { libc::signal(signum, handler) };
            if previous == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }

        debug!("Unix signal handlers registered");
        Ok(())
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Check if reload has been requested (clears the flag).
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.state.take_reload_request()
    }

    /// Manually request shutdown.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Get the signal state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

/// Block until shutdown is requested or `timeout` expires.
///
/// Returns `true` if shutdown was requested.
pub fn wait_for_shutdown(handler: &SignalHandler, timeout: Duration) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(50);

    loop {
        if handler.shutdown_requested() {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return false;
        }
        thread::sleep(poll_interval.min(timeout - elapsed));
    }
}
