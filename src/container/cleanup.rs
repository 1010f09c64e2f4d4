// file: src/container/cleanup.rs
// version: 1.1.0
// guid: 9e4b2d71-6c0a-4f85-b3d8-5a1e7c9f2b06

//! Process-wide container cleanup on interrupt, terminate and hangup
//!
//! Registries register themselves here when they are created. The first
//! registration inside a tokio runtime installs one signal task for the whole
//! process; later registrations only add to the list.
//!
//! Work that holds host resources (mounts, partition mappings) registers its
//! cancellation token with [`cancel_on_signal`]. On a signal those tokens are
//! cancelled first and the handler waits up to [`RELEASE_GRACE`] for the
//! returned [`SignalScope`]s to drop before removing containers.

use super::registry::ContainerRegistry;
use crate::platform::ENGINE_CLI;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Name prefixes of containers this tool creates
pub const MANAGED_PREFIXES: &[&str] = &["turingpi-tools-", "turingpi-exec-", "turingpi-test-"];

/// Per-container budget for the CLI force-remove
pub const CLI_REMOVE_BUDGET: Duration = Duration::from_millis(200);

/// Exit code after interrupt or terminate
pub const SIGNAL_EXIT_CODE: i32 = 130;

/// How long the signal task waits for cancelled work to release its resources
pub const RELEASE_GRACE: Duration = Duration::from_secs(30);

struct Registrar {
    registries: Mutex<Vec<Weak<ContainerRegistry>>>,
    scopes: ScopeSet,
    signalled: AtomicBool,
    handler_installed: OnceLock<()>,
}

/// Cancellation tokens to trip on a signal, each paired with a "released" token
#[derive(Default)]
struct ScopeSet {
    entries: Mutex<Vec<(CancellationToken, CancellationToken)>>,
}

impl ScopeSet {
    fn add(&self, cancel: &CancellationToken) -> SignalScope {
        let released = CancellationToken::new();
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|(_, released)| !released.is_cancelled());
            entries.push((cancel.clone(), released.clone()));
        }
        SignalScope { released }
    }

    /// Cancel every scope, then wait up to `grace` for them to be released
    async fn cancel_and_drain(&self, grace: Duration) -> usize {
        let pending: Vec<CancellationToken> = match self.entries.lock() {
            Ok(mut entries) => entries
                .drain(..)
                .map(|(cancel, released)| {
                    cancel.cancel();
                    released
                })
                .collect(),
            Err(_) => return 0,
        };
        let waits = pending.iter().map(|released| released.cancelled());
        if tokio::time::timeout(grace, futures::future::join_all(waits)).await.is_err() {
            warn!("Cancelled work did not release within {:?}", grace);
        }
        pending.len()
    }
}

/// Marks cancelled work as released when dropped
#[must_use = "the scope counts as released as soon as it is dropped"]
pub struct SignalScope {
    released: CancellationToken,
}

impl Drop for SignalScope {
    fn drop(&mut self) {
        self.released.cancel();
    }
}

static REGISTRAR: OnceLock<Registrar> = OnceLock::new();

fn registrar() -> &'static Registrar {
    REGISTRAR.get_or_init(|| Registrar {
        registries: Mutex::new(Vec::new()),
        scopes: ScopeSet::default(),
        signalled: AtomicBool::new(false),
        handler_installed: OnceLock::new(),
    })
}

/// Cancel `cancel` when a shutdown signal arrives
///
/// Keep the scope alive until the work behind `cancel` has released its
/// resources; the signal handler waits for it before exiting.
pub fn cancel_on_signal(cancel: &CancellationToken) -> SignalScope {
    registrar().scopes.add(cancel)
}

/// Whether a shutdown signal has been received
pub fn signal_received() -> bool {
    registrar().signalled.load(Ordering::SeqCst)
}

/// Add a registry to the set the signal handler cleans
pub fn register(registry: &Arc<ContainerRegistry>) {
    let registrar = registrar();
    if let Ok(mut registries) = registrar.registries.lock() {
        registries.retain(|weak| weak.strong_count() > 0);
        registries.push(Arc::downgrade(registry));
    }
    install_signal_handler();
}

/// Install the signal task once; needs a running tokio runtime
pub fn install_signal_handler() {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No async runtime; container signal cleanup not installed");
        return;
    };

    let registrar = registrar();
    if registrar.handler_installed.set(()).is_err() {
        return;
    }

    handle.spawn(async {
        let signal = match wait_for_signal().await {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };
        let registrar = self::registrar();
        registrar.signalled.store(true, Ordering::SeqCst);
        let cancelled = registrar.scopes.cancel_and_drain(RELEASE_GRACE).await;
        info!(cancelled, "Received {}, cleaning up containers", signal.name());
        cleanup_all().await;
        signal.finish();
    });
}

/// Clean every live registry; used by the signal task and at normal exit
pub async fn cleanup_all() {
    let registries: Vec<Arc<ContainerRegistry>> = match registrar().registries.lock() {
        Ok(registries) => registries.iter().filter_map(Weak::upgrade).collect(),
        Err(_) => {
            warn!("Registrar lock poisoned; skipping container cleanup");
            return;
        }
    };

    for registry in registries {
        registry.emergency_cleanup().await;
    }
    info!("Container cleanup complete");
}

/// `docker rm -f <id>` bounded by [`CLI_REMOVE_BUDGET`]
pub(crate) async fn force_remove_cli(id: &str) {
    let status = Command::new(ENGINE_CLI)
        .args(["rm", "-f", id])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(CLI_REMOVE_BUDGET, status).await {
        Ok(Ok(status)) if status.success() => {}
        Ok(Ok(status)) => warn!(id, "CLI remove exited with {}", status),
        Ok(Err(e)) => warn!(id, "CLI remove failed: {}", e),
        Err(_) => warn!(id, "CLI remove exceeded {:?}", CLI_REMOVE_BUDGET),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl ShutdownSignal {
    fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
        }
    }

    /// Exit after interrupt/terminate, re-deliver anything else with the default action
    fn finish(self) {
        match self {
            Self::Interrupt | Self::Terminate => std::process::exit(SIGNAL_EXIT_CODE),
            Self::Hangup => reraise_hangup(),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::select! {
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = terminate.recv() => ShutdownSignal::Terminate,
        _ = hangup.recv() => ShutdownSignal::Hangup,
    })
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

#[cfg(unix)]
fn reraise_hangup() {
    // SAFETY: resetting a disposition and raising a signal on our own process
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_DFL);
        libc::raise(libc::SIGHUP);
    }
}

#[cfg(not(unix))]
fn reraise_hangup() {
    std::process::exit(SIGNAL_EXIT_CODE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_prefixes_are_distinct() {
        for (i, a) in MANAGED_PREFIXES.iter().enumerate() {
            assert!(a.starts_with("turingpi-"));
            for b in &MANAGED_PREFIXES[i + 1..] {
                assert!(!a.starts_with(b) && !b.starts_with(a));
            }
        }
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.name(), "SIGINT");
        assert_eq!(ShutdownSignal::Hangup.name(), "SIGHUP");
    }

    #[tokio::test]
    async fn test_scopes_cancelled_and_awaited() {
        let scopes = ScopeSet::default();
        let cancel = CancellationToken::new();
        let scope = scopes.add(&cancel);
        let released = Arc::new(AtomicBool::new(false));

        let worker = {
            let cancel = cancel.clone();
            let released = Arc::clone(&released);
            tokio::spawn(async move {
                cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                released.store(true, Ordering::SeqCst);
                drop(scope);
            })
        };

        assert_eq!(scopes.cancel_and_drain(Duration::from_secs(5)).await, 1);
        assert!(cancel.is_cancelled());
        assert!(released.load(Ordering::SeqCst));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_grace() {
        let scopes = ScopeSet::default();
        let cancel = CancellationToken::new();
        let _held = scopes.add(&cancel);

        let started = std::time::Instant::now();
        assert_eq!(scopes.cancel_and_drain(Duration::from_millis(50)).await, 1);
        assert!(cancel.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_released_scopes_are_pruned() {
        let scopes = ScopeSet::default();
        drop(scopes.add(&CancellationToken::new()));
        let _live = scopes.add(&CancellationToken::new());
        assert_eq!(scopes.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_all_without_registries() {
        tokio::time::timeout(Duration::from_secs(1), cleanup_all())
            .await
            .unwrap();
    }
}
