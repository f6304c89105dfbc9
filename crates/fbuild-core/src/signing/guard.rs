//! Signal-driven cleanup.
//!
//! If the process is interrupted mid-build the normal cleanup path never
//! runs. A single process-wide guard listens for termination signals,
//! removes everything each watched manager created, and exits with
//! `128 + signal` only once every cleanup has finished.

use dashmap::DashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{FbuildError, Result};
use crate::signing::manager::CredentialManager;

static GLOBAL: LazyLock<TerminationGuard> = LazyLock::new(TerminationGuard::new);

/// Signal that triggered the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl TerminationSignal {
    pub fn name(&self) -> &'static str {
        match self {
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Terminate => "SIGTERM",
        }
    }

    /// Shell convention for death by signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationSignal::Interrupt => 128 + 2,
            TerminationSignal::Terminate => 128 + 15,
        }
    }
}

/// Managers to clean up on SIGINT/SIGTERM, and the one task listening for them.
pub struct TerminationGuard {
    managers: DashMap<usize, CredentialManager>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TerminationGuard {
    fn new() -> Self {
        Self {
            managers: DashMap::new(),
            listener: Mutex::new(None),
        }
    }

    /// The guard shared by every build in this process.
    pub fn global() -> &'static TerminationGuard {
        &GLOBAL
    }

    /// Cleans up `manager` if the process is told to terminate.
    ///
    /// Starts the listener on first use; must be called from within a Tokio
    /// runtime. Signal handlers are registered before this returns, so a
    /// signal arriving immediately afterwards is not missed.
    pub fn watch(&'static self, manager: &CredentialManager) -> std::io::Result<()> {
        self.ensure_listening()?;
        self.track(manager);
        Ok(())
    }

    pub fn unwatch(&self, manager: &CredentialManager) {
        self.managers.remove(&manager.key());
    }

    pub fn is_watching(&self, manager: &CredentialManager) -> bool {
        self.managers.contains_key(&manager.key())
    }

    /// Whether a listener task is currently waiting for a signal.
    pub fn is_listening(&self) -> bool {
        self.lock_listener()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Runs `force_cleanup_all` on every watched manager at once and waits
    /// for all of them, aggregating failures.
    pub async fn cleanup_watched(&self) -> Result<()> {
        let managers: Vec<CredentialManager> =
            self.managers.iter().map(|e| e.value().clone()).collect();

        let mut tasks = JoinSet::new();
        for manager in managers {
            tasks.spawn(async move {
                let result = manager.force_cleanup_all().await;
                (manager, result)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((manager, Ok(()))) => self.unwatch(&manager),
                Ok((_, Err(e))) => errors.push(e),
                Err(e) => errors.push(FbuildError::Signing(format!("Cleanup task failed: {}", e))),
            }
        }

        FbuildError::aggregate("all watched builds", errors)
    }

    fn track(&self, manager: &CredentialManager) {
        self.managers.insert(manager.key(), manager.clone());
    }

    /// Spawns the listener unless one is alive. A listener whose runtime has
    /// shut down counts as dead.
    fn ensure_listening(&'static self) -> std::io::Result<()> {
        let mut listener = self.lock_listener();
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let signals = SignalListener::new()?;
        *listener = Some(tokio::spawn(async move {
            let signal = signals.recv().await;
            tracing::warn!(
                "Received {}, removing signing credentials of {} build(s) before exit",
                signal.name(),
                self.managers.len()
            );

            if let Err(e) = self.cleanup_watched().await {
                tracing::error!("Cleanup after {} incomplete: {}", signal.name(), e);
            }

            std::process::exit(signal.exit_code());
        }));

        tracing::debug!("Termination guard listening");
        Ok(())
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(unix)]
struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(mut self) -> TerminationSignal {
        tokio::select! {
            _ = self.interrupt.recv() => TerminationSignal::Interrupt,
            _ = self.terminate.recv() => TerminationSignal::Terminate,
        }
    }
}

#[cfg(not(unix))]
struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(self) -> TerminationSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        TerminationSignal::Interrupt
    }
}
