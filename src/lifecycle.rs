//! Process lifecycle: `Running -> ShuttingDown -> Terminated`

use crate::ebpf::maps::PinnedMap;
use crate::ebpf::ringbuf::CloseHandle;
use crate::{HooktailError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared handle on the agent's lifecycle state
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<LifecycleState>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn begin_shutdown(&self) -> Result<()> {
        self.transition(LifecycleState::Running, LifecycleState::ShuttingDown)
    }

    pub fn terminate(&self) -> Result<()> {
        self.transition(LifecycleState::ShuttingDown, LifecycleState::Terminated)
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        let mut current = from;
        let changed = self.state.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });

        if !changed {
            return Err(HooktailError::InvalidTransition {
                from: current.to_string(),
                to: to.to_string(),
            });
        }

        debug!("Lifecycle {} -> {}", from, to);
        Ok(())
    }

    /// Wait for `signal`, then close the reader and remove the published map
    ///
    /// The reader is closed first so no pending read races the removal. A
    /// failed removal is returned to the caller as fatal. The reader is also
    /// closed when waiting for the signal fails, so the consumer never
    /// outlives this task.
    pub async fn shutdown_on<F>(
        self,
        signal: F,
        reader: CloseHandle,
        pinned: Option<PinnedMap>,
    ) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        if let Err(e) = signal.await {
            reader.close();
            return Err(e);
        }
        info!("Shutdown signal received");

        self.begin_shutdown()?;
        reader.close();

        if let Some(pinned) = pinned {
            pinned.remove()?;
        }
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Abort a spawned shutdown task and wait until it has been dropped
///
/// Anything the task owns (a published map in particular) is released by
/// the time this returns.
pub async fn cancel_shutdown(task: JoinHandle<Result<()>>) {
    task.abort();
    let _ = task.await;
}

/// Resolve on SIGINT or SIGTERM
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => debug!("SIGINT"),
        _ = terminate.recv() => debug!("SIGTERM"),
    }
    Ok(())
}
