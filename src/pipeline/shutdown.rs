//! Drain-based shutdown.
//!
//! On a stop signal we cancel intake (the ticker and the manager), which
//! closes the page and marker channels. The OCR stage and the sink are left
//! running, so every page already handed downstream is written before we
//! exit.

use tokio::sync::watch;

use crate::{async_utils::JoinWorker, prelude::*};

use super::{manager::ManagerHandle, sink::SinkHandle, ticker::Ticker};

/// Where we are in the shutdown sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    /// Everything is running.
    Running,

    /// Intake has stopped, and downstream stages are finishing their work.
    Draining,

    /// The sink has written its last result.
    Stopped,
}

/// Owns every pipeline worker, and tears them down in order.
pub struct ShutdownCoordinator {
    ticker: Ticker,
    manager: ManagerHandle,
    ocr_stage: JoinWorker,
    sink: SinkHandle,
    state: watch::Sender<ShutdownState>,
}

impl ShutdownCoordinator {
    /// Take ownership of a running pipeline.
    pub fn new(
        ticker: Ticker,
        manager: ManagerHandle,
        ocr_stage: JoinWorker,
        sink: SinkHandle,
    ) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            ticker,
            manager,
            ocr_stage,
            sink,
            state,
        }
    }

    /// The manager, for requesting discovery passes.
    pub fn manager(&self) -> &ManagerHandle {
        &self.manager
    }

    /// Watch our [`ShutdownState`].
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ShutdownState) {
        debug!(?state, "shutdown state changed");
        self.state.send_replace(state);
    }

    /// Run until `shutdown` completes or the sink finishes on its own, then
    /// drain and join every worker. Returns the first worker error.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let signalled = tokio::select! {
            () = shutdown => true,
            () = self.sink.write_loop_stopped() => false,
        };

        self.set_state(ShutdownState::Draining);
        self.ticker.stop();
        if signalled {
            info!("received stop signal, cleaning up");
            self.manager.stop();
        } else if !self.manager.is_finished() {
            // One-shot mode, or a downstream failure. Let the manager finish
            // processing completions instead of cancelling it.
            debug!("sink finished; waiting for the manager");
        }
        if self.sink.is_alive() {
            debug!("waiting for the sink to drain");
            self.sink.write_loop_stopped().await;
        }
        self.set_state(ShutdownState::Stopped);
        info!("stopping application");

        let Self {
            manager,
            ocr_stage,
            sink,
            ..
        } = self;
        let results = [
            ("manager", manager.join().await),
            (ocr_stage.name(), ocr_stage.join().await),
            ("sink", sink.join().await),
        ];
        let mut first_err = None;
        for (name, result) in results {
            if let Err(err) = result {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    error!("{} also failed: {:?}", name, err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Wait for SIGINT or SIGTERM. If we can't listen for signals, this never
/// completes.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => debug!("received SIGINT"),
            Err(err) => {
                warn!("failed to listen for Ctrl+C: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                if term.recv().await.is_some() {
                    debug!("received SIGTERM");
                } else {
                    std::future::pending::<()>().await;
                }
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
