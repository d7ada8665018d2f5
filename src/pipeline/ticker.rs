//! Periodic callbacks.
//!
//! A [`Ticker`] owns one driver task, which sleeps until the earliest entry is
//! due, fires every due entry and reschedules it `interval` later. Each firing
//! runs as its own task, so a slow callback delays neither the driver nor the
//! other callbacks. If a callback is still running when it comes due again,
//! that firing is skipped.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::{self, JoinHandle, JoinSet},
    time::{Instant, sleep_until},
};

use crate::{async_utils::BoxedFuture, prelude::*};

/// A callback which can be run repeatedly.
pub type TickFn = Arc<dyn Fn() -> BoxedFuture<Result<()>> + Send + Sync>;

/// Messages from a [`Ticker`] to its driver.
enum Command {
    Schedule { callback: TickFn, interval: Duration },
}

/// A scheduled callback.
struct Entry {
    id: usize,
    next: Instant,
    interval: Duration,
    callback: TickFn,
    running: bool,
}

/// Runs callbacks periodically until stopped or dropped.
pub struct Ticker {
    commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
}

impl Ticker {
    /// Start a new ticker with no callbacks. Must be called from inside a
    /// Tokio runtime.
    pub fn new() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        Self {
            commands,
            driver: tokio::spawn(drive(rx)),
        }
    }

    /// Call `callback` every `interval`, starting `interval` from now.
    pub fn schedule(&self, callback: TickFn, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(anyhow!("ticker interval must be greater than zero"));
        }
        self.commands
            .send(Command::Schedule { callback, interval })
            .map_err(|_| anyhow!("ticker has been stopped"))
    }

    /// Stop the ticker. Callbacks which are currently running are cancelled.
    pub fn stop(&self) {
        if !self.driver.is_finished() {
            debug!("stopping ticker");
        }
        self.driver.abort();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Sleep until `deadline`, or forever if there isn't one.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The driver task. Dropping it drops `running`, which aborts all in-flight
/// callbacks.
async fn drive(mut commands: mpsc::UnboundedReceiver<Command>) {
    // Sorted by `next`.
    let mut entries: Vec<Entry> = vec![];
    let mut running: JoinSet<Result<()>> = JoinSet::new();
    let mut running_ids: HashMap<task::Id, usize> = HashMap::new();
    let mut next_id = 0;

    loop {
        let deadline = entries.first().map(|entry| entry.next);
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Schedule { callback, interval }) => {
                    entries.push(Entry {
                        id: next_id,
                        next: Instant::now() + interval,
                        interval,
                        callback,
                        running: false,
                    });
                    next_id += 1;
                    entries.sort_by_key(|entry| entry.next);
                }
                None => return,
            },
            () = sleep_until_opt(deadline) => {
                let now = Instant::now();
                for entry in entries.iter_mut().take_while(|entry| entry.next <= now) {
                    if entry.running {
                        debug!(entry = entry.id, "previous run still active; skipping tick");
                    } else {
                        entry.running = true;
                        let callback = entry.callback.clone();
                        let handle = running.spawn(async move { callback().await });
                        running_ids.insert(handle.id(), entry.id);
                    }
                    entry.next = now + entry.interval;
                }
                entries.sort_by_key(|entry| entry.next);
            }
            Some(joined) = running.join_next_with_id(), if !running.is_empty() => {
                let (task_id, result) = match joined {
                    Ok((task_id, result)) => (task_id, result),
                    Err(err) => {
                        let task_id = err.id();
                        (task_id, Err(anyhow!("periodic callback panicked: {err}")))
                    }
                };
                if let Some(entry_id) = running_ids.remove(&task_id) {
                    if let Some(entry) = entries.iter_mut().find(|entry| entry.id == entry_id) {
                        entry.running = false;
                    }
                }
                if let Err(err) = result {
                    warn!("periodic callback failed: {:?}", err);
                }
            }
        }
    }
}
