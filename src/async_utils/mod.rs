//! Asynchronous utilities for use with Tokio.
//!
//! Every pipeline stage runs as a background task. We keep the glue for
//! spawning, cancelling and joining those tasks here, so the stages themselves
//! can just be straight-line `async fn`s that return [`Result`].

use std::pin::Pin;

use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A handle for a named background worker. This can be awaited to wait for the
/// worker to complete, or aborted to cancel it at its next suspension point.
pub struct JoinWorker {
    /// A human-readable name, for error messages.
    name: &'static str,

    /// The task handle.
    handle: JoinHandle<Result<()>>,
}

impl JoinWorker {
    /// Spawn `future` as a new background worker.
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    /// The name of this worker.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Has the worker exited, either normally or because it was aborted?
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the worker. Anything it owns, including channel endpoints, is
    /// dropped, which closes those channels.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the worker to complete. A worker that was aborted counts as a
    /// normal exit. Panics are propagated.
    pub async fn join(self) -> Result<()> {
        let Self { name, handle } = self;
        match handle.await {
            Ok(result) => result.with_context(|| format!("{name} failed")),
            Err(err) if err.is_cancelled() => {
                debug!("{} was cancelled", name);
                Ok(())
            }
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(err).with_context(|| format!("could not join {name}")),
        }
    }
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // Blocking tasks are never aborted, so this only happens if the runtime
        // is shutting down underneath us.
        Err(err) => panic!("blocking task failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn aborted_worker_joins_cleanly() {
        let worker = JoinWorker::spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        worker.abort();
        worker.join().await.unwrap();
    }

    #[tokio::test]
    async fn worker_errors_carry_worker_name() {
        let worker = JoinWorker::spawn("broken", async { Err(anyhow!("boom")) });
        let err = worker.join().await.unwrap_err();
        assert!(format!("{err:?}").contains("broken failed"));
    }

    #[test]
    #[cfg(unix)]
    fn failed_command_reports_exit_code() {
        use std::os::unix::process::ExitStatusExt as _;

        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(2 << 8),
            stdout: vec![],
            stderr: b"no such file".to_vec(),
        };
        let err = check_for_command_failure("tesseract", &output).unwrap_err();
        assert!(err.to_string().contains("exit code 2"));
    }
}
