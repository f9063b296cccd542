//! Test-facing concurrency helpers, Tokio-realized.
//!
//! A test's "do something that blocks on the server" code runs as a
//! spawned task joined with a timeout via `tokio::time::timeout` around
//! its `JoinHandle`, re-raising whatever the task panicked with.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// A handle to a task spawned by [`go`]. Await `.result(timeout)` to get
/// its output, propagating a panic as `Error::UserResponderError` and a
/// missed deadline as `Error::Timeout`.
pub struct GoHandle<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> GoHandle<T> {
    pub async fn result(self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join_err)) => Err(Error::UserResponderError(format!(
                "spawned task panicked: {join_err}"
            ))),
            Err(_) => Err(Error::Timeout("go() future didn't complete in time".into())),
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Run `fut` on a new task and return a handle to collect its result.
pub fn go<F>(fut: F) -> GoHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    GoHandle {
        handle: tokio::task::spawn(fut),
    }
}

/// Run `background` as a spawned task while awaiting `body`. If `body`
/// errors, its error is returned; if `background` errors (and `body`
/// didn't), that error is logged via `tracing` and swallowed.
pub async fn going<B, G>(body: B, background: G) -> Result<B::Output>
where
    B: Future<Output = Result<<B as Future>::Output>>,
    G: Future<Output = Result<()>> + Send + 'static,
    G::Output: Send,
{
    let bg_handle = tokio::task::spawn(background);
    let body_result = body.await;
    match body_result {
        Ok(value) => {
            bg_handle.abort();
            Ok(value)
        }
        Err(body_err) => {
            if let Ok(Err(bg_err)) = bg_handle.await {
                tracing::error!("error in going(): {bg_err}");
            }
            Err(body_err)
        }
    }
}

/// Poll `predicate` roughly every 50ms until it returns `true` or `timeout`
/// elapses.
pub async fn wait_until<F>(mut predicate: F, description: &str, timeout: Duration) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(description.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
