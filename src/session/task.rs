//! Cancellable wrapper around long-running remote calls.
//!
//! A `CancellableTask` drives a pending remote operation to completion while a
//! progress surface holds its cancellation token. The remote future runs as its
//! own task; the wrapper polls it and the token at a fixed interval. Whichever
//! is observed first wins: a finished future completes even if cancellation was
//! requested afterwards, and a cancellation seen while the future is still
//! pending aborts it and suppresses the completion callback.

use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::host::ProgressSurface;
use crate::service::ServiceResult;

/// Outcome of a cancellable task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Cancelled,
    Resolved,
    Failed,
}

/// A remote call surfaced with a title and a cancellation token
pub struct CancellableTask<T> {
    title: String,
    future: BoxFuture<'static, ServiceResult<T>>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl<T: Send + 'static> CancellableTask<T> {
    pub fn new(
        title: impl Into<String>,
        future: BoxFuture<'static, ServiceResult<T>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            title: title.into(),
            future,
            poll_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Title shown on the progress surface
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Token that aborts the call while it is pending
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the remote call to completion.
    ///
    /// `on_complete` runs at most once, within this task, and only when the
    /// call resolved successfully before any observed cancellation. Failures
    /// are expected to be reported by a handler attached to the future itself.
    pub async fn run<F>(self, progress: &dyn ProgressSurface, on_complete: F) -> TaskState
    where
        F: FnOnce(T),
    {
        progress.begin(&self.title, self.cancel.clone());

        let mut remote = tokio::spawn(self.future);
        let state = loop {
            if remote.is_finished() {
                break match (&mut remote).await {
                    Ok(Ok(value)) => {
                        on_complete(value);
                        TaskState::Resolved
                    }
                    Ok(Err(e)) => {
                        debug!("{} failed: {}", self.title, e);
                        TaskState::Failed
                    }
                    Err(e) => {
                        warn!("{} panicked or was aborted: {}", self.title, e);
                        TaskState::Failed
                    }
                };
            }

            if self.cancel.is_cancelled() {
                remote.abort();
                debug!("{} cancelled", self.title);
                break TaskState::Cancelled;
            }

            tokio::time::sleep(self.poll_interval).await;
        };

        progress.end(&self.title);
        state
    }
}
