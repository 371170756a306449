use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::error::{HlsError, HlsResult};

/// Runs the tasks of a client session under a shared cancellation token.
///
/// The first error of any task is reported through the error channel. Errors
/// of tasks that stop because of cancellation are discarded.
#[derive(Clone)]
pub(crate) struct RoutinePool {
    token: CancellationToken,
    tracker: TaskTracker,
    errors: mpsc::Sender<HlsError>,
}

impl RoutinePool {
    pub(crate) fn new() -> (Self, mpsc::Receiver<HlsError>) {
        let (errors, rx) = mpsc::channel(1);
        let pool = Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            errors,
        };
        (pool, rx)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn run<F>(&self, task: F)
    where
        F: Future<Output = HlsResult<()>> + Send + 'static,
    {
        let token = self.token.clone();
        let errors = self.errors.clone();
        self.tracker.spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = task => result,
            };
            if let Err(err) = result {
                if token.is_cancelled() {
                    return;
                }
                // only the first error matters
                let _ = errors.try_send(err);
            }
        });
    }

    /// Cancels every task and waits for them to finish.
    pub(crate) async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
