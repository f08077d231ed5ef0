//! Request envelopes passed from handles to worker tasks.

use tokio::sync::{mpsc, oneshot};

/// A request the worker confirms once it has been applied.
#[derive(Debug)]
pub(crate) struct Acked<R> {
    pub(crate) request: R,
    done: Done,
}

impl<R> Acked<R> {
    /// Confirm the request.
    pub(crate) fn complete(self) {
        self.done.complete();
    }

    /// Take the request by value, confirming it later.
    pub(crate) fn into_parts(self) -> (R, Done) {
        (self.request, self.done)
    }
}

/// Confirmation half of an [`Acked`] request.
#[derive(Debug)]
pub(crate) struct Done(oneshot::Sender<()>);

impl Done {
    /// The submitter may have given up waiting.
    pub(crate) fn complete(self) {
        let _ = self.0.send(());
    }
}

/// Hand `request` to a worker and wait until it has been applied.
///
/// Returns `false` if the worker is gone.
pub(crate) async fn submit<R>(queue: &mpsc::Sender<Acked<R>>, request: R) -> bool {
    let (done, applied) = oneshot::channel();
    if queue.send(Acked { request, done: Done(done) }).await.is_err() {
        return false;
    }
    applied.await.is_ok()
}

/// Send a query to a worker and wait for its answer.
pub(crate) async fn ask<Q, A>(
    queue: &mpsc::Sender<Q>,
    query: impl FnOnce(oneshot::Sender<A>) -> Q,
) -> Option<A> {
    let (reply, answer) = oneshot::channel();
    queue.send(query(reply)).await.ok()?;
    answer.await.ok()
}
