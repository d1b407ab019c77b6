use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use super::{StatusSink, Transition};

/// Reports waiting for delivery before new ones are dropped
const QUEUE_CAPACITY: usize = 1024;

/// Puts a slow status sink behind a queue.
///
/// `report` only enqueues, so the scan loop never waits on the remote service.
/// One background task hands transitions to the wrapped sink in queue order.
/// A transition that does not fit is logged and dropped, like a failed report.
#[derive(Clone)]
pub struct ReportQueue {
    tx: mpsc::Sender<Transition>,
}

impl ReportQueue {
    /// Start the delivery task. It ends once every queue handle is dropped and
    /// the backlog has been delivered.
    pub fn spawn<S: StatusSink + 'static>(sink: S) -> (Self, JoinHandle<()>) {
        Self::with_capacity(sink, QUEUE_CAPACITY)
    }

    pub fn with_capacity<S: StatusSink + 'static>(
        sink: S,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Transition>(capacity);

        let handle = tokio::spawn(async move {
            while let Some(transition) = rx.recv().await {
                sink.report(&transition).await;
            }
            tracing::debug!("Report queue drained");
        });

        (Self { tx }, handle)
    }
}

impl StatusSink for ReportQueue {
    async fn report(&self, transition: &Transition) {
        match self.tx.try_send(transition.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => tracing::warn!(
                "Report queue full, dropping {} {:?} for {}",
                dropped.identifier,
                dropped.status,
                dropped.address
            ),
            Err(TrySendError::Closed(dropped)) => tracing::warn!(
                "Report queue closed, dropping {} {:?} for {}",
                dropped.identifier,
                dropped.status,
                dropped.address
            ),
        }
    }
}
