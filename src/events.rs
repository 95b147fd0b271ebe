use crate::record::TransferRecord;
use log::{debug, error, warn};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

/// A lifecycle event of one transfer, carrying the record snapshot.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Start(TransferRecord),
    Progress(TransferRecord),
    Error(TransferRecord),
    Finish(PathBuf, TransferRecord),
    Remove(TransferRecord),
}

impl TransferEvent {
    pub fn record(&self) -> &TransferRecord {
        match self {
            TransferEvent::Start(r)
            | TransferEvent::Progress(r)
            | TransferEvent::Error(r)
            | TransferEvent::Finish(_, r)
            | TransferEvent::Remove(r) => r,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransferEvent::Start(_) => "start",
            TransferEvent::Progress(_) => "progress",
            TransferEvent::Error(_) => "error",
            TransferEvent::Finish(..) => "finish",
            TransferEvent::Remove(_) => "remove",
        }
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Callback),
    Flush(oneshot::Sender<()>),
}

/// Serial execution context for listener callbacks.
///
/// Closures posted here run one after another, in posting order, on a single
/// consumer task.
#[derive(Clone)]
pub struct CallbackContext {
    tx: mpsc::Sender<Message>,
}

impl CallbackContext {
    /// Spawns the consumer on the current runtime.
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Run(callback) => {
                        if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                            error!("[Callback] Listener panicked, continuing");
                        }
                    }
                    Message::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("[Callback] Context closed");
        });
        Self { tx }
    }

    /// Queues `callback`, waiting for room when the queue is full.
    pub async fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Message::Run(Box::new(callback))).await.is_err() {
            warn!("[Callback] Context is gone, callback dropped");
        }
    }

    /// Resolves once everything posted before this call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}
