use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::TicketStore;
use crate::types::NewMessage;

const QUEUE_CAPACITY: usize = 1024;

/// Writes one message row and then bumps its ticket. The bump is advisory
/// (UI sort order) so its failure is logged and does not fail the write.
pub enum Persister {
    Direct(Arc<dyn TicketStore>),
    Batched(BatchQueue),
}

impl Persister {
    pub async fn write(&self, message: NewMessage) -> Result<String, StoreError> {
        match self {
            Persister::Direct(store) => {
                let id = store.insert_message(&message).await?;
                bump_ticket(store.as_ref(), &message.ticket_id, message.created_at).await;
                Ok(id)
            }
            Persister::Batched(queue) => queue.submit(message).await,
        }
    }

    /// Flushes and stops the batch writer, if any.
    pub async fn close(&self) {
        if let Persister::Batched(queue) = self {
            queue.close().await;
        }
    }
}

async fn bump_ticket(store: &dyn TicketStore, ticket_id: &str, at: DateTime<Utc>) {
    if let Err(err) = store.bump_ticket(ticket_id, at).await {
        warn!(ticket_id = %ticket_id, error = %err, "ticket bump failed; last activity is stale");
    }
}

struct PendingMessage {
    message: NewMessage,
    ack: oneshot::Sender<Result<String, StoreError>>,
}

/// Process-local write queue drained by a single task, so batched writes
/// within one process are serialized.
pub struct BatchQueue {
    tx: mpsc::Sender<PendingMessage>,
    closing: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchQueue {
    pub fn spawn(store: Arc<dyn TicketStore>, batch_size: usize, flush_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let closing = Arc::new(Notify::new());
        let worker = tokio::spawn(run_batch_worker(
            store,
            rx,
            closing.clone(),
            batch_size.max(1),
            flush_interval,
        ));
        Self {
            tx,
            closing,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues a message and waits until its batch has been written.
    pub async fn submit(&self, message: NewMessage) -> Result<String, StoreError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(PendingMessage { message, ack })
            .await
            .map_err(|_| StoreError::QueueClosed)?;
        done.await.map_err(|_| StoreError::QueueClosed)?
    }

    pub async fn close(&self) {
        self.closing.notify_one();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "batch writer task ended abnormally");
            }
        }
    }
}

async fn run_batch_worker(
    store: Arc<dyn TicketStore>,
    mut rx: mpsc::Receiver<PendingMessage>,
    closing: Arc<Notify>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut pending = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(item) => {
                    pending.push(item);
                    if pending.len() >= batch_size {
                        flush(store.as_ref(), &mut pending).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    flush(store.as_ref(), &mut pending).await;
                }
            }
            _ = closing.notified() => {
                rx.close();
                while let Some(item) = rx.recv().await {
                    pending.push(item);
                }
                break;
            }
        }
    }

    if !pending.is_empty() {
        flush(store.as_ref(), &mut pending).await;
    }
    info!("batch writer stopped");
}

async fn flush(store: &dyn TicketStore, pending: &mut Vec<PendingMessage>) {
    let batch = std::mem::take(pending);
    let messages = batch
        .iter()
        .map(|item| item.message.clone())
        .collect::<Vec<_>>();
    debug!(size = messages.len(), "flushing message batch");

    match store.insert_messages(&messages).await {
        Ok(ids) => {
            join_all(
                messages
                    .iter()
                    .map(|m| bump_ticket(store, &m.ticket_id, m.created_at)),
            )
            .await;
            for (item, id) in batch.into_iter().zip(ids) {
                let _ = item.ack.send(Ok(id));
            }
        }
        Err(err) => {
            // One bad row fails a multi-row insert; retry the rows one by one.
            warn!(error = %err, size = messages.len(), "batch insert failed, writing rows individually");
            for item in batch {
                let result = store.insert_message(&item.message).await;
                if result.is_ok() {
                    bump_ticket(store, &item.message.ticket_id, item.message.created_at).await;
                }
                let _ = item.ack.send(result);
            }
        }
    }
}
