// src/queue.rs
use crate::error::{SandboxError, SandboxResult};
use crate::model::Status;
use crate::store::RecordStore;
use crate::verify::Verifier;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Pending submission ids the verifier worker has not taken yet.
pub const QUEUE_CAPACITY: usize = 128;

/// Cloneable enqueue side, for routers and other producers.
#[derive(Clone, Debug)]
pub struct QueueHandle {
    tx: SyncSender<u64>,
}

impl QueueHandle {
    /// Blocks while the queue is full.
    pub fn enqueue(&self, id: u64) -> SandboxResult<()> {
        self.tx
            .send(id)
            .map_err(|_| SandboxError::Queue("verifier has stopped".into()))
    }

    /// Fails instead of blocking when the queue is full.
    pub fn try_enqueue(&self, id: u64) -> SandboxResult<()> {
        self.tx.try_send(id).map_err(|e| match e {
            TrySendError::Full(id) => SandboxError::Queue(format!("queue full, submission {id} not queued")),
            TrySendError::Disconnected(_) => SandboxError::Queue("verifier has stopped".into()),
        })
    }
}

/// A bounded queue of submission ids drained by one verifier thread.
pub struct VerificationQueue {
    handle: Option<QueueHandle>,
    store: Arc<dyn RecordStore>,
    worker: Option<JoinHandle<()>>,
}

impl VerificationQueue {
    pub fn start(verifier: Arc<Verifier>, store: Arc<dyn RecordStore>) -> SandboxResult<Self> {
        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let worker_store = store.clone();
        let worker = thread::Builder::new()
            .name("lectern-verifier".into())
            .spawn(move || drain(rx, &verifier, &*worker_store))?;
        Ok(Self {
            handle: Some(QueueHandle { tx }),
            store,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> SandboxResult<QueueHandle> {
        self.handle
            .clone()
            .ok_or_else(|| SandboxError::Queue("queue is shut down".into()))
    }

    pub fn enqueue(&self, id: u64) -> SandboxResult<()> {
        self.handle()?.enqueue(id)
    }

    /// Discard the stored results of submission `id` and verify it again.
    pub fn recheck(&self, id: u64) -> SandboxResult<()> {
        let mut submission = self.store.load_submission(id)?;
        submission.reset_for_recheck();
        self.store.save_submission(&submission)?;
        self.enqueue(id)
    }

    /// Stop accepting work, let the worker finish what is queued, and join it.
    /// Producers holding a [`QueueHandle`] keep the worker alive until they drop it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("verifier thread panicked");
            }
        }
    }
}

impl Drop for VerificationQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain(rx: Receiver<u64>, verifier: &Verifier, store: &dyn RecordStore) {
    debug!("verifier worker started");
    for id in rx {
        if let Err(e) = process(id, verifier, store) {
            error!("submission {}: {}", id, e);
        }
    }
    debug!("verifier worker exiting");
}

/// Load, mark IN_PROGRESS, verify, write back.
fn process(id: u64, verifier: &Verifier, store: &dyn RecordStore) -> SandboxResult<()> {
    let mut submission = store.load_submission(id)?;
    let lesson = store.load_lesson(submission.lesson_id)?;

    submission.status = Status::InProgress;
    store.save_submission(&submission)?;

    let verified = verifier.verify_submission(&mut submission, &lesson);
    // A mismatched record is still finished, so pollers stop waiting on it.
    submission.status = Status::Done;
    store.save_submission(&submission)?;
    verified?;
    info!("submission {} verified", id);
    Ok(())
}
