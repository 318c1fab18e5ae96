//! Storage-object transfer queue.
//!
//! Uploads and downloads run on their own worker so they never block the
//! message path; the actual object-store I/O sits behind
//! [`StorageBackend`]. Messages that reference an object in flight stay
//! gated in the message dispatcher until the transfer settles.

use std::sync::mpsc::{self, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use uuid::Uuid;

use crate::error::ClientError;

use super::DispatcherCore;

/// Pending transfers buffered before submissions are rejected.
const TRANSFER_BUFFER: usize = 32;

/// Moves bytes to and from the object store. Implemented by the embedder
/// or an out-of-tree integration.
pub trait StorageBackend: Send + Sync {
    /// Uploads the object and returns its final URI.
    fn upload(&self, object: &StorageObject) -> Result<String, ClientError>;

    /// Downloads the object, returning the received bytes.
    fn download(&self, object: &StorageObject) -> Result<Vec<u8>, ClientError>;
}

/// One object in the object store.
#[derive(Debug, Clone)]
pub struct StorageObject {
    id: String,
    pub name: String,
    pub content_type: String,
    /// Set once an upload settles (or known up front for downloads).
    pub uri: Option<String>,
    /// Local path of the content to upload or the download target.
    pub path: Option<String>,
}

impl StorageObject {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>) -> StorageObject {
        StorageObject {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            content_type: content_type.into(),
            uri: None,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Internal identity used for gating dependent messages.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Progress of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressState {
    Queued,
    InProgress,
    Completed,
    Failed,
}

pub type StorageProgressCallback = Arc<dyn Fn(&StorageObject, ProgressState) + Send + Sync>;

enum TransferKind {
    Upload,
    Download,
}

struct TransferJob {
    object: StorageObject,
    kind: TransferKind,
    callback: Option<StorageProgressCallback>,
}

pub struct StorageDispatcher {
    core: Arc<DispatcherCore>,
    backend: Arc<Mutex<Option<Arc<dyn StorageBackend>>>>,
    sender: Mutex<Option<mpsc::SyncSender<TransferJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StorageDispatcher {
    pub(super) fn start(core: Arc<DispatcherCore>) -> StorageDispatcher {
        let (sender, receiver) = mpsc::sync_channel::<TransferJob>(TRANSFER_BUFFER);
        let backend: Arc<Mutex<Option<Arc<dyn StorageBackend>>>> = Arc::new(Mutex::new(None));

        let worker = std::thread::Builder::new()
            .name("Storage dispatcher".into())
            .spawn({
                let core = core.clone();
                let backend = backend.clone();
                move || {
                    log::debug!("Storage dispatcher is starting");
                    while let Ok(job) = receiver.recv() {
                        run_transfer(&core, &backend, job);
                    }
                    log::debug!("Storage dispatcher has finished");
                }
            })
            .expect("Unable to spawn thread");

        StorageDispatcher {
            core,
            backend,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn set_backend(&self, backend: Arc<dyn StorageBackend>) {
        *self.backend.lock().expect("storage backend lock") = Some(backend);
    }

    pub fn queue_upload(
        &self,
        object: StorageObject,
        callback: Option<StorageProgressCallback>,
    ) -> Result<(), ClientError> {
        self.queue_transfer(TransferJob {
            object,
            kind: TransferKind::Upload,
            callback,
        })
    }

    pub fn queue_download(
        &self,
        object: StorageObject,
        callback: Option<StorageProgressCallback>,
    ) -> Result<(), ClientError> {
        self.queue_transfer(TransferJob {
            object,
            kind: TransferKind::Download,
            callback,
        })
    }

    fn queue_transfer(&self, job: TransferJob) -> Result<(), ClientError> {
        let guard = self.sender.lock().expect("storage sender lock");
        let Some(sender) = guard.as_ref() else {
            return Err(ClientError::Other(anyhow::anyhow!(
                "the storage dispatcher is closed"
            )));
        };

        if let Some(callback) = &job.callback {
            callback(&job.object, ProgressState::Queued);
        }

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                // The transfer never started, so dependent messages must
                // not stay gated forever.
                self.core.content.settle(job.object.id(), false);
                Err(ClientError::QueueFull {
                    requested: 1,
                    available: 0,
                })
            }
            Err(TrySendError::Disconnected(job)) => {
                self.core.content.settle(job.object.id(), false);
                Err(ClientError::Other(anyhow::anyhow!(
                    "the storage dispatcher worker is gone"
                )))
            }
        }
    }

    pub(super) fn close(&self) {
        drop(self.sender.lock().expect("storage sender lock").take());
        crate::utils::thread::join(&mut self.worker.lock().expect("storage worker lock"));
    }
}

fn run_transfer(
    core: &DispatcherCore,
    backend: &Mutex<Option<Arc<dyn StorageBackend>>>,
    mut job: TransferJob,
) {
    if let Some(callback) = &job.callback {
        callback(&job.object, ProgressState::InProgress);
    }

    let backend = backend.lock().expect("storage backend lock").clone();
    let Some(backend) = backend else {
        log::error!("No storage backend is configured, failing transfer of {}", job.object.name);
        settle(core, &job, ProgressState::Failed);
        return;
    };

    let result = match job.kind {
        TransferKind::Upload => backend.upload(&job.object).map(|uri| {
            job.object.uri = Some(uri);
        }),
        TransferKind::Download => backend.download(&job.object).map(|bytes| {
            log::debug!("Downloaded {} bytes of {}", bytes.len(), job.object.name);
        }),
    };

    match result {
        Ok(()) => {
            log::debug!("Transfer of {} completed", job.object.name);
            settle(core, &job, ProgressState::Completed);
        }
        Err(e) => {
            log::warn!("Transfer of {} failed: {e}", job.object.name);
            settle(core, &job, ProgressState::Failed);
        }
    }
}

fn settle(core: &DispatcherCore, job: &TransferJob, state: ProgressState) {
    core.content
        .settle(job.object.id(), state == ProgressState::Completed);
    if let Some(callback) = &job.callback {
        callback(&job.object, state);
    }
}
