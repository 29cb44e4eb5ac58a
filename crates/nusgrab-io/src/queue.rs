//! The bounded write queue and its worker thread.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::entropy::EntropySink;
use crate::error::{StorageFault, WriteQueueError};
use crate::vfs::Vfs;

/// Largest payload carried by one queue slot. Larger writes are split.
pub const SLOT_CAPACITY: usize = 1024 * 1024; // 1 MiB

/// Slots in flight before producers wait, about 64 MiB of buffered data.
pub const QUEUE_SLOTS: usize = 64;

/// How often a waiting producer re-checks the sticky fault.
const FAULT_POLL: Duration = Duration::from_millis(20);

/// Identifies an open destination; only meaningful to the queue that
/// issued it.
pub type WriteHandle = u32;

enum Command {
    Open {
        handle: WriteHandle,
        writer: Box<dyn Write + Send>,
    },
    Write {
        handle: WriteHandle,
        data: Vec<u8>,
    },
    Close {
        handle: WriteHandle,
    },
    Flush {
        ack: oneshot::Sender<()>,
    },
}

/// Bounded queue of storage writes drained by one worker thread.
///
/// Producers never block on the storage device: they copy bytes into a
/// slot and return. Writes to a handle are applied strictly in enqueue
/// order and a close never overtakes them; ordering across handles is
/// unspecified.
pub struct WriteQueue {
    tx: mpsc::Sender<Command>,
    fault: Arc<OnceLock<StorageFault>>,
    next_handle: AtomicU32,
    vfs: Arc<dyn Vfs>,
    entropy: Arc<dyn EntropySink>,
    worker: Option<thread::JoinHandle<()>>,
}

impl WriteQueue {
    /// Start the worker with the default slot count.
    pub fn start(
        vfs: Arc<dyn Vfs>,
        entropy: Arc<dyn EntropySink>,
    ) -> Result<Self, WriteQueueError> {
        Self::with_slots(vfs, entropy, QUEUE_SLOTS)
    }

    /// Start with a custom slot count (tests use tiny queues to force
    /// backpressure).
    pub fn with_slots(
        vfs: Arc<dyn Vfs>,
        entropy: Arc<dyn EntropySink>,
        slots: usize,
    ) -> Result<Self, WriteQueueError> {
        let (tx, rx) = mpsc::channel(slots.max(1));
        let fault = Arc::new(OnceLock::new());

        let worker_fault = Arc::clone(&fault);
        let worker_entropy = Arc::clone(&entropy);
        let worker = thread::Builder::new()
            .name("nusgrab-io".into())
            .spawn(move || worker_main(rx, worker_fault, worker_entropy))
            .map_err(WriteQueueError::Spawn)?;

        Ok(Self {
            tx,
            fault,
            next_handle: AtomicU32::new(1),
            vfs,
            entropy,
            worker: Some(worker),
        })
    }

    /// The sticky fault, if any. Once a write or close failed, every
    /// caller sees the same fault for the rest of the session.
    pub fn check_fault(&self) -> Result<(), WriteQueueError> {
        match self.fault.get() {
            Some(fault) => Err(WriteQueueError::Storage(fault.clone())),
            None => Ok(()),
        }
    }

    /// Create (truncating) a destination and hand its writer to the
    /// worker. The open itself happens on the caller so its error is
    /// reported directly instead of poisoning the queue.
    pub async fn open(&self, path: &Path, prealloc: u64) -> Result<WriteHandle, WriteQueueError> {
        self.check_fault()?;
        let started = Instant::now();
        let writer = self.vfs.create(path, prealloc).map_err(WriteQueueError::Open)?;
        self.entropy
            .feed(&started.elapsed().as_nanos().to_le_bytes());
        self.register(writer).await
    }

    /// Open a destination for appending (resumed transfers).
    pub async fn open_append(&self, path: &Path) -> Result<WriteHandle, WriteQueueError> {
        self.check_fault()?;
        let writer = self.vfs.append(path).map_err(WriteQueueError::Open)?;
        self.register(writer).await
    }

    async fn register(
        &self,
        writer: Box<dyn Write + Send>,
    ) -> Result<WriteHandle, WriteQueueError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.send(Command::Open { handle, writer }).await?;
        Ok(handle)
    }

    /// Queue bytes for `handle`, splitting across slots as needed.
    pub async fn write(&self, handle: WriteHandle, data: &[u8]) -> Result<(), WriteQueueError> {
        for chunk in data.chunks(SLOT_CAPACITY) {
            self.send(Command::Write {
                handle,
                data: chunk.to_vec(),
            })
            .await?;
        }
        Ok(())
    }

    /// Queue the close marker; processed after all prior writes to
    /// `handle`.
    pub async fn close(&self, handle: WriteHandle) -> Result<(), WriteQueueError> {
        self.send(Command::Close { handle }).await
    }

    /// Block until every currently queued slot has drained.
    pub async fn flush(&self) -> Result<(), WriteQueueError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Flush { ack }).await?;
        match done.await {
            Ok(()) => self.check_fault(),
            Err(_) => {
                self.check_fault()?;
                Err(WriteQueueError::Shutdown)
            }
        }
    }

    /// Drain outstanding work and join the worker.
    pub async fn shutdown(mut self) -> Result<(), WriteQueueError> {
        let result = self.flush().await;
        drop(self.tx);
        if let Some(worker) = self.worker.take() {
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
        }
        result
    }

    /// Reserve a slot, re-checking the fault while waiting so a dead
    /// worker can never hang a producer.
    async fn send(&self, command: Command) -> Result<(), WriteQueueError> {
        let mut command = Some(command);
        loop {
            self.check_fault()?;
            match tokio::time::timeout(FAULT_POLL, self.tx.reserve()).await {
                Ok(Ok(permit)) => {
                    if let Some(command) = command.take() {
                        permit.send(command);
                    }
                    return Ok(());
                }
                Ok(Err(_closed)) => {
                    self.check_fault()?;
                    return Err(WriteQueueError::Shutdown);
                }
                Err(_elapsed) => {
                    debug!("write queue full, waiting for a free slot");
                }
            }
        }
    }
}

fn worker_main(
    mut rx: mpsc::Receiver<Command>,
    fault: Arc<OnceLock<StorageFault>>,
    entropy: Arc<dyn EntropySink>,
) {
    let mut open: HashMap<WriteHandle, Box<dyn Write + Send>> = HashMap::new();

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Open { handle, writer } => {
                open.insert(handle, writer);
            }
            Command::Write { handle, data } => {
                let Some(writer) = open.get_mut(&handle) else {
                    continue;
                };
                if let Err(e) = writer.write_all(&data) {
                    error!(handle, error = %e, "buffered write failed");
                    let _ = fault.set(StorageFault::new("write", &e));
                    return;
                }
            }
            Command::Close { handle } => {
                let Some(mut writer) = open.remove(&handle) else {
                    continue;
                };
                let started = Instant::now();
                if let Err(e) = writer.flush() {
                    error!(handle, error = %e, "close failed");
                    let _ = fault.set(StorageFault::new("close", &e));
                    return;
                }
                drop(writer);
                entropy.feed(&started.elapsed().as_nanos().to_le_bytes());
            }
            Command::Flush { ack } => {
                // FIFO: everything queued before this marker is on disk
                // (or at least handed to the storage capability) by now.
                let _ = ack.send(());
            }
        }
    }
}
