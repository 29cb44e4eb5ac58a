//! Asynchronous write queue and storage primitives.
//!
//! Network receipt and storage latency are decoupled by a bounded queue of
//! write commands drained by one persistent worker thread: producers copy
//! bytes into queue slots and move on, the worker performs the blocking
//! writes against the [`Vfs`] storage capability. A storage fault is
//! remembered once and surfaces to every later caller; by contract it is
//! unrecoverable for the session because buffered, unflushed state can no
//! longer be trusted.
//!
//! Also home to the storage-adjacent shared types: destination [`Device`]
//! classes, the [`StorageLayout`] device-to-root mapping, and the
//! [`EntropySink`] capability fed with I/O timing jitter.

mod device;
mod entropy;
mod error;
mod queue;
mod vfs;

pub use device::{Device, StorageLayout};
pub use entropy::{EntropyPool, EntropySink, NoopEntropy};
pub use error::{StorageFault, WriteQueueError};
pub use queue::{QUEUE_SLOTS, SLOT_CAPACITY, WriteHandle, WriteQueue};
pub use vfs::{MemVfs, StdVfs, Vfs};

pub type Result<T> = std::result::Result<T, WriteQueueError>;
