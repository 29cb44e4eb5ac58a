//! Batch queue over download and install operations.
//!
//! Entries pair a verified title record with an operation bitmask and
//! destination flags. [`OperationQueue::process`] admits the whole batch
//! against per-device free space before the first transfer (all or
//! nothing), then drains entries in insertion order through the transfer
//! engine and the platform [`Installer`]. The first failure stops the
//! batch with the failed and unstarted entries still queued.

mod entry;
mod error;
mod install;
mod queue;
mod space;

pub use entry::{OP_DOWNLOAD, OP_INSTALL, QueueEntry, QueueRecord};
pub use error::{EnqueueError, QueueError};
pub use install::Installer;
pub use queue::{BatchContext, BatchProgress, OperationQueue};
pub use space::{SpaceAccountant, SpaceOracle, SysinfoOracle};
