//! Title metadata (TMD) parsing and integrity verification.
//!
//! A TMD is the signed binary descriptor the CDN serves for every title. It
//! lists the title's content files with their sizes, type flags and SHA-256
//! digests, plus a two-level hash chain: a digest over the content table
//! stored in the first content-info record, and a digest over the whole
//! content-info table stored in the header.
//!
//! [`verify`] checks structure and both digest levels and reports one of
//! three states instead of an error, because one known corruption (both
//! digests zeroed by a broken third-party packer) is repairable in place
//! with [`repair`]. [`TitleMetadata::parse`] wraps both into the usual
//! load path.

mod error;
mod layout;
mod title;
mod verify;

pub use error::TmdError;
pub use layout::{
    CERT_TRAILER_LEN, CONTENT_RECORD_LEN, CONTENTS_OFF, MAX_CONTENT_SIZE, TYPE_CONTENT,
    TYPE_ENCRYPTED, TYPE_HASHED, h3_size,
};
pub use title::{ContentRecord, TitleKind, TitleMetadata};
pub use verify::{TmdState, repair, verify};

pub type Result<T> = std::result::Result<T, TmdError>;
