//! Binary layout of a TMD record. All integers are big-endian.

/// Offset of the 64-bit title id inside the signed header.
pub(crate) const TID_OFF: usize = 0x18C;

/// Offset of the 16-bit title version.
pub(crate) const TITLE_VERSION_OFF: usize = 0x1DC;

/// Offset of the declared 16-bit content count.
pub(crate) const NUM_CONTENTS_OFF: usize = 0x1DE;

/// Offset of the header digest: SHA-256 over the content-info table.
pub(crate) const HEADER_DIGEST_OFF: usize = 0x1E4;

/// Start of the content-info table (end of the signed header).
pub(crate) const INFO_TABLE_OFF: usize = 0x204;

/// One content-info record: index offset u16, command count u16, digest.
pub(crate) const INFO_RECORD_LEN: usize = 0x24;

/// The content-info table always holds 64 records.
pub(crate) const INFO_RECORD_COUNT: usize = 64;

/// Offset of record 0's command count, which must equal the declared
/// content count.
pub(crate) const INFO_COUNT_OFF: usize = INFO_TABLE_OFF + 2;

/// Offset of record 0's digest: SHA-256 over the content table.
pub(crate) const INFO_DIGEST_OFF: usize = INFO_TABLE_OFF + 4;

/// Start of the content table.
pub const CONTENTS_OFF: usize = INFO_TABLE_OFF + INFO_RECORD_LEN * INFO_RECORD_COUNT;

/// One content record: id u32, index u16, type u16, size u64, digest.
pub const CONTENT_RECORD_LEN: usize = 0x30;

/// Some TMDs carry a certificate chain appended after the content table.
pub const CERT_TRAILER_LEN: usize = 0x700;

/// Content type flag: the record describes a content file.
pub const TYPE_CONTENT: u16 = 0x2000;

/// Content type flag: the content data is encrypted.
pub const TYPE_ENCRYPTED: u16 = 0x0001;

/// Content type flag: the content has a `.h3` hash-tree sidecar.
pub const TYPE_HASHED: u16 = 0x0002;

/// Content files are capped at 4 GiB.
pub const MAX_CONTENT_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Size of the `.h3` hash-tree sidecar for a content of `size` bytes:
/// one 20-byte hash per started 256 MiB block.
pub fn h3_size(size: u64) -> u64 {
    (size / 0x1000_0000 + 1) * 20
}

pub(crate) fn be_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn be_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn be_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(b)
}
