//! Parsed, immutable view of a verified TMD.

use tracing::debug;

use crate::error::TmdError;
use crate::layout::*;
use crate::verify::{TmdState, repair, verify};

/// One entry of the content table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRecord {
    pub id: u32,
    pub index: u16,
    pub flags: u16,
    pub size: u64,
    pub digest: [u8; 32],
}

impl ContentRecord {
    /// Whether the content ships with a `.h3` hash-tree sidecar.
    pub fn is_hashed(&self) -> bool {
        self.flags & TYPE_HASHED != 0
    }

    /// Zero-padded lowercase hex id, the CDN and on-disk file stem.
    pub fn id_hex(&self) -> String {
        format!("{:08x}", self.id)
    }
}

/// Coarse title classification from the upper half of the title id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleKind {
    Game,
    Demo,
    Dlc,
    Update,
    SystemApp,
    SystemData,
    SystemApplet,
    Unknown(u32),
}

impl TitleKind {
    pub fn from_title_id(tid: u64) -> Self {
        match (tid >> 32) as u32 {
            0x0005_0000 => TitleKind::Game,
            0x0005_0002 => TitleKind::Demo,
            0x0005_000C => TitleKind::Dlc,
            0x0005_000E => TitleKind::Update,
            0x0005_0010 => TitleKind::SystemApp,
            0x0005_001B => TitleKind::SystemData,
            0x0005_0030 => TitleKind::SystemApplet,
            other => TitleKind::Unknown(other),
        }
    }

    /// DLC and updates require their base title at install time.
    pub fn has_dependencies(&self) -> bool {
        matches!(self, TitleKind::Dlc | TitleKind::Update)
    }
}

/// A verified TMD, held immutably for the duration of one job.
#[derive(Debug, Clone)]
pub struct TitleMetadata {
    raw: Vec<u8>,
    title_id: u64,
    title_version: u16,
    contents: Vec<ContentRecord>,
    repaired: bool,
}

impl TitleMetadata {
    /// Verify and parse raw TMD bytes.
    ///
    /// The zeroed-digest quirk is repaired in place (at most once); check
    /// [`TitleMetadata::was_repaired`] and persist [`TitleMetadata::raw`]
    /// when it reports `true`.
    pub fn parse(mut bytes: Vec<u8>) -> Result<Self, TmdError> {
        if bytes.len() < CONTENTS_OFF + CONTENT_RECORD_LEN {
            return Err(TmdError::Truncated { len: bytes.len() });
        }

        let repaired = match verify(&bytes) {
            TmdState::Good => false,
            TmdState::Bad => return Err(TmdError::Invalid),
            TmdState::RepairableQuirk => {
                debug!("zeroed-digest tmd detected, repairing");
                if !repair(&mut bytes) {
                    return Err(TmdError::RepairFailed);
                }
                true
            }
        };

        let count = be_u16(&bytes, NUM_CONTENTS_OFF) as usize;
        let mut contents = Vec::with_capacity(count);
        for i in 0..count {
            let off = CONTENTS_OFF + i * CONTENT_RECORD_LEN;
            let mut digest = [0u8; 32];
            digest.copy_from_slice(&bytes[off + 16..off + 48]);
            contents.push(ContentRecord {
                id: be_u32(&bytes, off),
                index: be_u16(&bytes, off + 4),
                flags: be_u16(&bytes, off + 6),
                size: be_u64(&bytes, off + 8),
                digest,
            });
        }

        Ok(Self {
            title_id: be_u64(&bytes, TID_OFF),
            title_version: be_u16(&bytes, TITLE_VERSION_OFF),
            contents,
            repaired,
            raw: bytes,
        })
    }

    pub fn title_id(&self) -> u64 {
        self.title_id
    }

    /// Zero-padded lowercase hex title id, as used in CDN paths.
    pub fn title_id_hex(&self) -> String {
        format!("{:016x}", self.title_id)
    }

    pub fn title_version(&self) -> u16 {
        self.title_version
    }

    pub fn kind(&self) -> TitleKind {
        TitleKind::from_title_id(self.title_id)
    }

    pub fn contents(&self) -> &[ContentRecord] {
        &self.contents
    }

    /// The verified (and possibly repaired) bytes, for persisting as
    /// `title.tmd`.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn was_repaired(&self) -> bool {
        self.repaired
    }

    /// Bytes that have to come over the wire: every content plus the
    /// hash-tree sidecar of hashed contents.
    pub fn download_size(&self) -> u64 {
        self.contents
            .iter()
            .map(|c| c.size + if c.is_hashed() { h3_size(c.size) } else { 0 })
            .sum()
    }

    /// Raw content bytes the install service will consume.
    pub fn install_size(&self) -> u64 {
        self.contents.iter().map(|c| c.size).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    pub(crate) const TEST_TID: u64 = 0x0005_0000_1234_5678;

    /// Build a structurally complete TMD with valid digests from a list of
    /// (content id, type flags, size) triples.
    pub(crate) fn build_tmd(contents: &[(u32, u16, u64)], with_cert: bool) -> Vec<u8> {
        let n = contents.len();
        let mut len = CONTENTS_OFF + n * CONTENT_RECORD_LEN;
        if with_cert {
            len += CERT_TRAILER_LEN;
        }
        let mut tmd = vec![0u8; len];

        tmd[TID_OFF..TID_OFF + 8].copy_from_slice(&TEST_TID.to_be_bytes());
        tmd[TITLE_VERSION_OFF..TITLE_VERSION_OFF + 2].copy_from_slice(&0x50u16.to_be_bytes());
        tmd[NUM_CONTENTS_OFF..NUM_CONTENTS_OFF + 2]
            .copy_from_slice(&(n as u16).to_be_bytes());
        tmd[INFO_COUNT_OFF..INFO_COUNT_OFF + 2].copy_from_slice(&(n as u16).to_be_bytes());

        for (i, (cid, flags, size)) in contents.iter().enumerate() {
            let off = CONTENTS_OFF + i * CONTENT_RECORD_LEN;
            tmd[off..off + 4].copy_from_slice(&cid.to_be_bytes());
            tmd[off + 4..off + 6].copy_from_slice(&(i as u16).to_be_bytes());
            tmd[off + 6..off + 8].copy_from_slice(&flags.to_be_bytes());
            tmd[off + 8..off + 16].copy_from_slice(&size.to_be_bytes());
            let digest = Sha256::digest(cid.to_be_bytes());
            tmd[off + 16..off + 48].copy_from_slice(&digest);
        }

        let table_end = CONTENTS_OFF + n * CONTENT_RECORD_LEN;
        let content_digest = Sha256::digest(&tmd[CONTENTS_OFF..table_end]);
        tmd[INFO_DIGEST_OFF..INFO_DIGEST_OFF + 32].copy_from_slice(&content_digest);
        let info_digest = Sha256::digest(&tmd[INFO_TABLE_OFF..CONTENTS_OFF]);
        tmd[HEADER_DIGEST_OFF..HEADER_DIGEST_OFF + 32].copy_from_slice(&info_digest);

        tmd
    }

    #[test]
    fn parse_exposes_records() {
        let flags = TYPE_CONTENT | TYPE_ENCRYPTED;
        let tmd = build_tmd(&[(0xAB, flags, 4096), (0xCD, flags | TYPE_HASHED, 8192)], true);
        let meta = TitleMetadata::parse(tmd).unwrap();

        assert_eq!(meta.title_id(), TEST_TID);
        assert_eq!(meta.title_id_hex(), "0005000012345678");
        assert_eq!(meta.title_version(), 0x50);
        assert_eq!(meta.kind(), TitleKind::Game);
        assert!(!meta.was_repaired());

        let contents = meta.contents();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].id, 0xAB);
        assert_eq!(contents[0].id_hex(), "000000ab");
        assert!(!contents[0].is_hashed());
        assert!(contents[1].is_hashed());
        assert_eq!(contents[1].index, 1);
    }

    #[test]
    fn parse_rejects_corrupt_bytes() {
        let mut tmd = build_tmd(&[(0xAB, TYPE_CONTENT | TYPE_ENCRYPTED, 4096)], false);
        tmd[CONTENTS_OFF + 17] ^= 0xFF;
        assert_eq!(TitleMetadata::parse(tmd).unwrap_err(), TmdError::Invalid);
    }

    #[test]
    fn parse_reports_truncation_with_the_length() {
        assert_eq!(
            TitleMetadata::parse(vec![0; 64]).unwrap_err(),
            TmdError::Truncated { len: 64 }
        );
        // One byte short of the smallest record that could hold a content.
        let len = CONTENTS_OFF + CONTENT_RECORD_LEN - 1;
        assert_eq!(
            TitleMetadata::parse(vec![0; len]).unwrap_err(),
            TmdError::Truncated { len }
        );
    }

    #[test]
    fn parse_repairs_the_zeroed_digest_quirk() {
        let mut tmd = build_tmd(&[(0xAB, TYPE_CONTENT | TYPE_ENCRYPTED, 4096)], false);
        tmd[HEADER_DIGEST_OFF..HEADER_DIGEST_OFF + 32].fill(0);
        tmd[INFO_DIGEST_OFF..INFO_DIGEST_OFF + 32].fill(0);

        let meta = TitleMetadata::parse(tmd).unwrap();
        assert!(meta.was_repaired());
        assert_eq!(crate::verify::verify(meta.raw()), TmdState::Good);
    }

    #[test]
    fn aggregate_sizes() {
        let flags = TYPE_CONTENT | TYPE_ENCRYPTED;
        let tmd = build_tmd(
            &[(0, flags, 1_048_576), (1, flags, 1_048_576), (2, flags, 1_048_576)],
            false,
        );
        let meta = TitleMetadata::parse(tmd).unwrap();
        // No hashed contents: wire size is exactly the content bytes.
        assert_eq!(meta.download_size(), 3 * 1_048_576);
        assert_eq!(meta.install_size(), 3 * 1_048_576);

        let hashed = build_tmd(&[(0, flags | TYPE_HASHED, 1_048_576)], false);
        let meta = TitleMetadata::parse(hashed).unwrap();
        assert_eq!(meta.download_size(), 1_048_576 + h3_size(1_048_576));
    }

    #[test]
    fn dependency_classification() {
        assert!(TitleKind::from_title_id(0x0005_000C_0000_0000).has_dependencies());
        assert!(TitleKind::from_title_id(0x0005_000E_0000_0000).has_dependencies());
        assert!(!TitleKind::from_title_id(0x0005_0000_0000_0000).has_dependencies());
        assert_eq!(
            TitleKind::from_title_id(0x0007_0002_0000_0000),
            TitleKind::Unknown(0x0007_0002)
        );
    }
}
