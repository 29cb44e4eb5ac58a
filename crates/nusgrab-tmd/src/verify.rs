//! Structural and hash-chain verification of raw TMD bytes.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::layout::*;

/// Verdict of [`verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmdState {
    /// Structure and both digest levels check out.
    Good,
    /// Corrupt beyond repair; the record must not be trusted.
    Bad,
    /// Both hash-chain digests are zeroed, everything else lines up. A
    /// known third-party packer ships TMDs in this state; [`repair`] can
    /// recompute the digests in place.
    RepairableQuirk,
}

/// Verify a raw TMD record.
///
/// Checks run in order: minimum size, declared content count against the
/// first content-info record, count >= 1, total size against the two
/// accepted layouts (with or without the certificate trailer), the
/// zeroed-digest quirk, both hash-of-hashes digests, then every content
/// record (dense index, content+encrypted flags, size in (0, 4 GiB]).
pub fn verify(tmd: &[u8]) -> TmdState {
    if tmd.len() < CONTENTS_OFF + CONTENT_RECORD_LEN {
        debug!(len = tmd.len(), "tmd too short");
        return TmdState::Bad;
    }

    let declared = be_u16(tmd, NUM_CONTENTS_OFF) as usize;
    let summary = be_u16(tmd, INFO_COUNT_OFF) as usize;
    if declared != summary {
        debug!(declared, summary, "tmd content count mismatch");
        return TmdState::Bad;
    }

    // Some system titles carry a single content, but never zero.
    if declared == 0 {
        debug!("tmd declares no contents");
        return TmdState::Bad;
    }

    let bare_len = CONTENTS_OFF + declared * CONTENT_RECORD_LEN;
    if tmd.len() != bare_len && tmd.len() != bare_len + CERT_TRAILER_LEN {
        debug!(declared, len = tmd.len(), "tmd length matches no layout");
        return TmdState::Bad;
    }

    let header_digest = &tmd[HEADER_DIGEST_OFF..HEADER_DIGEST_OFF + 32];
    let table_digest = &tmd[INFO_DIGEST_OFF..INFO_DIGEST_OFF + 32];

    if header_digest.iter().all(|b| *b == 0) {
        // Zeroed header digest alone is plain corruption; the quirk zeroes
        // the content-table digest as well.
        return if table_digest.iter().all(|b| *b == 0) {
            debug!("tmd with zeroed digests detected");
            TmdState::RepairableQuirk
        } else {
            debug!("tmd header digest zeroed but content digest is not");
            TmdState::Bad
        };
    }

    let info_table = &tmd[INFO_TABLE_OFF..CONTENTS_OFF];
    if Sha256::digest(info_table).as_slice() != header_digest {
        debug!("tmd header digest mismatch");
        return TmdState::Bad;
    }

    let content_table = &tmd[CONTENTS_OFF..bare_len];
    if Sha256::digest(content_table).as_slice() != table_digest {
        debug!("tmd content table digest mismatch");
        return TmdState::Bad;
    }

    for (i, record) in content_table.chunks_exact(CONTENT_RECORD_LEN).enumerate() {
        let index = be_u16(record, 4) as usize;
        if index != i {
            debug!(position = i, index, "tmd content index out of sequence");
            return TmdState::Bad;
        }

        let flags = be_u16(record, 6);
        if flags & TYPE_CONTENT == 0 || flags & TYPE_ENCRYPTED == 0 {
            debug!(index, flags, "tmd content has unexpected type flags");
            return TmdState::Bad;
        }

        let size = be_u64(record, 8);
        if size == 0 || size > MAX_CONTENT_SIZE {
            debug!(index, size, "tmd content size out of range");
            return TmdState::Bad;
        }
    }

    TmdState::Good
}

/// Recompute both hash-chain digests in place and re-verify.
///
/// Returns `true` when the repaired record verifies as [`TmdState::Good`].
/// Callers attempt this at most once per load and must persist the
/// corrected bytes themselves.
pub fn repair(tmd: &mut [u8]) -> bool {
    if tmd.len() < CONTENTS_OFF + CONTENT_RECORD_LEN {
        return false;
    }

    let declared = be_u16(tmd, NUM_CONTENTS_OFF) as usize;
    let bare_len = CONTENTS_OFF + declared * CONTENT_RECORD_LEN;
    if declared == 0 || tmd.len() < bare_len {
        return false;
    }

    let content_digest = Sha256::digest(&tmd[CONTENTS_OFF..bare_len]);
    tmd[INFO_DIGEST_OFF..INFO_DIGEST_OFF + 32].copy_from_slice(&content_digest);

    let info_digest = Sha256::digest(&tmd[INFO_TABLE_OFF..CONTENTS_OFF]);
    tmd[HEADER_DIGEST_OFF..HEADER_DIGEST_OFF + 32].copy_from_slice(&info_digest);

    verify(tmd) == TmdState::Good
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::title::tests::build_tmd;

    #[test]
    fn well_formed_tmd_is_good() {
        let tmd = build_tmd(&[(0x1A, TYPE_CONTENT | TYPE_ENCRYPTED, 4096)], false);
        assert_eq!(verify(&tmd), TmdState::Good);
    }

    #[test]
    fn cert_trailer_layout_is_accepted() {
        let tmd = build_tmd(&[(0x1A, TYPE_CONTENT | TYPE_ENCRYPTED, 4096)], true);
        assert_eq!(verify(&tmd), TmdState::Good);
    }

    #[test]
    fn three_content_scenario() {
        let flags = TYPE_CONTENT | TYPE_ENCRYPTED;
        let tmd = build_tmd(
            &[(0, flags, 1_048_576), (1, flags, 1_048_576), (2, flags, 1_048_576)],
            false,
        );
        assert_eq!(verify(&tmd), TmdState::Good);
    }

    #[test]
    fn flipped_content_byte_is_bad() {
        let mut tmd = build_tmd(&[(0x1A, TYPE_CONTENT | TYPE_ENCRYPTED, 4096)], false);
        // Inside the content record's digest field, past all structural
        // fields, so only the hash chain can catch it.
        let off = CONTENTS_OFF + 20;
        tmd[off] ^= 0x01;
        assert_eq!(verify(&tmd), TmdState::Bad);
    }

    #[test]
    fn zeroed_digests_are_the_repairable_quirk() {
        let mut tmd = build_tmd(&[(0x1A, TYPE_CONTENT | TYPE_ENCRYPTED, 4096)], false);
        tmd[HEADER_DIGEST_OFF..HEADER_DIGEST_OFF + 32].fill(0);
        tmd[INFO_DIGEST_OFF..INFO_DIGEST_OFF + 32].fill(0);
        assert_eq!(verify(&tmd), TmdState::RepairableQuirk);

        assert!(repair(&mut tmd));
        assert_eq!(verify(&tmd), TmdState::Good);
    }

    #[test]
    fn zeroed_header_digest_alone_is_bad() {
        let mut tmd = build_tmd(&[(0x1A, TYPE_CONTENT | TYPE_ENCRYPTED, 4096)], false);
        tmd[HEADER_DIGEST_OFF..HEADER_DIGEST_OFF + 32].fill(0);
        assert_eq!(verify(&tmd), TmdState::Bad);
    }

    #[test]
    fn out_of_sequence_index_is_bad() {
        let mut tmd = build_tmd(
            &[
                (0, TYPE_CONTENT | TYPE_ENCRYPTED, 4096),
                (1, TYPE_CONTENT | TYPE_ENCRYPTED, 4096),
            ],
            false,
        );
        tmd[CONTENTS_OFF + CONTENT_RECORD_LEN + 5] = 7;
        // refresh digests so only the index check can fail
        assert!(!repair(&mut tmd));
        assert_eq!(verify(&tmd), TmdState::Bad);
    }

    #[test]
    fn missing_encrypted_flag_is_bad() {
        let mut tmd = build_tmd(&[(0x1A, TYPE_CONTENT, 4096)], false);
        assert!(!repair(&mut tmd));
        assert_eq!(verify(&tmd), TmdState::Bad);
    }

    #[test]
    fn content_size_bounds() {
        let zero = build_tmd(&[(0, TYPE_CONTENT | TYPE_ENCRYPTED, 0)], false);
        assert_eq!(verify(&zero), TmdState::Bad);

        let max = build_tmd(&[(0, TYPE_CONTENT | TYPE_ENCRYPTED, MAX_CONTENT_SIZE)], false);
        assert_eq!(verify(&max), TmdState::Good);

        let over =
            build_tmd(&[(0, TYPE_CONTENT | TYPE_ENCRYPTED, MAX_CONTENT_SIZE + 1)], false);
        assert_eq!(verify(&over), TmdState::Bad);
    }

    #[test]
    fn declared_count_must_match_summary() {
        let mut tmd = build_tmd(&[(0, TYPE_CONTENT | TYPE_ENCRYPTED, 4096)], false);
        tmd[NUM_CONTENTS_OFF + 1] = 2;
        assert_eq!(verify(&tmd), TmdState::Bad);
    }

    #[test]
    fn truncated_record_is_bad() {
        let tmd = build_tmd(&[(0, TYPE_CONTENT | TYPE_ENCRYPTED, 4096)], false);
        assert_eq!(verify(&tmd[..tmd.len() - 1]), TmdState::Bad);
        assert_eq!(verify(&tmd[..64]), TmdState::Bad);
    }
}
