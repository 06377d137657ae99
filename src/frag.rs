//! Outbound fragmentation and inbound reassembly of oversize payloads.
//!
//! See [`fragment`] for the send side and [`FragmentAssembler`] for the
//! receive side.

use ahash::AHashMap;
use bytes::Bytes;

use crate::{packet::MAX_FRAGMENTS, seq::Seq};

/// Errors that can occur while reassembling fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    /// A fragment's index exceeded [`MAX_FRAGMENTS`].
    #[error("fragment index exceeded MAX_FRAGMENTS")]
    TooManyFragments,
    /// Two fragments claimed the same index within a group with different
    /// contents; the later one is rejected.
    #[error("duplicate fragment index within group")]
    DuplicateIndex,
}

/// Splits `payload` into fragments of at most `fragment_size` bytes, one
/// logical packet per returned entry.
///
/// Each entry is `(sequence, is_last, bytes)`; `sequence`'s upper 16 bits are
/// the shared fragment group id (taken from `base_sequence`'s own upper 16
/// bits) and its lower 16 bits are the 1-based fragment index, matching the
/// wire encoding in [`crate::packet::PacketHeader::sequence`].
#[must_use]
pub fn fragment(payload: &[u8], fragment_size: usize, base_sequence: Seq) -> Vec<(Seq, bool, Bytes)> {
    if payload.is_empty() {
        return vec![(base_sequence, true, Bytes::new())];
    }
    let group = base_sequence.fragment_group();
    let chunks: Vec<_> = payload.chunks(fragment_size.max(1)).collect();
    let last = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let index = (i + 1) as u16;
            let seq = Seq::from_fragment(group, index);
            (seq, index as usize == last, Bytes::copy_from_slice(chunk))
        })
        .collect()
}

/// In-progress reassembly of one fragment group, keyed by the group's upper
/// 16 bits in the owning [`FragmentAssembler`].
#[derive(Debug, Clone)]
struct FragmentRecord {
    fragments: AHashMap<u16, Bytes>,
    last_index: Option<u16>,
    created_at_ms: u64,
}

impl FragmentRecord {
    fn is_complete(&self) -> bool {
        match self.last_index {
            Some(last) => (1..=last).all(|i| self.fragments.contains_key(&i)),
            None => false,
        }
    }

    fn assemble(&self) -> Bytes {
        let last = self.last_index.expect("assemble called before completion");
        let mut out = Vec::new();
        for i in 1..=last {
            out.extend_from_slice(&self.fragments[&i]);
        }
        Bytes::from(out)
    }
}

/// Reassembles fragmented packets for one connection.
///
/// Groups are evicted once complete and handed to the caller, once they time
/// out, or when the owning connection is destroyed (by dropping the
/// assembler).
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    groups: AHashMap<u16, FragmentRecord>,
}

impl FragmentAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fragment groups currently being assembled.
    #[must_use]
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Feeds one fragment into the assembler.
    ///
    /// Returns `Ok(Some(payload))` once the fragment completes its group,
    /// `Ok(None)` if the group is still incomplete, or an error if the
    /// fragment itself is invalid.
    ///
    /// # Errors
    ///
    /// See [`FragmentError`].
    pub fn insert(
        &mut self,
        sequence: Seq,
        is_last: bool,
        payload: Bytes,
        now_ms: u64,
    ) -> Result<Option<Bytes>, FragmentError> {
        let group_id = sequence.fragment_group();
        let index = sequence.fragment_index();
        if index == 0 || index > MAX_FRAGMENTS {
            return Err(FragmentError::TooManyFragments);
        }

        let record = self.groups.entry(group_id).or_insert_with(|| FragmentRecord {
            fragments: AHashMap::new(),
            last_index: None,
            created_at_ms: now_ms,
        });

        if let Some(existing) = record.fragments.get(&index) {
            if existing != &payload {
                return Err(FragmentError::DuplicateIndex);
            }
        } else {
            record.fragments.insert(index, payload);
        }

        if is_last {
            record.last_index = Some(index);
        }

        if record.is_complete() {
            let assembled = record.assemble();
            self.groups.remove(&group_id);
            return Ok(Some(assembled));
        }

        Ok(None)
    }

    /// Removes every group whose age exceeds `timeout_ms`, as measured from
    /// its first fragment. Called periodically from the dispatcher's
    /// cleanup sweep.
    pub fn evict_expired(&mut self, now_ms: u64, timeout_ms: u64) {
        self.groups
            .retain(|_, record| now_ms.saturating_sub(record.created_at_ms) <= timeout_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_and_reassembles_round_trip() {
        let payload = vec![7u8; 2048];
        let pieces = fragment(&payload, 512, Seq::from_fragment(1, 0));
        assert_eq!(pieces.len(), 4);
        assert!(pieces[..3].iter().all(|(_, last, _)| !last));
        assert!(pieces[3].1);

        let mut assembler = FragmentAssembler::new();
        let mut result = None;
        for (seq, is_last, bytes) in pieces {
            result = assembler.insert(seq, is_last, bytes, 0).unwrap();
        }
        assert_eq!(result.unwrap(), Bytes::from(payload));
    }

    #[test]
    fn out_of_order_fragments_still_reassemble() {
        let payload = b"abcdefgh".to_vec();
        let mut pieces = fragment(&payload, 2, Seq::from_fragment(9, 0));
        pieces.reverse();

        let mut assembler = FragmentAssembler::new();
        let mut result = None;
        for (seq, is_last, bytes) in pieces {
            let r = assembler.insert(seq, is_last, bytes, 0).unwrap();
            if r.is_some() {
                result = r;
            }
        }
        assert_eq!(result.unwrap(), Bytes::from(payload));
    }

    #[test]
    fn index_over_limit_is_rejected() {
        let mut assembler = FragmentAssembler::new();
        let seq = Seq::from_fragment(1, MAX_FRAGMENTS + 1);
        assert_eq!(
            assembler.insert(seq, true, Bytes::new(), 0).unwrap_err(),
            FragmentError::TooManyFragments
        );
    }

    #[test]
    fn expired_groups_are_evicted() {
        let mut assembler = FragmentAssembler::new();
        let seq = Seq::from_fragment(1, 1);
        assembler.insert(seq, false, Bytes::from_static(b"a"), 0).unwrap();
        assert_eq!(assembler.pending_groups(), 1);
        assembler.evict_expired(10_000, 5_000);
        assert_eq!(assembler.pending_groups(), 0);
    }
}
