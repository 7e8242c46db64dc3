//! The datagram reassembly engine: a table of in-flight partial Sequences keyed by
//!  `(sequence id, generation, sender nonce)`, tolerant of any fragment arrival order.
//!
//! Elements fully contained in one datagram are decoded immediately. An element straddling
//!  fragment boundaries is collected as saved segment pieces; whenever a new piece arrives,
//!  reconstruction walks the saved pieces for the offset chain `0, len_0, len_0+len_1, ...`
//!  up to the element's declared total length and, on a complete chain, concatenates and
//!  frees the pieces (the slots are reused, not shrunk).
//!
//! A Sequence completes when the number of *distinct* fragments observed equals the declared
//!  total; completion removes the entry from the table and hands the Sequence to the caller
//!  by value - the table never retains a completed Sequence. Partials older than the
//!  staleness threshold are evicted by a periodic scan; evicted data is simply discarded,
//!  there is no redelivery or retransmission request on this path.

use crate::datagram_header::{Fragment0Header, FragmentHeader, SegmentHeader};
use crate::error::{Result, TransportError};
use crate::safe_converter::SafeCast;
use crate::sequence::{Element, Sequence};
use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub(crate) type ReassemblyKey = (u64, u16, u32);

/// one piece of an element that straddles fragment boundaries, buffered until its offset
///  chain closes
struct SavedSegment {
    header: SegmentHeader,
    data: Vec<u8>,
    free: bool,
}

struct PartialSequence {
    total_fragments: u64,
    fragments_seen: FxHashSet<u64>,
    /// completed elements, keyed by wire element index so arrival order cannot reorder them
    elements: BTreeMap<u32, Element>,
    saved: Vec<SavedSegment>,
    created_at: Instant,
    /// fragment 0 metadata, present once it arrived
    seq_type: u16,
    name: Option<String>,
    total_len: u64,
}

impl PartialSequence {
    fn new(total_fragments: u64, now: Instant) -> PartialSequence {
        PartialSequence {
            total_fragments,
            fragments_seen: FxHashSet::default(),
            elements: BTreeMap::new(),
            saved: Vec::new(),
            created_at: now,
            seq_type: 0,
            name: None,
            total_len: 0,
        }
    }

    fn save_segment(&mut self, header: SegmentHeader, data: Vec<u8>) {
        // reuse a freed slot if one exists
        if let Some(slot) = self.saved.iter_mut().find(|s| s.free) {
            *slot = SavedSegment { header, data, free: false };
        }
        else {
            self.saved.push(SavedSegment { header, data, free: false });
        }
    }

    /// Search the saved pieces of `elem_idx` for a contiguous offset chain covering the whole
    ///  element; on success decode the element and free the pieces.
    fn try_reconstruct(&mut self, elem_idx: u32) {
        let (total_len, type_tag) = match self.saved.iter().find(|s| !s.free && s.header.elem_idx == elem_idx) {
            Some(segment) => (segment.header.elem_total_len.safe_cast(), segment.header.type_tag),
            None => return,
        };

        let mut chain = Vec::new();
        let mut target = 0;
        while target < total_len {
            // walk backward: the most recently saved piece is the likeliest chain link
            let found = self.saved.iter().enumerate().rev()
                .find(|(_, s)| {
                    !s.free && s.header.elem_idx == elem_idx
                        && <u32 as SafeCast<usize>>::safe_cast(s.header.elem_offset) == target
                });
            match found {
                Some((slot_idx, segment)) => {
                    target += segment.data.len();
                    chain.push(slot_idx);
                }
                None => return, // chain has a gap, keep waiting
            }
        }

        trace!("reconstructed element {} from {} saved piece(s)", elem_idx, chain.len());
        let mut data = Vec::with_capacity(total_len);
        for &slot_idx in &chain {
            data.extend_from_slice(&self.saved[slot_idx].data);
            self.saved[slot_idx].free = true;
        }
        data.truncate(total_len);
        self.elements.insert(elem_idx, Element { type_tag, data: Bytes::from(data) });
    }

    fn finish(self, key: ReassemblyKey) -> Result<Sequence> {
        if self.saved.iter().any(|s| !s.free) {
            return Err(TransportError::ProtocolDesync(anyhow!(
                "all {} fragments of sequence {:#x} received but element pieces are left over",
                self.total_fragments, key.0,
            )));
        }

        let mut sequence = Sequence::new(key.0, self.seq_type);
        sequence.set_generation(key.1);
        if let Some(name) = self.name {
            sequence.set_name(name);
        }

        let mut payload_len = 0;
        for (_, element) in self.elements {
            payload_len += element.data.len() as u64;
            sequence.push_element(element.type_tag, element.data);
        }
        if payload_len != self.total_len {
            return Err(TransportError::ProtocolDesync(anyhow!(
                "sequence {:#x} reassembled to {} payload bytes but fragment 0 declared {}",
                key.0, payload_len, self.total_len,
            )));
        }
        Ok(sequence)
    }
}

/// The unordered collection of in-flight partial Sequences of one listener. Exclusively owned
///  by that listener; all mutation happens from the thread driving its receive loop.
pub struct ReassemblyTable {
    partials: FxHashMap<ReassemblyKey, PartialSequence>,
    staleness_threshold: Duration,
}

impl ReassemblyTable {
    pub fn new(staleness_threshold: Duration) -> ReassemblyTable {
        ReassemblyTable {
            partials: FxHashMap::default(),
            staleness_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    /// Consume one inbound datagram payload. Returns the completed Sequence if this datagram
    ///  finished one, `None` if more fragments are outstanding. There is no application-visible
    ///  partial delivery.
    pub fn push(&mut self, payload: &[u8], now: Instant) -> Result<Option<Sequence>> {
        let mut buf = payload;
        let header = FragmentHeader::deser(&mut buf).map_err(TransportError::ProtocolDesync)?;

        if header.total_fragments == 0 || header.fragment_idx >= header.total_fragments {
            return Err(TransportError::ProtocolDesync(anyhow!(
                "fragment {} of {} declared", header.fragment_idx, header.total_fragments,
            )));
        }

        let key = (header.seq_id, header.generation, header.sender_nonce);

        if header.total_fragments == 1 {
            // fully self-contained: no table entry is created
            return Self::decode_single_fragment(&header, buf, key).map(Some);
        }

        let entry = self.partials.entry(key).or_insert_with(|| {
            debug!("new partial sequence {:x?} expecting {} fragments", key, header.total_fragments);
            PartialSequence::new(header.total_fragments, now)
        });

        if entry.total_fragments != header.total_fragments {
            self.partials.remove(&key);
            return Err(TransportError::ProtocolDesync(anyhow!(
                "fragment of sequence {:#x} declares {} total fragments where earlier fragments declared a different count",
                key.0, header.total_fragments,
            )));
        }

        if !entry.fragments_seen.insert(header.fragment_idx) {
            // a duplicated datagram counts once and can neither complete a sequence early nor
            //  corrupt it
            trace!("duplicate fragment {} of sequence {:x?}", header.fragment_idx, key);
            return Ok(None);
        }

        let decode_result: anyhow::Result<()> = (|| {
            if header.fragment_idx == 0 {
                let (f0, name) = Self::parse_fragment0(&mut buf)?;
                entry.seq_type = f0.seq_type;
                entry.total_len = f0.total_len;
                entry.name = name;
            }
            Self::decode_segments(&mut buf, entry)?;
            Ok(())
        })();
        if let Err(e) = decode_result {
            self.partials.remove(&key);
            return Err(TransportError::ProtocolDesync(e));
        }

        if entry.fragments_seen.len() as u64 == entry.total_fragments {
            // ownership transfer point: completion removes the entry, the Sequence moves to
            //  the caller by value
            let partial = self.partials.remove(&key)
                .expect("the entry was just updated");
            debug!("sequence {:x?} complete after {} fragments", key, header.total_fragments);
            return partial.finish(key).map(Some);
        }
        Ok(None)
    }

    fn decode_single_fragment(header: &FragmentHeader, mut buf: &[u8], key: ReassemblyKey) -> Result<Sequence> {
        let decoded: anyhow::Result<Sequence> = (|| {
            let (f0, name) = Self::parse_fragment0(&mut buf)?;

            let mut elements = BTreeMap::new();
            while buf.has_remaining() {
                let segment = SegmentHeader::deser(&mut buf)?;
                let total_len: usize = segment.elem_total_len.safe_cast();
                if segment.elem_offset != 0 || buf.remaining() < total_len {
                    bail!("a single-fragment datagram must carry every element whole");
                }
                elements.insert(segment.elem_idx, Element {
                    type_tag: segment.type_tag,
                    data: buf.copy_to_bytes(total_len),
                });
            }

            let mut sequence = Sequence::new(header.seq_id, f0.seq_type);
            sequence.set_generation(header.generation);
            if let Some(name) = name {
                sequence.set_name(name);
            }
            let mut payload_len = 0;
            for (_, element) in elements {
                payload_len += element.data.len() as u64;
                sequence.push_element(element.type_tag, element.data);
            }
            if payload_len != f0.total_len {
                bail!("payload is {} bytes but the fragment declared {}", payload_len, f0.total_len);
            }
            Ok(sequence)
        })();

        decoded.map_err(|e| {
            TransportError::ProtocolDesync(e.context(format!("single-fragment sequence {:x?}", key)))
        })
    }

    fn parse_fragment0(buf: &mut &[u8]) -> anyhow::Result<(Fragment0Header, Option<String>)> {
        let f0 = Fragment0Header::deser(buf)?;
        let name_len: usize = TryGetFixedSupport::try_get_u16(buf)?.into();
        if buf.remaining() < name_len {
            bail!("name of {} bytes declared but only {} bytes follow", name_len, buf.remaining());
        }
        let name = if name_len == 0 {
            None
        }
        else {
            Some(String::from_utf8(buf[..name_len].to_vec())
                .map_err(|_| anyhow!("sequence name is not valid UTF-8"))?)
        };
        buf.advance(name_len);
        Ok((f0, name))
    }

    fn decode_segments(buf: &mut &[u8], entry: &mut PartialSequence) -> anyhow::Result<()> {
        while buf.has_remaining() {
            let segment = SegmentHeader::deser(buf)?;
            if segment.elem_offset > segment.elem_total_len {
                bail!("segment offset {} beyond the element's total length {}",
                    segment.elem_offset, segment.elem_total_len);
            }

            let elem_total_len: usize = segment.elem_total_len.safe_cast();
            let elem_offset: usize = segment.elem_offset.safe_cast();
            // the piece's length is implied: as much of the element as this datagram holds
            let piece_len = buf.remaining().min(elem_total_len - elem_offset);

            if elem_offset == 0 && piece_len == elem_total_len {
                // the element is fully present within this one datagram
                entry.elements.insert(segment.elem_idx, Element {
                    type_tag: segment.type_tag,
                    data: buf.copy_to_bytes(piece_len),
                });
            }
            else {
                let elem_idx = segment.elem_idx;
                entry.save_segment(segment, buf[..piece_len].to_vec());
                buf.advance(piece_len);
                entry.try_reconstruct(elem_idx);
            }
        }
        Ok(())
    }

    /// Evict every partial sequence older than the staleness threshold, regardless of
    ///  completion state. Returns the number of evictions.
    pub fn expire(&mut self, now: Instant) -> usize {
        let staleness_threshold = self.staleness_threshold;
        let before = self.partials.len();
        self.partials.retain(|key, partial| {
            let stale = now.duration_since(partial.created_at) >= staleness_threshold;
            if stale {
                warn!("evicting stale partial sequence {:x?}: {} of {} fragments after {:?}",
                    key, partial.fragments_seen.len(), partial.total_fragments, staleness_threshold);
            }
            !stale
        });
        before - self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram_send::test_sink::fragment;
    use crate::stream_send::SendOptions;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rstest::rstest;

    const CAPACITY: usize = 200;

    fn sample_sequence() -> Sequence {
        let mut seq = Sequence::new(0xfeed, 3);
        seq.set_name("reasm");
        seq.push_element(1, Bytes::from_static(b"small"));
        seq.push_element(2, Bytes::from(vec![0x42u8; 500])); // straddles fragments
        seq.push_element(3, Bytes::from_static(b""));
        seq.push_element(4, Bytes::from(vec![0x17u8; 100]));
        seq
    }

    fn assert_equivalent(actual: &Sequence, expected: &Sequence) {
        assert_eq!(actual.id(), expected.id());
        assert_eq!(actual.seq_type(), expected.seq_type());
        assert_eq!(actual.name(), expected.name());
        assert_eq!(actual.generation(), expected.generation());
        assert_eq!(actual.element_count(), expected.element_count());
        for (a, e) in actual.elements().zip(expected.elements()) {
            assert_eq!(a, e);
        }
    }

    #[tokio::test]
    async fn test_single_fragment_creates_no_table_entry() {
        let mut seq = Sequence::new(1, 2);
        seq.set_name("tiny");
        seq.push_element(9, Bytes::from_static(b"payload"));
        let fragments = fragment(&mut seq, 1472, 7, SendOptions::empty()).await;
        assert_eq!(fragments.len(), 1);

        let mut table = ReassemblyTable::new(Duration::from_secs(1));
        let result = table.push(&fragments[0], Instant::now()).unwrap().unwrap();

        assert_equivalent(&result, &seq);
        assert!(table.is_empty());
    }

    #[rstest]
    #[case::in_order(false, None)]
    #[case::reverse(true, None)]
    #[case::random_permutation(false, Some(4711u64))]
    #[case::another_permutation(false, Some(42u64))]
    fn test_multi_fragment_roundtrip(#[case] reverse: bool, #[case] shuffle_seed: Option<u64>) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut seq = sample_sequence();
            let mut fragments = fragment(&mut seq, CAPACITY, 7, SendOptions::empty()).await;
            assert!(fragments.len() > 1);

            if reverse {
                fragments.reverse();
            }
            if let Some(seed) = shuffle_seed {
                fragments.shuffle(&mut StdRng::seed_from_u64(seed));
            }

            let mut table = ReassemblyTable::new(Duration::from_secs(1));
            let now = Instant::now();
            let mut completed = None;
            for frag in &fragments {
                assert!(completed.is_none(), "completed before all fragments arrived");
                completed = table.push(frag, now).unwrap();
            }

            assert_equivalent(&completed.expect("all fragments delivered"), &seq);
            assert!(table.is_empty(), "completion must remove the table entry");
        });
    }

    #[tokio::test]
    async fn test_spanning_element_reconstructed_from_reversed_pieces() {
        let mut seq = Sequence::new(5, 1);
        seq.push_element(1, Bytes::from((0..=255u8).cycle().take(700).collect::<Vec<u8>>()));
        let mut fragments = fragment(&mut seq, CAPACITY, 7, SendOptions::empty()).await;
        assert!(fragments.len() >= 3, "the element must straddle several fragments");
        fragments.reverse();

        let mut table = ReassemblyTable::new(Duration::from_secs(1));
        let now = Instant::now();
        let mut completed = None;
        for frag in &fragments {
            completed = table.push(frag, now).unwrap();
        }

        let completed = completed.unwrap();
        assert_eq!(
            completed.elements().next().unwrap().data,
            seq.elements().next().unwrap().data,
        );
    }

    #[tokio::test]
    async fn test_duplicate_fragments_count_once() {
        let mut seq = sample_sequence();
        let fragments = fragment(&mut seq, CAPACITY, 7, SendOptions::empty()).await;
        assert!(fragments.len() > 2);

        let mut table = ReassemblyTable::new(Duration::from_secs(1));
        let now = Instant::now();

        // deliver the first fragment often enough to "reach" the total count
        for _ in 0..fragments.len() {
            assert!(table.push(&fragments[0], now).unwrap().is_none());
        }
        assert_eq!(table.len(), 1);

        // the genuine remaining fragments still complete it
        let mut completed = None;
        for frag in &fragments[1..] {
            completed = table.push(frag, now).unwrap();
        }
        assert_equivalent(&completed.unwrap(), &seq);
    }

    #[tokio::test]
    async fn test_expiration_evicts_and_restarts() {
        let mut seq = sample_sequence();
        let fragments = fragment(&mut seq, CAPACITY, 7, SendOptions::empty()).await;

        let staleness = Duration::from_secs(1);
        let mut table = ReassemblyTable::new(staleness);
        let t0 = Instant::now();

        table.push(&fragments[0], t0).unwrap();
        assert_eq!(table.len(), 1);

        // not stale yet
        assert_eq!(table.expire(t0 + Duration::from_millis(500)), 0);
        assert_eq!(table.len(), 1);

        assert_eq!(table.expire(t0 + staleness), 1);
        assert!(table.is_empty());

        // a late fragment with the same identity/generation/nonce starts a fresh partial
        //  rather than resuming the evicted one
        let t1 = t0 + Duration::from_secs(2);
        assert!(table.push(&fragments[1], t1).unwrap().is_none());
        assert_eq!(table.len(), 1);

        // the evicted fragment 0 is gone for good: delivering everything else does not
        //  complete the sequence without it
        let mut completed = None;
        for frag in &fragments[2..] {
            completed = table.push(frag, t1).unwrap();
        }
        assert!(completed.is_none());

        // until fragment 0 is delivered again
        let completed = table.push(&fragments[0], t1).unwrap().unwrap();
        assert_equivalent(&completed, &seq);
    }

    #[tokio::test]
    async fn test_generations_reassemble_independently() {
        let mut seq = sample_sequence();
        let first_send = fragment(&mut seq, CAPACITY, 7, SendOptions::empty()).await;
        let first_generation = seq.generation();
        let second_send = fragment(&mut seq, CAPACITY, 7, SendOptions::empty()).await;

        let mut table = ReassemblyTable::new(Duration::from_secs(1));
        let now = Instant::now();

        // interleave the two sends' fragments
        let mut completions = Vec::new();
        for (a, b) in first_send.iter().zip(&second_send) {
            if let Some(done) = table.push(a, now).unwrap() {
                completions.push(done);
            }
            if let Some(done) = table.push(b, now).unwrap() {
                completions.push(done);
            }
        }

        assert_eq!(completions.len(), 2, "the two sends must never merge");
        assert_eq!(completions[0].generation(), first_generation);
        assert_eq!(completions[1].generation(), first_generation.wrapping_add(1));
        for completed in &completions {
            assert_eq!(completed.id(), seq.id());
            assert_eq!(completed.element_count(), seq.element_count());
        }
    }

    #[tokio::test]
    async fn test_different_nonces_reassemble_independently() {
        let mut seq = sample_sequence();
        let sender_a = fragment(&mut seq, CAPACITY, 7, SendOptions::REUSE_GENERATION).await;
        let sender_b = fragment(&mut seq, CAPACITY, 8, SendOptions::REUSE_GENERATION).await;

        let mut table = ReassemblyTable::new(Duration::from_secs(1));
        let now = Instant::now();

        for frag in &sender_a[..sender_a.len() - 1] {
            assert!(table.push(frag, now).unwrap().is_none());
        }
        for frag in &sender_b[..sender_b.len() - 1] {
            assert!(table.push(frag, now).unwrap().is_none());
        }
        assert_eq!(table.len(), 2);

        assert!(table.push(sender_a.last().unwrap(), now).unwrap().is_some());
        assert!(table.push(sender_b.last().unwrap(), now).unwrap().is_some());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_empty_sequence_completes() {
        let mut seq = Sequence::new(3, 9);
        let fragments = fragment(&mut seq, CAPACITY, 7, SendOptions::empty()).await;
        assert_eq!(fragments.len(), 1);

        let mut table = ReassemblyTable::new(Duration::from_secs(1));
        let completed = table.push(&fragments[0], Instant::now()).unwrap().unwrap();
        assert!(completed.is_empty());
        assert_eq!(completed.seq_type(), 9);
    }

    #[test]
    fn test_truncated_header_is_desync() {
        let mut table = ReassemblyTable::new(Duration::from_secs(1));
        let result = table.push(&[1, 2, 3], Instant::now());
        assert!(matches!(result, Err(TransportError::ProtocolDesync(_))));
    }

    #[test]
    fn test_fragment_index_out_of_range_is_desync() {
        let mut buf = bytes::BytesMut::new();
        FragmentHeader {
            seq_id: 1,
            total_fragments: 2,
            fragment_idx: 2,
            flags: 0,
            generation: 0,
            sender_nonce: 0,
        }.ser(&mut buf);

        let mut table = ReassemblyTable::new(Duration::from_secs(1));
        let result = table.push(&buf, Instant::now());
        assert!(matches!(result, Err(TransportError::ProtocolDesync(_))));
        assert!(table.is_empty());
    }
}
