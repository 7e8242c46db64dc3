use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// The header starting every datagram of a fragmented Sequence send. Repeated (with an
///  incremented `fragment_idx`) on every datagram of one send.
///
/// `generation` distinguishes successive sends of the same Sequence identity; `sender_nonce`
///  distinguishes concurrent senders that happen to reuse the same identifier and generation.
///  The reassembly table is keyed by the `(seq_id, generation, sender_nonce)` triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub seq_id: u64,
    pub total_fragments: u64,
    pub fragment_idx: u64,
    pub flags: u32,
    pub generation: u16,
    pub sender_nonce: u32,
}

impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 34;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.seq_id);
        buf.put_u64(self.total_fragments);
        buf.put_u64(self.fragment_idx);
        buf.put_u32(self.flags);
        buf.put_u16(self.generation);
        buf.put_u32(self.sender_nonce);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentHeader> {
        let seq_id = buf.try_get_u64()?;
        let total_fragments = buf.try_get_u64()?;
        let fragment_idx = buf.try_get_u64()?;
        let flags = buf.try_get_u32()?;
        let generation = buf.try_get_u16()?;
        let sender_nonce = buf.try_get_u32()?;
        Ok(FragmentHeader {
            seq_id,
            total_fragments,
            fragment_idx,
            flags,
            generation,
            sender_nonce,
        })
    }
}

/// Per-Sequence metadata that exists once per send rather than once per fragment: carried only
///  in fragment 0, immediately after its [FragmentHeader], followed by a length-prefixed name
///  (length 0 when unnamed).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment0Header {
    /// the total reassembled payload length across all elements
    pub total_len: u64,
    pub seq_type: u16,
}

impl Fragment0Header {
    pub const SERIALIZED_LEN: usize = 10;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.total_len);
        buf.put_u16(self.seq_type);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Fragment0Header> {
        let total_len = buf.try_get_u64()?;
        let seq_type = buf.try_get_u16()?;
        Ok(Fragment0Header {
            total_len,
            seq_type,
        })
    }
}

/// Embedded once per (element, fragment) pair, before that element's bytes in that fragment.
///  One element's data may straddle fragment boundaries, so the header carries the element's
///  total length and this piece's offset within it; the piece's own length is implied by
///  `min(bytes remaining in the datagram, elem_total_len - elem_offset)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub elem_idx: u32,
    pub elem_total_len: u32,
    pub elem_offset: u32,
    pub type_tag: u64,
}

impl SegmentHeader {
    pub const SERIALIZED_LEN: usize = 20;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.elem_idx);
        buf.put_u32(self.elem_total_len);
        buf.put_u32(self.elem_offset);
        buf.put_u64(self.type_tag);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SegmentHeader> {
        let elem_idx = buf.try_get_u32()?;
        let elem_total_len = buf.try_get_u32()?;
        let elem_offset = buf.try_get_u32()?;
        let type_tag = buf.try_get_u64()?;
        Ok(SegmentHeader {
            elem_idx,
            elem_total_len,
            elem_offset,
            type_tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::fragment_zero(
        FragmentHeader { seq_id: 0x0102030405060708, total_fragments: 3, fragment_idx: 0, flags: 0, generation: 7, sender_nonce: 0xaabbccdd },
        vec![
            1,2,3,4,5,6,7,8,
            0,0,0,0,0,0,0,3,
            0,0,0,0,0,0,0,0,
            0,0,0,0,
            0,7,
            0xaa,0xbb,0xcc,0xdd,
        ]
    )]
    #[case::last_fragment(
        FragmentHeader { seq_id: 1, total_fragments: 2, fragment_idx: 1, flags: 0, generation: u16::MAX, sender_nonce: 0 },
        vec![
            0,0,0,0,0,0,0,1,
            0,0,0,0,0,0,0,2,
            0,0,0,0,0,0,0,1,
            0,0,0,0,
            255,255,
            0,0,0,0,
        ]
    )]
    fn test_fragment_header_ser(#[case] header: FragmentHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), FragmentHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = FragmentHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_fragment0_header_ser() {
        let header = Fragment0Header { total_len: 0x100, seq_type: 5 };

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0,0,0,0,0,0,1,0, 0,5]);
        assert_eq!(buf.len(), Fragment0Header::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(Fragment0Header::deser(&mut b).unwrap(), header);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::start_piece(
        SegmentHeader { elem_idx: 2, elem_total_len: 1000, elem_offset: 0, type_tag: 0x0807060504030201 },
        vec![0,0,0,2, 0,0,3,0xe8, 0,0,0,0, 8,7,6,5,4,3,2,1]
    )]
    #[case::continuation_piece(
        SegmentHeader { elem_idx: 2, elem_total_len: 1000, elem_offset: 600, type_tag: 0 },
        vec![0,0,0,2, 0,0,3,0xe8, 0,0,2,0x58, 0,0,0,0,0,0,0,0]
    )]
    fn test_segment_header_ser(#[case] header: SegmentHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), SegmentHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = SegmentHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_short_buffer_is_an_error() {
        let bytes = [0u8; FragmentHeader::SERIALIZED_LEN - 1];
        let mut b: &[u8] = &bytes;
        assert!(FragmentHeader::deser(&mut b).is_err());

        let bytes = [0u8; SegmentHeader::SERIALIZED_LEN - 1];
        let mut b: &[u8] = &bytes;
        assert!(SegmentHeader::deser(&mut b).is_err());
    }
}
