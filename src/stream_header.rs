use bitflags::bitflags;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

pub const PROTOCOL_VERSION: u16 = 1;
pub const MIN_COMPAT_VERSION: u16 = 1;

/// The hard limit on elements per stream message: `total_elems` is a u8 on the wire.
pub const MAX_ELEMENTS_PER_MESSAGE: usize = u8::MAX as usize;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        const SEGMENTS_FOLLOW = 1 << 0;
        const NAME_FOLLOWS = 1 << 1;
        const EXTENSION = 1 << 31;
    }
}

/// The fixed header starting every stream message. All integers are in network byte order,
///  here and in every other header of this protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u16,
    /// the minimum protocol version a receiver must speak to parse this message
    pub compat: u16,
    pub flags: MessageFlags,
    pub seq_id: u64,
    pub seq_type: u16,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = 24;

    pub fn new(flags: MessageFlags, seq_id: u64, seq_type: u16) -> MessageHeader {
        MessageHeader {
            version: PROTOCOL_VERSION,
            compat: MIN_COMPAT_VERSION,
            flags,
            seq_id,
            seq_type,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.version);
        buf.put_u16(self.compat);
        buf.put_u32(self.flags.bits());
        buf.put_u64(self.seq_id);
        buf.put_u16(self.seq_type);
        buf.put_u16(0); // pad
        buf.put_u32(0); // pad2
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let version = buf.try_get_u16()?;
        let compat = buf.try_get_u16()?;
        let flags = MessageFlags::from_bits_retain(buf.try_get_u32()?);
        let seq_id = buf.try_get_u64()?;
        let seq_type = buf.try_get_u16()?;
        let _pad = buf.try_get_u16()?;
        let _pad2 = buf.try_get_u32()?;
        Ok(MessageHeader {
            version,
            compat,
            flags,
            seq_id,
            seq_type,
        })
    }
}

/// The per-element record of a stream message: one per element, immediately before that
///  element's data.
///
/// `elem_idx` is a rolling per-connection counter (wrapping); `total_elems` is constant across
///  all elements of one message, and `elem_pos` is this element's 0-based position among them.
///  The receiver validates both against the first element's values to detect stream
///  desynchronization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementHeader {
    pub elem_idx: u16,
    pub total_elems: u8,
    pub elem_pos: u8,
    pub byte_len: u32,
    pub type_tag: u64,
}

impl ElementHeader {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.elem_idx);
        buf.put_u8(self.total_elems);
        buf.put_u8(self.elem_pos);
        buf.put_u32(self.byte_len);
        buf.put_u64(self.type_tag);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ElementHeader> {
        let elem_idx = buf.try_get_u16()?;
        let total_elems = buf.try_get_u8()?;
        let elem_pos = buf.try_get_u8()?;
        let byte_len = buf.try_get_u32()?;
        let type_tag = buf.try_get_u64()?;
        Ok(ElementHeader {
            elem_idx,
            total_elems,
            elem_pos,
            byte_len,
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
    #[case::plain(
        MessageHeader::new(MessageFlags::SEGMENTS_FOLLOW, 0x0102030405060708, 9),
        vec![
            0,1, 0,1,                  // version, compat
            0,0,0,1,                   // flags
            1,2,3,4,5,6,7,8,           // seq_id
            0,9,                       // seq_type
            0,0, 0,0,0,0,              // padding
        ]
    )]
    #[case::named(
        MessageHeader::new(MessageFlags::SEGMENTS_FOLLOW | MessageFlags::NAME_FOLLOWS, 1, 0xffff),
        vec![
            0,1, 0,1,
            0,0,0,3,
            0,0,0,0,0,0,0,1,
            255,255,
            0,0, 0,0,0,0,
        ]
    )]
    #[case::empty(
        MessageHeader::new(MessageFlags::empty(), 0, 0),
        vec![
            0,1, 0,1,
            0,0,0,0,
            0,0,0,0,0,0,0,0,
            0,0,
            0,0, 0,0,0,0,
        ]
    )]
    fn test_message_header_ser(#[case] header: MessageHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), MessageHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = MessageHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::first(
        ElementHeader { elem_idx: 7, total_elems: 3, elem_pos: 0, byte_len: 0x01020304, type_tag: 0x1122334455667788 },
        vec![0,7, 3, 0, 1,2,3,4, 0x11,0x22,0x33,0x44,0x55,0x66,0x77,0x88]
    )]
    #[case::wrapping_idx(
        ElementHeader { elem_idx: u16::MAX, total_elems: 255, elem_pos: 254, byte_len: 0, type_tag: 0 },
        vec![255,255, 255, 254, 0,0,0,0, 0,0,0,0,0,0,0,0]
    )]
    fn test_element_header_ser(#[case] header: ElementHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), ElementHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = ElementHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_short_buffer_is_an_error() {
        let bytes = [0u8; MessageHeader::SERIALIZED_LEN - 1];
        let mut b: &[u8] = &bytes;
        assert!(MessageHeader::deser(&mut b).is_err());

        let bytes = [0u8; ElementHeader::SERIALIZED_LEN - 1];
        let mut b: &[u8] = &bytes;
        assert!(ElementHeader::deser(&mut b).is_err());
    }
}
