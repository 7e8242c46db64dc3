use bytes::Bytes;
use std::net::SocketAddr;

/// One typed, length-delimited chunk of a [Sequence]'s payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub type_tag: u64,
    pub data: Bytes,
}

/// The transport a received [Sequence] arrived on, recorded as out-of-band metadata together
///  with the sender's address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportLabel {
    Stream,
    Datagram,
    RawDatagram,
}

/// Out-of-band receive metadata: where a [Sequence] came from and how.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Origin {
    pub sender: SocketAddr,
    pub transport: TransportLabel,
}

/// The application-level message container carried by this transport: an ordered list of typed
///  byte elements plus identity metadata.
///
/// The transport layer consumes it through a small contract: element iteration for
///  serialization, element append while parsing off the wire, and id / type / name /
///  generation accessors. The `generation` counter distinguishes successive sends of the same
///  logical Sequence object on the datagram path; it is bumped once per send unless the caller
///  opts out via [crate::stream_send::SendOptions::REUSE_GENERATION].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sequence {
    id: u64,
    seq_type: u16,
    name: Option<String>,
    generation: u16,
    elements: Vec<Element>,
    origin: Option<Origin>,
}

impl Sequence {
    pub fn new(id: u64, seq_type: u16) -> Sequence {
        Sequence {
            id,
            seq_type,
            name: None,
            generation: 0,
            elements: Vec::new(),
            origin: None,
        }
    }

    /// For callers that do not manage an id space of their own: a fresh Sequence with a
    ///  randomly allocated identifier.
    pub fn with_generated_id(seq_type: u16) -> Sequence {
        Sequence::new(rand::random(), seq_type)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn seq_type(&self) -> u16 {
        self.seq_type
    }

    pub fn set_seq_type(&mut self, seq_type: u16) {
        self.seq_type = seq_type;
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u16) {
        self.generation = generation;
    }

    /// Advance the per-send generation counter, returning the new value. Wraps.
    pub fn bump_generation(&mut self) -> u16 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub fn push_element(&mut self, type_tag: u64, data: Bytes) {
        self.elements.push(Element { type_tag, data });
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter()
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The summed byte length of all elements, excluding any header overhead.
    pub fn total_payload_len(&self) -> usize {
        self.elements.iter().map(|e| e.data.len()).sum()
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub(crate) fn set_origin(&mut self, origin: Origin) {
        self.origin = Some(origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_bump_wraps() {
        let mut seq = Sequence::new(1, 2);
        assert_eq!(seq.generation(), 0);
        assert_eq!(seq.bump_generation(), 1);

        seq.set_generation(u16::MAX);
        assert_eq!(seq.bump_generation(), 0);
    }

    #[test]
    fn test_elements_in_insertion_order() {
        let mut seq = Sequence::new(1, 2);
        seq.push_element(10, Bytes::from_static(b"abc"));
        seq.push_element(11, Bytes::from_static(b""));
        seq.push_element(12, Bytes::from_static(b"de"));

        assert_eq!(seq.element_count(), 3);
        assert_eq!(seq.total_payload_len(), 5);

        let tags: Vec<u64> = seq.elements().map(|e| e.type_tag).collect();
        assert_eq!(tags, vec![10, 11, 12]);
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = Sequence::with_generated_id(0);
        let b = Sequence::with_generated_id(0);
        // not a proof, but a collision here is a one-in-2^64 event
        assert_ne!(a.id(), b.id());
    }
}
