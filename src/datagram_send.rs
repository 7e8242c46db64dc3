//! The datagram fragmentation codec: splits one Sequence across the minimum number of
//!  fixed-capacity datagrams, with no element ever silently truncated.
//!
//! Two passes over the same elements with identical space arithmetic: pass 1 computes the
//!  total fragment count without emitting a byte, pass 2 emits datagrams carrying that fixed
//!  count in every [FragmentHeader]. The receiver thus learns the full extent of the send from
//!  whichever fragment arrives first.

use crate::datagram_header::{Fragment0Header, FragmentHeader, SegmentHeader};
use crate::datagram_socket::DatagramSink;
use crate::error::{Result, TransportError};
use crate::safe_converter::PrecheckedCast;
use crate::sequence::Sequence;
use crate::stream_send::SendOptions;
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct DatagramSender {
    sink: Arc<dyn DatagramSink>,
    max_datagram_payload: usize,
    /// A per-sender random value distinguishing concurrent senders that reuse the same
    ///  Sequence identifier and generation. Stamped into every fragment.
    sender_nonce: u32,
}

impl DatagramSender {
    pub fn new(sink: Arc<dyn DatagramSink>, max_datagram_payload: usize) -> DatagramSender {
        Self::with_nonce(sink, max_datagram_payload, rand::random())
    }

    #[cfg(test)]
    pub(crate) fn with_nonce(sink: Arc<dyn DatagramSink>, max_datagram_payload: usize, sender_nonce: u32) -> DatagramSender {
        DatagramSender {
            sink,
            max_datagram_payload,
            sender_nonce,
        }
    }

    #[cfg(not(test))]
    fn with_nonce(sink: Arc<dyn DatagramSink>, max_datagram_payload: usize, sender_nonce: u32) -> DatagramSender {
        DatagramSender {
            sink,
            max_datagram_payload,
            sender_nonce,
        }
    }

    pub fn sender_nonce(&self) -> u32 {
        self.sender_nonce
    }

    /// Send one Sequence as one or more datagrams, returning the fragment count. A Sequence
    ///  with zero elements still produces one header-only datagram so the receiver observes
    ///  completion.
    ///
    /// The generation counter is bumped once per call unless
    ///  [SendOptions::REUSE_GENERATION] is set, so the receiver can disambiguate this call's
    ///  fragments from any other in-flight send of the same Sequence identity.
    pub async fn send(&self, sequence: &mut Sequence, to: SocketAddr, options: SendOptions) -> Result<u64> {
        for (idx, element) in sequence.elements().enumerate() {
            if element.data.len() > u32::MAX as usize {
                return Err(TransportError::OversizedMessage(format!(
                    "element {} is {} bytes long, the wire format caps elements at {} bytes",
                    idx, element.data.len(), u32::MAX,
                )));
            }
        }
        if sequence.element_count() > u32::MAX as usize {
            return Err(TransportError::OversizedMessage(format!(
                "{} elements, the wire format caps the element index at {}",
                sequence.element_count(), u32::MAX,
            )));
        }
        if let Some(name) = sequence.name() {
            if name.len() > u16::MAX as usize {
                return Err(TransportError::OversizedMessage(format!(
                    "name is {} bytes long, the wire format caps names at {} bytes",
                    name.len(), u16::MAX,
                )));
            }
        }
        // the name travels whole in fragment 0, so its fixed prefix must fit one datagram
        let fragment0_prefix = FragmentHeader::SERIALIZED_LEN
            + Fragment0Header::SERIALIZED_LEN
            + 2
            + sequence.name().map_or(0, str::len);
        if fragment0_prefix > self.max_datagram_payload {
            return Err(TransportError::OversizedMessage(format!(
                "fragment 0 needs {} bytes for its headers and name, exceeding the datagram payload size of {}",
                fragment0_prefix, self.max_datagram_payload,
            )));
        }

        let generation = if options.contains(SendOptions::REUSE_GENERATION) {
            sequence.generation()
        }
        else {
            sequence.bump_generation()
        };

        // pass 1: layout only - the total fragment count must be known before any datagram
        //  goes out
        let total_fragments = self.walk(sequence, to, 0, generation, false).await?;
        debug!("sending sequence {:#x} gen {} to {:?} as {} fragment(s)", sequence.id(), generation, to, total_fragments);

        // pass 2: emit, repeating the same arithmetic
        let emitted = self.walk(sequence, to, total_fragments, generation, true).await?;
        debug_assert_eq!(emitted, total_fragments, "layout and emit passes disagree");

        Ok(total_fragments)
    }

    /// The shared fragment walk. With `emit` false it only accounts for space; with `emit`
    ///  true it writes and sends datagrams. Both passes run the exact same arithmetic, which
    ///  is what guarantees the pre-computed fragment count is honored.
    async fn walk(
        &self,
        sequence: &Sequence,
        to: SocketAddr,
        total_fragments: u64,
        generation: u16,
        emit: bool,
    ) -> Result<u64> {
        let capacity = self.max_datagram_payload;
        let mut buf = BytesMut::with_capacity(if emit { capacity } else { 0 });
        let mut fragment_idx: u64 = 0;
        let mut used = FragmentHeader::SERIALIZED_LEN;

        if emit {
            self.fragment_header(sequence, total_fragments, 0, generation).ser(&mut buf);
        }

        // fragment 0 carries the once-per-Sequence metadata
        let name = sequence.name().unwrap_or("");
        used += Fragment0Header::SERIALIZED_LEN + 2 + name.len();
        if emit {
            Fragment0Header {
                total_len: sequence.total_payload_len() as u64,
                seq_type: sequence.seq_type(),
            }.ser(&mut buf);
            buf.put_u16(name.len().prechecked_cast());
            buf.put_slice(name.as_bytes());
        }

        for (idx, element) in sequence.elements().enumerate() {
            let total_len = element.data.len();
            let mut offset = 0;

            loop {
                let data_left = total_len - offset;
                // a segment header with zero payload is only acceptable for an empty element
                let min_chunk = if data_left == 0 { 0 } else { 1 };

                if used + SegmentHeader::SERIALIZED_LEN + min_chunk > capacity {
                    if emit {
                        trace!("fragment {} full at {} bytes, starting the next", fragment_idx, buf.len());
                        self.sink.send_datagram(to, &buf).await?;
                        buf.clear();
                    }
                    fragment_idx += 1;
                    used = FragmentHeader::SERIALIZED_LEN;
                    if emit {
                        self.fragment_header(sequence, total_fragments, fragment_idx, generation).ser(&mut buf);
                    }
                    continue;
                }

                let chunk = data_left.min(capacity - used - SegmentHeader::SERIALIZED_LEN);
                if emit {
                    SegmentHeader {
                        elem_idx: idx.prechecked_cast(),
                        elem_total_len: total_len.prechecked_cast(),
                        elem_offset: offset.prechecked_cast(),
                        type_tag: element.type_tag,
                    }.ser(&mut buf);
                    buf.put_slice(&element.data[offset..offset + chunk]);
                }
                used += SegmentHeader::SERIALIZED_LEN + chunk;
                offset += chunk;

                if offset == total_len {
                    break;
                }
            }
        }

        if emit {
            debug_assert_eq!(buf.len(), used);
            self.sink.send_datagram(to, &buf).await?;
        }
        Ok(fragment_idx + 1)
    }

    fn fragment_header(&self, sequence: &Sequence, total_fragments: u64, fragment_idx: u64, generation: u16) -> FragmentHeader {
        FragmentHeader {
            seq_id: sequence.id(),
            total_fragments,
            fragment_idx,
            flags: 0,
            generation,
            sender_nonce: self.sender_nonce,
        }
    }
}
