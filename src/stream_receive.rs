//! The stream framing decoder: `AwaitHeader -> (AwaitName)? -> AwaitElements -> Complete`.
//!
//! Parsing is a pure function over the connection's [StreamReadCache]; the async fill loop
//!  around it reads from the socket whenever the cache does not hold a complete message yet.
//!  A parse attempt that runs out of bytes advances nothing, so after any socket error or EOF
//!  the cursor still sits at the last confirmed-clean message boundary and no
//!  partially-consumed bytes are lost on retry.

use crate::error::{Result, TransportError};
use crate::read_cache::StreamReadCache;
use crate::safe_converter::SafeCast;
use crate::sequence::Sequence;
use crate::stream_header::{ElementHeader, MessageFlags, MessageHeader, PROTOCOL_VERSION};
use crate::stream_send::StreamSocket;
use anyhow::anyhow;
use bytes::Buf;
use std::io;
use tracing::{trace, warn};

pub struct StreamDecoder {
    cache: StreamReadCache,
}

enum ParseOutcome {
    /// a complete message spanning this many cached bytes
    Complete(Sequence, usize),
    NeedMore,
    /// a header violated an invariant after this many parseable bytes
    Desync(anyhow::Error, usize),
}

impl StreamDecoder {
    pub fn new(cache_capacity: usize) -> StreamDecoder {
        StreamDecoder {
            cache: StreamReadCache::new(cache_capacity),
        }
    }

    /// Attempt to parse one complete message from cached bytes. `Ok(None)` means more bytes
    ///  are needed; at this layer that is indistinguishable from 'nothing will ever arrive'.
    pub fn try_decode(&mut self) -> Result<Option<Sequence>> {
        match Self::parse(self.cache.unparsed()) {
            ParseOutcome::Complete(sequence, consumed) => {
                self.cache.advance(consumed);
                self.cache.commit();
                trace!("decoded message of {} bytes with {} elements", consumed, sequence.element_count());
                Ok(Some(sequence))
            }
            ParseOutcome::NeedMore => Ok(None),
            ParseOutcome::Desync(error, consumed) => {
                // discard the malformed message's parseable prefix; the connection lives on
                self.cache.advance(consumed);
                self.cache.commit();
                warn!("protocol desynchronization on stream receive: {:#}", error);
                Err(TransportError::ProtocolDesync(error))
            }
        }
    }

    fn parse(unparsed: &[u8]) -> ParseOutcome {
        let mut buf: &[u8] = unparsed;
        // NB: Buf on a slice advances the slice itself, so the consumed count falls out of
        //  the remaining length
        macro_rules! consumed {
            () => { unparsed.len() - buf.len() };
        }

        if buf.len() < MessageHeader::SERIALIZED_LEN {
            return ParseOutcome::NeedMore;
        }
        let header = MessageHeader::deser(&mut buf)
            .expect("length was checked above");

        if header.compat > PROTOCOL_VERSION {
            return ParseOutcome::Desync(
                anyhow!("peer requires protocol version {}, ours is {}", header.compat, PROTOCOL_VERSION),
                consumed!(),
            );
        }

        let mut sequence = Sequence::new(header.seq_id, header.seq_type);

        if header.flags.contains(MessageFlags::NAME_FOLLOWS) {
            if buf.len() < 2 {
                return ParseOutcome::NeedMore;
            }
            let name_len: usize = buf.get_u16().into();
            if buf.len() < name_len {
                return ParseOutcome::NeedMore;
            }
            match String::from_utf8(buf[..name_len].to_vec()) {
                Ok(name) => sequence.set_name(name),
                Err(_) => {
                    return ParseOutcome::Desync(anyhow!("sequence name is not valid UTF-8"), consumed!());
                }
            }
            buf.advance(name_len);
        }

        if header.flags.contains(MessageFlags::SEGMENTS_FOLLOW) {
            // the element count is authoritative from the first element's header
            let mut total_elems = 0u8;

            for pos in 0.. {
                if buf.len() < ElementHeader::SERIALIZED_LEN {
                    return ParseOutcome::NeedMore;
                }
                let elem_header = ElementHeader::deser(&mut buf)
                    .expect("length was checked above");

                if pos == 0 {
                    if elem_header.total_elems == 0 {
                        return ParseOutcome::Desync(
                            anyhow!("segments-present flag is set but the first element declares a count of 0"),
                            consumed!(),
                        );
                    }
                    total_elems = elem_header.total_elems;
                }
                else if elem_header.total_elems != total_elems {
                    return ParseOutcome::Desync(
                        anyhow!("inconsistent element count: first element declared {}, element {} declares {}",
                            total_elems, pos, elem_header.total_elems),
                        consumed!(),
                    );
                }
                if usize::from(elem_header.elem_pos) != pos {
                    return ParseOutcome::Desync(
                        anyhow!("element position {} where {} was expected", elem_header.elem_pos, pos),
                        consumed!(),
                    );
                }

                let byte_len: usize = elem_header.byte_len.safe_cast();
                if buf.len() < byte_len {
                    return ParseOutcome::NeedMore;
                }
                sequence.push_element(elem_header.type_tag, buf.copy_to_bytes(byte_len));

                if pos + 1 == usize::from(total_elems) {
                    break;
                }
            }
        }

        ParseOutcome::Complete(sequence, consumed!())
    }

    pub(crate) fn cache_mut(&mut self) -> &mut StreamReadCache {
        &mut self.cache
    }

    #[cfg(test)]
    pub(crate) fn push_bytes(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            self.cache.ensure_space();
            let spare = self.cache.spare_capacity();
            let n = spare.len().min(data.len());
            spare[..n].copy_from_slice(&data[..n]);
            self.cache.mark_filled(n);
            data = &data[n..];
        }
    }
}

/// one non-blocking socket read into the cache; `Ok(false)` means the socket had nothing
fn read_once(decoder: &mut StreamDecoder, socket: &dyn StreamSocket) -> Result<bool> {
    let cache = decoder.cache_mut();
    cache.ensure_space();
    match socket.try_read_buf(cache.spare_capacity()) {
        Ok(0) => Err(TransportError::PeerReset),
        Ok(n) => {
            cache.mark_filled(n);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// drive the decoder against the socket until one complete message is available
pub(crate) async fn receive_message(
    decoder: &mut StreamDecoder,
    socket: &dyn StreamSocket,
) -> Result<Sequence> {
    loop {
        if let Some(sequence) = decoder.try_decode()? {
            return Ok(sequence);
        }
        socket.await_readable().await?;
        read_once(decoder, socket)?;
    }
}

/// the non-blocking variant: at most one socket read, `Ok(None)` when no complete message is
///  available yet
pub(crate) fn try_receive_message(
    decoder: &mut StreamDecoder,
    socket: &dyn StreamSocket,
) -> Result<Option<Sequence>> {
    loop {
        if let Some(sequence) = decoder.try_decode()? {
            return Ok(Some(sequence));
        }
        if !read_once(decoder, socket)? {
            return Ok(None);
        }
    }
}
