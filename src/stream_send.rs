//! The stream framing encoder and its send loop.
//!
//! One Sequence becomes one message: `[MessageHeader] [name_len + name]?
//!  [ElementHeader data]...`, assembled as a scatter list and written with a single vectored
//!  I/O call where possible.
//!
//! Partial-send recovery: if the socket accepts fewer bytes than requested, the first buffer
//!  not fully consumed is located by walking cumulative lengths, and a continuation vector
//!  starting at the unconsumed offset is reissued until the whole message is flushed, awaiting
//!  socket writability between attempts. A nominally non-blocking send thereby awaits
//!  completion to guarantee atomicity of one logical message - a known latency-spike source
//!  under backpressure, accepted deliberately: the alternative is interleaved garbage on the
//!  stream.

use crate::error::{Result, TransportError};
use crate::safe_converter::PrecheckedCast;
use crate::sequence::Sequence;
use crate::stream_header::{ElementHeader, MessageFlags, MessageHeader, MAX_ELEMENTS_PER_MESSAGE};
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::io::IoSlice;
use tokio::net::TcpStream;
use tracing::trace;

bitflags! {
    /// Per-call send options, accepted by every send operation of this crate.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SendOptions: u32 {
        /// do not bump the Sequence's generation counter for this send
        const REUSE_GENERATION = 1 << 0;
        /// Fail with [TransportError::WouldBlock] instead of awaiting initial socket
        ///  writability. Once any bytes of a message are accepted, completion is mandatory
        ///  regardless of this flag.
        const NO_WAIT = 1 << 1;
    }
}

/// The socket operations the stream codec needs, introduced to facilitate driving the send and
///  receive loops against a scripted socket in tests.
#[async_trait]
pub trait StreamSocket: Send + Sync + 'static {
    async fn await_writable(&self) -> io::Result<()>;
    async fn await_readable(&self) -> io::Result<()>;
    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
    fn try_read_buf(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl StreamSocket for TcpStream {
    async fn await_writable(&self) -> io::Result<()> {
        self.writable().await
    }

    async fn await_readable(&self) -> io::Result<()> {
        self.readable().await
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        TcpStream::try_write_vectored(self, bufs)
    }

    fn try_read_buf(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }
}

/// Encode one Sequence into the scatter list for one stream message. Element data buffers are
///  referenced, not copied.
///
/// The Sequence's generation counter is bumped unless
///  [SendOptions::REUSE_GENERATION] is set. `next_elem_idx` is the connection's rolling
///  element counter, advanced (wrapping) once per element.
///
/// Limits are enforced before anything is assembled: more than 255 elements, a single element
///  longer than `u32::MAX` or a name longer than `u16::MAX` bytes are rejected as
///  [TransportError::OversizedMessage].
pub fn encode_message(
    sequence: &mut Sequence,
    next_elem_idx: &mut u16,
    options: SendOptions,
) -> Result<Vec<Bytes>> {
    let num_elements = sequence.element_count();
    if num_elements > MAX_ELEMENTS_PER_MESSAGE {
        return Err(TransportError::OversizedMessage(format!(
            "{} elements, the stream transport can represent at most {}",
            num_elements, MAX_ELEMENTS_PER_MESSAGE,
        )));
    }
    for (pos, element) in sequence.elements().enumerate() {
        if element.data.len() > u32::MAX as usize {
            return Err(TransportError::OversizedMessage(format!(
                "element {} is {} bytes long, the wire format caps elements at {} bytes",
                pos, element.data.len(), u32::MAX,
            )));
        }
    }
    if let Some(name) = sequence.name() {
        if name.len() > u16::MAX as usize {
            return Err(TransportError::OversizedMessage(format!(
                "name is {} bytes long, the wire format caps names at {} bytes",
                name.len(), u16::MAX,
            )));
        }
    }

    if !options.contains(SendOptions::REUSE_GENERATION) {
        sequence.bump_generation();
    }

    let mut flags = MessageFlags::empty();
    if num_elements > 0 {
        flags |= MessageFlags::SEGMENTS_FOLLOW;
    }
    if sequence.name().is_some() {
        flags |= MessageFlags::NAME_FOLLOWS;
    }

    let mut buffers = Vec::with_capacity(1 + 2 * num_elements);

    let mut head = BytesMut::with_capacity(
        MessageHeader::SERIALIZED_LEN + sequence.name().map(|n| n.len() + 2).unwrap_or(0));
    MessageHeader::new(flags, sequence.id(), sequence.seq_type()).ser(&mut head);
    if let Some(name) = sequence.name() {
        head.put_u16(name.len().prechecked_cast());
        head.put_slice(name.as_bytes());
    }
    buffers.push(head.freeze());

    for (pos, element) in sequence.elements().enumerate() {
        let mut header_buf = BytesMut::with_capacity(ElementHeader::SERIALIZED_LEN);
        ElementHeader {
            elem_idx: *next_elem_idx,
            total_elems: num_elements.prechecked_cast(),
            elem_pos: pos.prechecked_cast(),
            byte_len: element.data.len().prechecked_cast(),
            type_tag: element.type_tag,
        }.ser(&mut header_buf);
        *next_elem_idx = next_elem_idx.wrapping_add(1);

        buffers.push(header_buf.freeze());
        if !element.data.is_empty() {
            buffers.push(element.data.clone());
        }
    }

    Ok(buffers)
}

/// the tail of `bufs` after skipping `skip` already-written bytes, as a fresh vectored-write list
fn continuation<'a>(bufs: &'a [Bytes], mut skip: usize) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        slices.push(IoSlice::new(&buf[skip..]));
        skip = 0;
    }
    slices
}

/// Write the scatter list to the socket as one atomic message, reissuing continuations after
///  short writes until everything is flushed.
pub(crate) async fn send_scatter(
    socket: &dyn StreamSocket,
    bufs: &[Bytes],
    options: SendOptions,
) -> Result<()> {
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    let mut written = 0;
    let mut first_attempt = true;

    while written < total {
        if !(first_attempt && options.contains(SendOptions::NO_WAIT)) {
            socket.await_writable().await?;
        }

        let slices = continuation(bufs, written);
        match socket.try_write_vectored(&slices) {
            Ok(0) => return Err(TransportError::PeerReset),
            Ok(n) => {
                written += n;
                if written < total {
                    trace!("short write: {} of {} bytes accepted, reissuing continuation", written, total);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if first_attempt && options.contains(SendOptions::NO_WAIT) {
                    // nothing written, the stream is clean - the caller may retry the whole message
                    return Err(TransportError::WouldBlock);
                }
                // spurious readiness, await writability again
            }
            Err(e) => return Err(e.into()),
        }
        first_attempt = false;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_socket {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub enum WriteStep {
        /// accept at most this many bytes
        Accept(usize),
        WouldBlock,
    }

    /// A [StreamSocket] whose write behaviour follows a script and whose read side replays a
    ///  canned byte stream in configurable chunk sizes.
    pub struct ScriptedSocket {
        write_script: Mutex<VecDeque<WriteStep>>,
        pub written: Mutex<Vec<u8>>,
        read_data: Mutex<VecDeque<u8>>,
        read_chunk_size: usize,
        /// when the canned read data is exhausted: report EOF (stream closed) or WouldBlock
        eof_on_empty: bool,
    }

    impl ScriptedSocket {
        pub fn new() -> ScriptedSocket {
            ScriptedSocket {
                write_script: Mutex::new(VecDeque::new()),
                written: Mutex::new(Vec::new()),
                read_data: Mutex::new(VecDeque::new()),
                read_chunk_size: usize::MAX,
                eof_on_empty: true,
            }
        }

        pub fn with_write_script(steps: Vec<WriteStep>) -> ScriptedSocket {
            let socket = ScriptedSocket::new();
            *socket.write_script.lock().unwrap() = steps.into();
            socket
        }

        pub fn with_read_data(data: Vec<u8>, chunk_size: usize) -> ScriptedSocket {
            let mut socket = ScriptedSocket::new();
            *socket.read_data.lock().unwrap() = data.into();
            socket.read_chunk_size = chunk_size;
            socket
        }

        /// like [Self::with_read_data], but an exhausted read side reports WouldBlock rather
        ///  than EOF
        pub fn with_pending_read_data(data: Vec<u8>, chunk_size: usize) -> ScriptedSocket {
            let mut socket = ScriptedSocket::with_read_data(data, chunk_size);
            socket.eof_on_empty = false;
            socket
        }
    }

    #[async_trait]
    impl StreamSocket for ScriptedSocket {
        async fn await_writable(&self) -> io::Result<()> {
            Ok(())
        }

        async fn await_readable(&self) -> io::Result<()> {
            Ok(())
        }

        fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let budget = match self.write_script.lock().unwrap().pop_front() {
                Some(WriteStep::Accept(n)) => n,
                Some(WriteStep::WouldBlock) => return Err(io::ErrorKind::WouldBlock.into()),
                None => usize::MAX,
            };

            let mut written = self.written.lock().unwrap();
            let mut remaining = budget;
            let mut accepted = 0;
            for buf in bufs {
                let n = remaining.min(buf.len());
                written.extend_from_slice(&buf[..n]);
                accepted += n;
                remaining -= n;
                if remaining == 0 {
                    break;
                }
            }
            Ok(accepted)
        }

        fn try_read_buf(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut data = self.read_data.lock().unwrap();
            if data.is_empty() {
                if self.eof_on_empty {
                    return Ok(0); // EOF
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(data.len()).min(self.read_chunk_size);
            for slot in buf.iter_mut().take(n) {
                *slot = data.pop_front().unwrap();
            }
            Ok(n)
        }
    }
}
