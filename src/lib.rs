//! A middleware wire transport for *Sequences* - ordered lists of typed byte elements with
//!  identity metadata - over two interchangeable substrates: a reliable byte stream (TCP) and
//!  unreliable datagrams (UDP).
//!
//! ## Design goals
//!
//! * The unit of transfer is a whole [Sequence], never a byte range of one
//!   * on the stream side one Sequence maps to exactly one framed message, written atomically:
//!     once the first byte of a message is on the wire, the rest follows before anything else
//!   * on the datagram side one Sequence maps to one *fragment train* of K datagrams, with the
//!     receiver re-assembling them regardless of arrival order
//! * Element boundaries and type tags survive the transfer: the receiver gets back the same
//!   elements in the same order, not a byte soup
//! * Best-effort on the datagram path - lost fragments are never re-requested. A partial
//!   sequence that stops making progress is evicted on a timer, and a fresh transmission
//!   (distinguished by its `generation`) starts reassembly over from scratch
//! * Non-blocking variants throughout: every receive operation has a `try_` form that reports
//!   'nothing yet' without blocking, and sends can opt into fail-fast via
//!   [stream_send::SendOptions::NO_WAIT]
//! * No interpretation of element payloads - serialization of application data is the layer
//!   above, raw passthrough of foreign datagrams ([datagram_socket::RawDatagramSocket::recv_raw])
//!   is the escape hatch below
//!
//! ## Stream framing
//!
//! One message per Sequence - all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: protocol version (u16)
//!  2: minimal compatible version (u16) - receivers reject messages whose compat version is
//!      above their own protocol version
//!  4: flags (u32): bit 0 'segments follow', bit 1 'name follows', bit 31 'extension' (reserved)
//!  8: sequence id (u64)
//! 16: sequence type (u16)
//! 18: padding (u16 + u32), written as zero
//! ```
//!
//! followed by `[name length (u16)][name bytes]` if bit 1 is set, followed by one element
//!  header per element:
//!
//! ```ascii
//!  0: element index (u16) - rolling per-connection counter, wraps
//!  2: total element count (u8)
//!  3: element position (u8)
//!  4: element byte length (u32)
//!  8: element type tag (u64)
//! ```
//!
//! with the element's bytes following each header directly.
//!
//! ## Datagram fragmentation
//!
//! Each datagram of a fragment train starts with the fragment header:
//!
//! ```ascii
//!  0: sequence id (u64)
//!  8: total number of fragments (u64)
//! 16: fragment index (u64)
//! 24: flags (u32)
//! 28: generation (u16) - per-send counter distinguishing successive transmissions
//! 30: sender nonce (u32) - random per sending socket, disambiguates senders behind NAT
//! ```
//!
//! Fragment 0 additionally carries `[total payload length (u64)][sequence type (u16)]` plus
//!  the optional name, before any segment. Every element piece in any fragment is preceded by
//!  a segment header:
//!
//! ```ascii
//!  0: element index (u32)
//!  4: element total length (u32)
//!  8: element offset (u32)
//! 12: element type tag (u64)
//! ```
//!
//! The piece length is implied: a segment extends to the end of its datagram or to the end of
//!  its element, whichever comes first. Both sides derive it as
//!  `min(bytes remaining in datagram, element total length - element offset)`.

pub mod config;
pub mod datagram_header;
pub mod datagram_listener;
pub mod datagram_send;
pub mod datagram_socket;
pub mod error;
pub mod read_cache;
pub mod reassembly;
pub mod safe_converter;
pub mod sequence;
pub mod stream_client;
pub mod stream_header;
pub mod stream_receive;
pub mod stream_send;
pub mod stream_server;

pub use config::{DatagramConfig, SocketHooks, SocketOptions, StreamConfig};
pub use datagram_listener::DatagramListener;
pub use datagram_send::DatagramSender;
pub use datagram_socket::RawDatagramSocket;
pub use error::{Result, TransportError};
pub use sequence::{Element, Origin, Sequence, TransportLabel};
pub use stream_client::StreamClient;
pub use stream_send::SendOptions;
pub use stream_server::{StreamConnection, StreamListener};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
