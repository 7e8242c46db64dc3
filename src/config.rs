use crate::datagram_header::{Fragment0Header, FragmentHeader, SegmentHeader};
use anyhow::bail;
use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

/// Optional socket knobs applied at bind / connect time. Every knob defaults to 'leave the OS
///  default alone'.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub nodelay: Option<bool>,
    pub reuseaddr: Option<bool>,
    pub send_buffer_size: Option<u32>,
    pub recv_buffer_size: Option<u32>,
}

impl SocketOptions {
    pub(crate) fn apply_tcp(&self, socket: &TcpSocket) -> std::io::Result<()> {
        if let Some(reuseaddr) = self.reuseaddr {
            socket.set_reuseaddr(reuseaddr)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }

    /// `nodelay` lives on the connected stream rather than the socket
    pub(crate) fn apply_stream(&self, stream: &TcpStream) -> std::io::Result<()> {
        if let Some(nodelay) = self.nodelay {
            stream.set_nodelay(nodelay)?;
        }
        Ok(())
    }

    pub(crate) fn apply_udp(&self, socket: &socket2::Socket) -> std::io::Result<()> {
        if let Some(reuseaddr) = self.reuseaddr {
            socket.set_reuse_address(reuseaddr)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size as usize)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size as usize)?;
        }
        Ok(())
    }
}

pub type SocketCallback = Arc<dyn Fn(SocketAddr) + Send + Sync>;
pub type DroppedCallback = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle callbacks fired when a transport's underlying descriptor is opened or closed, and
///  when the transport value itself is dropped.
#[derive(Clone, Default)]
pub struct SocketHooks {
    pub socket_opened: Option<SocketCallback>,
    pub socket_closed: Option<SocketCallback>,
    pub transport_dropped: Option<DroppedCallback>,
}

impl SocketHooks {
    pub(crate) fn fire_opened(&self, addr: SocketAddr) {
        if let Some(hook) = &self.socket_opened {
            hook(addr);
        }
    }

    pub(crate) fn fire_closed(&self, addr: SocketAddr) {
        if let Some(hook) = &self.socket_closed {
            hook(addr);
        }
    }

    pub(crate) fn fire_dropped(&self) {
        if let Some(hook) = &self.transport_dropped {
            hook();
        }
    }
}

impl Debug for SocketHooks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHooks")
            .field("socket_opened", &self.socket_opened.is_some())
            .field("socket_closed", &self.socket_closed.is_some())
            .field("transport_dropped", &self.transport_dropped.is_some())
            .finish()
    }
}

/// Configuration for the stream transport (listener, connections and the reconnecting client).
#[derive(Clone)]
pub struct StreamConfig {
    /// The initial capacity of each connection's receive cache. The cache doubles only when a
    ///  single inbound message exceeds it, so this is a working-set size, not a hard limit.
    pub read_cache_capacity: usize,

    /// How long the reconnecting client waits between reconnect attempts after a detected
    ///  reset or error.
    pub reconnect_interval: Duration,

    pub accept_backlog: u32,

    pub socket_options: SocketOptions,
    pub hooks: SocketHooks,
}

impl StreamConfig {
    pub fn default_config() -> StreamConfig {
        StreamConfig {
            read_cache_capacity: 64 * 1024,
            reconnect_interval: Duration::from_secs(5),
            accept_backlog: 128,
            socket_options: SocketOptions::default(),
            hooks: SocketHooks::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_cache_capacity < crate::stream_header::MessageHeader::SERIALIZED_LEN {
            bail!("read cache capacity is smaller than a message header");
        }
        if self.reconnect_interval.is_zero() {
            bail!("reconnect interval must be non-zero");
        }
        Ok(())
    }
}

pub type LossInjection = Arc<dyn Fn(&[u8], SocketAddr) -> bool + Send + Sync>;

/// The smallest datagram payload the fragmentation codec can work with: fragment 0's headers,
///  an empty name, one segment header and a little room for data.
pub const MIN_DATAGRAM_PAYLOAD: usize = FragmentHeader::SERIALIZED_LEN
    + Fragment0Header::SERIALIZED_LEN
    + 2
    + SegmentHeader::SERIALIZED_LEN
    + 8;

/// Configuration for the datagram transport (raw substrate, fragmenting sender and
///  reassembling listener).
#[derive(Clone)]
pub struct DatagramConfig {
    /// The capacity bound used to decide fragment boundaries on the send path, i.e. the
    ///  payload size this transport assumes fits one un-fragmented UDP packet end to end.
    ///
    /// With full Ethernet frames and no optional IP headers this is `1500 - 20 - 8 = 1472` for
    ///  IPV4. There may be surprising network hardware on (some of) the routes, so the
    ///  responsibility for choosing this stays with the application rather than this crate
    ///  guessing.
    pub max_datagram_payload: usize,

    /// join this group on bind (receive side)
    pub multicast_group: Option<Ipv4Addr>,
    /// send multicast traffic through this interface (send side)
    pub multicast_interface: Option<Ipv4Addr>,

    /// cadence of the reassembly table's eviction scan
    pub eviction_tick: Duration,
    /// partial sequences older than this are evicted regardless of completion state. This is
    ///  the sole defense against unbounded memory growth from lost fragments: there is no
    ///  retransmission on this path.
    pub staleness_threshold: Duration,

    pub socket_options: SocketOptions,
    pub hooks: SocketHooks,

    /// Consulted per inbound datagram before reassembly; `true` drops it. For fault-injection
    ///  tests.
    pub loss_injection: Option<LossInjection>,
}

impl DatagramConfig {
    pub fn default_ipv4() -> DatagramConfig {
        DatagramConfig {
            max_datagram_payload: 1472,
            multicast_group: None,
            multicast_interface: None,
            eviction_tick: Duration::from_millis(200),
            staleness_threshold: Duration::from_secs(1),
            socket_options: SocketOptions::default(),
            hooks: SocketHooks::default(),
            loss_injection: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_payload < MIN_DATAGRAM_PAYLOAD {
            bail!("datagram payload size {} is too small - the fragment headers alone need {}",
                self.max_datagram_payload, MIN_DATAGRAM_PAYLOAD);
        }
        if self.eviction_tick.is_zero() || self.staleness_threshold.is_zero() {
            bail!("eviction tick and staleness threshold must be non-zero");
        }
        Ok(())
    }
}

impl Debug for DatagramConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramConfig")
            .field("max_datagram_payload", &self.max_datagram_payload)
            .field("multicast_group", &self.multicast_group)
            .field("multicast_interface", &self.multicast_interface)
            .field("eviction_tick", &self.eviction_tick)
            .field("staleness_threshold", &self.staleness_threshold)
            .field("socket_options", &self.socket_options)
            .field("hooks", &self.hooks)
            .field("loss_injection", &self.loss_injection.is_some())
            .finish()
    }
}
