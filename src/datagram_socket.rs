//! The raw datagram substrate: one non-blocking UDP socket whose unit of transfer is exactly
//!  one datagram payload. No framing, no multi-packet concept - the fragmentation codec and
//!  the reassembly engine are layered on top of this.

use crate::config::DatagramConfig;
use crate::error::{Result, TransportError};
use crate::sequence::{Origin, Sequence, TransportLabel};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, info, trace};

/// An abstraction for emitting one datagram, introduced to facilitate mocking the I/O part
///  away when testing the fragmentation codec.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSink: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, payload: &[u8]) -> Result<()>;
}

pub struct RawDatagramSocket {
    socket: Arc<UdpSocket>,
    config: Arc<DatagramConfig>,
    local_addr: SocketAddr,
}

impl RawDatagramSocket {
    /// Bind a non-blocking UDP socket, applying the configured socket options, joining the
    ///  multicast group (receive side) and selecting the multicast egress interface (send
    ///  side) if configured.
    pub async fn bind(addr: SocketAddr, config: DatagramConfig) -> anyhow::Result<RawDatagramSocket> {
        config.validate()?;

        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_nonblocking(true)?;
        config.socket_options.apply_udp(&raw)?;

        if let Some(group) = config.multicast_group {
            let interface = config.multicast_interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
            raw.join_multicast_v4(&group, &interface)?;
            info!("joined multicast group {} on interface {}", group, interface);
        }
        if let Some(interface) = config.multicast_interface {
            raw.set_multicast_if_v4(&interface)?;
        }

        raw.bind(&addr.into())?;

        let socket = UdpSocket::from_std(raw.into())?;
        let local_addr = socket.local_addr()?;
        info!("bound datagram socket to {:?}", local_addr);
        config.hooks.fire_opened(local_addr);

        Ok(RawDatagramSocket {
            socket: Arc::new(socket),
            config: Arc::new(config),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &DatagramConfig {
        &self.config
    }

    /// Non-blocking send of one datagram. `WouldBlock`, peer-reset and other I/O failures map
    ///  to their respective error kinds.
    pub fn try_send_to(&self, payload: &[u8], to: SocketAddr) -> Result<usize> {
        match self.socket.try_send_to(payload, to) {
            Ok(n) => {
                trace!("sent {} byte datagram to {:?}", n, to);
                Ok(n)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn send_to(&self, payload: &[u8], to: SocketAddr) -> Result<usize> {
        loop {
            self.socket.writable().await.map_err(TransportError::from)?;
            match self.try_send_to(payload, to) {
                Err(TransportError::WouldBlock) => continue,
                other => return other,
            }
        }
    }

    /// Non-blocking receive of one datagram into `buf`. `Ok(None)` means no data was
    ///  available - that is not an error and not reported. Real errors are logged with
    ///  context and surfaced; the error condition is cleared per call, the socket stays
    ///  usable.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok((n, from)) => {
                trace!("received {} byte datagram from {:?}", n, from);
                Ok(Some((n, from)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                error!("error receiving datagram on {:?}: {}", self.local_addr, e);
                Err(e.into())
            }
        }
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        loop {
            self.socket.readable().await.map_err(TransportError::from)?;
            match self.try_recv_from(buf)? {
                Some(result) => return Ok(result),
                None => continue,
            }
        }
    }

    /// Raw passthrough send: the first element's bytes go out as one bare, un-framed
    ///  datagram. The counterpart of [Self::recv_raw].
    pub async fn send_raw(&self, sequence: &Sequence, to: SocketAddr) -> Result<()> {
        let payload = sequence.elements().next()
            .map(|e| e.data.as_ref())
            .unwrap_or(&[]);

        if payload.len() > self.config.max_datagram_payload {
            return Err(TransportError::OversizedMessage(format!(
                "raw payload of {} bytes exceeds the datagram payload size of {}",
                payload.len(), self.config.max_datagram_payload,
            )));
        }

        self.send_to(payload, to).await?;
        Ok(())
    }

    /// Raw passthrough receive: one datagram's payload wrapped as a single-element Sequence,
    ///  stamped with the sender's address and the `RawDatagram` transport label.
    pub async fn recv_raw(&self) -> Result<Sequence> {
        let mut buf = vec![0u8; self.config.max_datagram_payload];
        let (n, from) = self.recv_from(&mut buf).await?;

        buf.truncate(n);
        let mut sequence = Sequence::new(0, 0);
        sequence.push_element(0, Bytes::from(buf));
        sequence.set_origin(Origin {
            sender: from,
            transport: TransportLabel::RawDatagram,
        });
        Ok(sequence)
    }
}

impl Drop for RawDatagramSocket {
    fn drop(&mut self) {
        self.config.hooks.fire_closed(self.local_addr);
        self.config.hooks.fire_dropped();
    }
}

#[async_trait]
impl DatagramSink for RawDatagramSocket {
    async fn send_datagram(&self, to: SocketAddr, payload: &[u8]) -> Result<()> {
        self.send_to(payload, to).await?;
        Ok(())
    }
}
