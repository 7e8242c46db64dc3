//! The stream listener and the per-connection handle it produces.

use crate::config::StreamConfig;
use crate::error::{Result, TransportError};
use crate::sequence::{Origin, Sequence, TransportLabel};
use crate::stream_receive::{receive_message, try_receive_message, StreamDecoder};
use crate::stream_send::{encode_message, send_scatter, SendOptions, StreamSocket};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info, span, Instrument, Level, Span};
use uuid::Uuid;

pub struct StreamListener {
    listener: tokio::net::TcpListener,
    config: Arc<StreamConfig>,
    local_addr: SocketAddr,
}

impl StreamListener {
    pub async fn bind(addr: SocketAddr, config: StreamConfig) -> anyhow::Result<StreamListener> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        config.socket_options.apply_tcp(&socket)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.accept_backlog)?;

        let local_addr = listener.local_addr()?;
        info!("listening for stream connections on {:?}", local_addr);
        config.hooks.fire_opened(local_addr);

        Ok(StreamListener {
            listener,
            config,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> Result<StreamConnection> {
        let (stream, peer_addr) = self.listener.accept().await.map_err(TransportError::from)?;
        self.config.socket_options.apply_stream(&stream).map_err(TransportError::from)?;
        debug!("accepted stream connection from {:?}", peer_addr);
        self.config.hooks.fire_opened(peer_addr);
        Ok(StreamConnection::new(stream, peer_addr, self.config.clone()))
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.config.hooks.fire_closed(self.local_addr);
        self.config.hooks.fire_dropped();
    }
}

/// One established stream connection: framing encoder and decoder state plus the rolling
///  per-connection element counter.
pub struct StreamConnection {
    socket: Arc<dyn StreamSocket>,
    peer_addr: SocketAddr,
    decoder: StreamDecoder,
    next_elem_idx: u16,
    config: Arc<StreamConfig>,
    span: Span,
}

impl StreamConnection {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr, config: Arc<StreamConfig>) -> StreamConnection {
        let span = span!(Level::DEBUG, "stream_connection",
            peer = %peer_addr,
            correlation_id = %Uuid::new_v4(),
        );
        StreamConnection {
            socket: Arc::new(stream),
            peer_addr,
            decoder: StreamDecoder::new(config.read_cache_capacity),
            next_elem_idx: 0,
            config,
            span,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one Sequence as one message. The message is written atomically: after a short
    ///  write the continuation is reissued until flushed, see [crate::stream_send].
    pub async fn send(&mut self, sequence: &mut Sequence, options: SendOptions) -> Result<()> {
        let buffers = encode_message(sequence, &mut self.next_elem_idx, options)?;
        send_scatter(self.socket.as_ref(), &buffers, options)
            .instrument(self.span.clone())
            .await
    }

    /// Await the next complete message on this connection. Messages arrive strictly in the
    ///  order they were sent: the stream itself is ordered.
    pub async fn receive(&mut self) -> Result<Sequence> {
        let sequence = receive_message(&mut self.decoder, self.socket.as_ref())
            .instrument(self.span.clone())
            .await?;
        Ok(self.stamp_origin(sequence))
    }

    /// The non-blocking variant: `Ok(None)` when no complete message is cached and the socket
    ///  has nothing to read.
    pub fn try_receive(&mut self) -> Result<Option<Sequence>> {
        let _guard = self.span.enter();
        match try_receive_message(&mut self.decoder, self.socket.as_ref())? {
            Some(sequence) => Ok(Some(self.stamp_origin(sequence))),
            None => Ok(None),
        }
    }

    fn stamp_origin(&self, mut sequence: Sequence) -> Sequence {
        sequence.set_origin(Origin {
            sender: self.peer_addr,
            transport: TransportLabel::Stream,
        });
        sequence
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.config.hooks.fire_closed(self.peer_addr);
    }
}
