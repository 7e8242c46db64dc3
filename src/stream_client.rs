//! The reconnecting stream client: a thin state machine over [StreamConnection] that, on a
//!  detected reset or error from either the send or the receive path, drops the connection
//!  and re-establishes it on a timer. While disconnected, sends and receives fail fast -
//!  nothing is queued, callers observe the failure and retry at the application layer.

use crate::config::StreamConfig;
use crate::error::{Result, TransportError};
use crate::sequence::Sequence;
use crate::stream_send::SendOptions;
use crate::stream_server::StreamConnection;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpSocket;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

struct ClientInner {
    peer_addr: SocketAddr,
    config: Arc<StreamConfig>,
    connection: Mutex<Option<StreamConnection>>,
    reconnect_pending: AtomicBool,
}

pub struct StreamClient {
    inner: Arc<ClientInner>,
}

async fn establish(peer_addr: SocketAddr, config: &Arc<StreamConfig>) -> anyhow::Result<StreamConnection> {
    let socket = if peer_addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    config.socket_options.apply_tcp(&socket)?;

    let stream = socket.connect(peer_addr).await?;
    config.socket_options.apply_stream(&stream)?;

    config.hooks.fire_opened(stream.local_addr()?);
    Ok(StreamConnection::new(stream, peer_addr, config.clone()))
}

impl StreamClient {
    /// The initial connect. Failure here surfaces to the caller; reconnect-on-timer only
    ///  covers failures of an established connection.
    pub async fn connect(peer_addr: SocketAddr, config: StreamConfig) -> anyhow::Result<StreamClient> {
        config.validate()?;
        let config = Arc::new(config);

        let connection = establish(peer_addr, &config).await?;
        info!("connected to {:?}", peer_addr);

        Ok(StreamClient {
            inner: Arc::new(ClientInner {
                peer_addr,
                config,
                connection: Mutex::new(Some(connection)),
                reconnect_pending: AtomicBool::new(false),
            }),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.lock().await.is_some()
    }

    pub async fn send(&self, sequence: &mut Sequence, options: SendOptions) -> Result<()> {
        let mut slot = self.inner.connection.lock().await;
        let connection = slot.as_mut().ok_or(TransportError::PeerReset)?;

        match connection.send(sequence, options).await {
            Err(e) if Self::is_connection_failure(&e) => {
                self.on_connection_failure(&mut slot);
                Err(e)
            }
            other => other,
        }
    }

    pub async fn receive(&self) -> Result<Sequence> {
        let mut slot = self.inner.connection.lock().await;
        let connection = slot.as_mut().ok_or(TransportError::PeerReset)?;

        match connection.receive().await {
            Err(e) if Self::is_connection_failure(&e) => {
                self.on_connection_failure(&mut slot);
                Err(e)
            }
            other => other,
        }
    }

    pub fn try_receive(&self) -> Result<Option<Sequence>> {
        let mut slot = self.inner.connection.try_lock()
            .map_err(|_| TransportError::WouldBlock)?;
        let connection = slot.as_mut().ok_or(TransportError::PeerReset)?;

        match connection.try_receive() {
            Err(e) if Self::is_connection_failure(&e) => {
                self.on_connection_failure(&mut slot);
                Err(e)
            }
            other => other,
        }
    }

    fn is_connection_failure(error: &TransportError) -> bool {
        matches!(error, TransportError::PeerReset | TransportError::SystemIO(_))
    }

    fn on_connection_failure(&self, slot: &mut Option<StreamConnection>) {
        *slot = None;
        self.schedule_reconnect();
    }

    /// Spawn the reconnect timer task unless one is already pending. The task attempts a
    ///  reconnect once per interval and stops itself on success.
    fn schedule_reconnect(&self) {
        if self.inner.reconnect_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = self.inner.clone();
        warn!("connection to {:?} lost, scheduling reconnect every {:?}",
            inner.peer_addr, inner.config.reconnect_interval);

        tokio::spawn(async move {
            loop {
                sleep(inner.config.reconnect_interval).await;

                match establish(inner.peer_addr, &inner.config).await {
                    Ok(connection) => {
                        info!("reconnected to {:?}", inner.peer_addr);
                        let mut slot = inner.connection.lock().await;
                        *slot = Some(connection);
                        // cleared while the slot is still locked: a send can only fail on
                        //  this connection after taking the lock, so its re-arm attempt
                        //  always observes the cleared flag
                        inner.reconnect_pending.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        debug!("reconnect to {:?} failed: {:#}", inner.peer_addr, e);
                    }
                }
            }
        });
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.config.hooks.fire_dropped();
    }
}
