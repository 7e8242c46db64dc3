//! The reassembling datagram receiver: owns the raw substrate socket and the
//!  [ReassemblyTable], and spawns the eviction timer task while partial sequences are
//!  pending. The timer reschedules itself only while the table is non-empty.

use crate::config::DatagramConfig;
use crate::datagram_socket::RawDatagramSocket;
use crate::error::{Result, TransportError};
use crate::reassembly::ReassemblyTable;
use crate::sequence::{Origin, Sequence, TransportLabel};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;

pub struct DatagramListener {
    socket: Arc<RawDatagramSocket>,
    // NB: a std Mutex, never held across an await point - the table is touched only in
    //  short synchronous critical sections from the receive path and the eviction task
    table: Arc<Mutex<ReassemblyTable>>,
    eviction_running: Arc<AtomicBool>,
    span: Span,
}

impl DatagramListener {
    pub async fn bind(addr: SocketAddr, config: DatagramConfig) -> anyhow::Result<DatagramListener> {
        let socket = RawDatagramSocket::bind(addr, config).await?;
        Ok(Self::over(Arc::new(socket)))
    }

    /// layer reassembly over an already-bound substrate socket
    pub fn over(socket: Arc<RawDatagramSocket>) -> DatagramListener {
        let staleness = socket.config().staleness_threshold;
        let span = span!(Level::DEBUG, "datagram_listener",
            local = %socket.local_addr(),
            correlation_id = %Uuid::new_v4(),
        );
        DatagramListener {
            socket,
            table: Arc::new(Mutex::new(ReassemblyTable::new(staleness))),
            eviction_running: Arc::new(AtomicBool::new(false)),
            span,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// the underlying substrate socket, e.g. to build a [crate::datagram_send::DatagramSender]
    ///  sending from the same local address
    pub fn socket(&self) -> Arc<RawDatagramSocket> {
        self.socket.clone()
    }

    /// the number of in-flight partial sequences
    pub fn pending_partials(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    /// Await the next complete Sequence. Datagrams that only advance a partial sequence, get
    ///  dropped by loss injection, or turn out malformed are consumed without returning.
    pub async fn recv(&self) -> Result<Sequence> {
        async {
            let mut buf = vec![0u8; self.socket.config().max_datagram_payload];
            loop {
                let (n, from) = self.socket.recv_from(&mut buf).await?;
                if let Some(sequence) = self.process(&buf[..n], from)? {
                    return Ok(sequence);
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// The non-blocking variant: drains whatever datagrams are queued on the socket,
    ///  returning the first Sequence they complete, or `Ok(None)`. At this layer 'nothing
    ///  yet' is indistinguishable from 'nothing will ever arrive' - only the caller's own
    ///  timeout logic can tell.
    pub fn try_recv(&self) -> Result<Option<Sequence>> {
        let _guard = self.span.enter();
        let mut buf = vec![0u8; self.socket.config().max_datagram_payload];
        loop {
            match self.socket.try_recv_from(&mut buf)? {
                None => return Ok(None),
                Some((n, from)) => {
                    if let Some(sequence) = self.process(&buf[..n], from)? {
                        return Ok(Some(sequence));
                    }
                }
            }
        }
    }

    fn process(&self, payload: &[u8], from: SocketAddr) -> Result<Option<Sequence>> {
        if let Some(loss) = &self.socket.config().loss_injection {
            if loss(payload, from) {
                trace!("loss injection dropped a {} byte datagram from {:?}", payload.len(), from);
                return Ok(None);
            }
        }

        let mut table = self.table.lock().unwrap();
        match table.push(payload, Instant::now()) {
            Ok(Some(mut sequence)) => {
                sequence.set_origin(Origin {
                    sender: from,
                    transport: TransportLabel::Datagram,
                });
                Ok(Some(sequence))
            }
            Ok(None) => {
                let pending = !table.is_empty();
                drop(table);
                if pending {
                    self.ensure_eviction_task();
                }
                Ok(None)
            }
            Err(TransportError::ProtocolDesync(e)) => {
                // a malformed datagram is dropped, the datagram stream continues
                warn!("discarding malformed datagram from {:?}: {:#}", from, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// start the eviction timer unless it is already running; the task stops itself once the
    ///  table drains
    fn ensure_eviction_task(&self) {
        if self.eviction_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let table = self.table.clone();
        let running = self.eviction_running.clone();
        let tick = self.socket.config().eviction_tick;
        debug!("starting reassembly eviction timer, tick {:?}", tick);

        tokio::spawn(async move {
            loop {
                sleep(tick).await;
                let mut table = table.lock().unwrap();
                table.expire(Instant::now());
                if table.is_empty() {
                    // cleared while the table lock is held: an insert takes this lock first,
                    //  so its re-arm attempt always observes the cleared flag
                    running.store(false, Ordering::SeqCst);
                    debug!("reassembly table drained, stopping the eviction timer");
                    return;
                }
            }
        });
    }
}
