use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::metrics::TransportMetrics;
use crate::transport::{validate_frame_size, ConnectionState, Dispatch, Transport, TransportError};

/// Socket deadline for each read and each write.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Requests pipelined per connection before the reader back-pressures.
const MAX_IN_FLIGHT: usize = 16;

/// The Kafka-wire TCP server.
///
/// Each accepted connection runs a three-task pipeline joined by bounded
/// channels:
///
///   socket ──► reader ──[frames]──► processor ──[responses]──► writer ──► socket
///
/// The reader emits `(seq, frame)` pairs; the processor dispatches each frame
/// on a blocking thread; the writer buffers out-of-order completions in a
/// BTreeMap and emits strictly by sequence number.  A parked fetch simply
/// leaves its sequence slot unfilled until the scheduler delivers it, which
/// is what keeps long-polling from reordering responses on a connection.
pub struct BrokerServer {
    listener: TcpListener,
    transport: Arc<Transport>,
    engine: Arc<Engine>,
    metrics: TransportMetrics,
    max_connections: usize,
    max_message_size: usize,
    connection_count: Arc<AtomicUsize>,
    next_connection_id: AtomicU64,
}

impl BrokerServer {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        transport: Arc<Transport>,
        engine: Arc<Engine>,
        metrics: TransportMetrics,
        max_connections: usize,
        max_message_size: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::io("bind", err))?;
        Ok(Self {
            listener,
            transport,
            engine,
            metrics,
            max_connections,
            max_message_size,
            connection_count: Arc::new(AtomicUsize::new(0)),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|err| TransportError::io("local_addr", err))
    }

    /// Accept until the shutdown signal flips, then drain every connection.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let mut connections: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    if self.connection_count.load(Ordering::Relaxed) >= self.max_connections {
                        warn!(%peer, "connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    }
                    self.connection_count.fetch_add(1, Ordering::Relaxed);
                    self.metrics.connection_opened();
                    let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, connection_id, "accepted connection");

                    let transport = Arc::clone(&self.transport);
                    let engine = Arc::clone(&self.engine);
                    let metrics = self.metrics.clone();
                    let count = Arc::clone(&self.connection_count);
                    let max_message_size = self.max_message_size;
                    let conn_shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(err) = handle_connection(
                            stream,
                            transport,
                            connection_id,
                            max_message_size,
                            conn_shutdown,
                        )
                        .await
                        {
                            debug!(connection_id, error = %err, "connection closed with error");
                        }
                        engine.remove_connection(connection_id);
                        metrics.connection_closed();
                        count.fetch_sub(1, Ordering::Relaxed);
                        debug!(connection_id, "connection closed");
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("listener stopped, draining connections");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    transport: Arc<Transport>,
    connection_id: u64,
    max_message_size: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let connection = ConnectionState::new(connection_id, transport.auth_disabled());
    let (read_half, write_half) = stream.into_split();

    let (frame_tx, frame_rx) = mpsc::channel::<(u64, Vec<u8>)>(MAX_IN_FLIGHT);
    let (resp_tx, resp_rx) = mpsc::channel::<(u64, Vec<u8>)>(MAX_IN_FLIGHT);

    let reader = tokio::spawn(reader_task(read_half, frame_tx, max_message_size, shutdown));
    let processor = tokio::spawn(process_task(frame_rx, resp_tx, transport, connection));
    let writer = tokio::spawn(writer_task(write_half, resp_rx));

    let (r_reader, r_processor, r_writer) = tokio::join!(reader, processor, writer);
    for joined in [r_reader, r_processor, r_writer] {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => {
                return Err(TransportError::Io {
                    operation: "join_pipeline_task",
                    message: err.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Reads `[4-byte len][frame]` pairs and forwards them with a sequence
/// number.  Exits cleanly on EOF or shutdown; a read deadline or an invalid
/// size tears the connection down.
async fn reader_task(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    frame_tx: mpsc::Sender<(u64, Vec<u8>)>,
    max_message_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let mut seq: u64 = 0;
    loop {
        let mut len_buf = [0_u8; 4];
        let read_len = tokio::select! {
            result = tokio::time::timeout(IO_TIMEOUT, read_half.read_exact(&mut len_buf)) => result,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        match read_len {
            Ok(Ok(_)) => {}
            Ok(Err(err))
                if matches!(
                    err.kind(),
                    ErrorKind::UnexpectedEof
                        | ErrorKind::ConnectionReset
                        | ErrorKind::BrokenPipe
                        | ErrorKind::ConnectionAborted
                ) =>
            {
                return Ok(());
            }
            Ok(Err(err)) => return Err(TransportError::io("read_frame_len", err)),
            Err(_) => {
                return Err(TransportError::Io {
                    operation: "read_frame_len",
                    message: "read deadline exceeded".to_string(),
                });
            }
        }

        let frame_size = validate_frame_size(i32::from_be_bytes(len_buf), max_message_size)?;
        let mut frame = vec![0_u8; frame_size];
        match tokio::time::timeout(IO_TIMEOUT, read_half.read_exact(&mut frame)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(TransportError::io("read_frame_body", err)),
            Err(_) => {
                return Err(TransportError::Io {
                    operation: "read_frame_body",
                    message: "read deadline exceeded".to_string(),
                });
            }
        }

        if frame_tx.send((seq, frame)).await.is_err() {
            // Processor has exited; stop reading.
            return Ok(());
        }
        seq += 1;
    }
}

/// Dispatches each frame on a blocking thread, in arrival order, and emits
/// `(seq, response)` pairs.  Parked fetches emit nothing here; the scheduler
/// fills their slot through the same channel.
async fn process_task(
    mut frame_rx: mpsc::Receiver<(u64, Vec<u8>)>,
    resp_tx: mpsc::Sender<(u64, Vec<u8>)>,
    transport: Arc<Transport>,
    mut connection: ConnectionState,
) -> Result<(), TransportError> {
    while let Some((seq, frame)) = frame_rx.recv().await {
        let transport = Arc::clone(&transport);
        let completion = resp_tx.clone();
        let mut state = connection.clone();
        let (dispatched, state_out) = tokio::task::spawn_blocking(move || {
            let result = transport.process_frame(&frame, &mut state, seq, &completion);
            (result, state)
        })
        .await
        .map_err(|err| TransportError::Io {
            operation: "spawn_blocking_dispatch",
            message: err.to_string(),
        })?;
        connection = state_out;

        match dispatched? {
            Dispatch::Response(bytes) => {
                if resp_tx.send((seq, bytes)).await.is_err() {
                    return Ok(());
                }
            }
            Dispatch::Parked => {}
        }
    }
    Ok(())
}

/// Emits responses to the socket strictly in sequence order, buffering any
/// that complete early.
async fn writer_task(
    write_half: tokio::net::tcp::OwnedWriteHalf,
    mut resp_rx: mpsc::Receiver<(u64, Vec<u8>)>,
) -> Result<(), TransportError> {
    let mut writer = BufWriter::new(write_half);
    let mut pending: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
    let mut next_expected: u64 = 0;

    while let Some((seq, response)) = resp_rx.recv().await {
        pending.insert(seq, response);
        while let Some(response) = pending.remove(&next_expected) {
            match tokio::time::timeout(IO_TIMEOUT, writer.write_all(&response)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(TransportError::io("write_response", err)),
                Err(_) => {
                    return Err(TransportError::Io {
                        operation: "write_response",
                        message: "write deadline exceeded".to_string(),
                    });
                }
            }
            next_expected += 1;
        }
        match tokio::time::timeout(IO_TIMEOUT, writer.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(TransportError::io("flush_response", err)),
            Err(_) => {
                return Err(TransportError::Io {
                    operation: "flush_response",
                    message: "write deadline exceeded".to_string(),
                });
            }
        }
    }
    Ok(())
}
