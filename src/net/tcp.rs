use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use courier_wire::{Codec, FrameDecoder, StreamDecodingError};
use futures::StreamExt;
use metrics::counter;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConnectionId, ConnectionManager, ConnectionStats, MessageHandler};
use crate::config::TcpConfig;
use crate::error::DependencySnafu;
use crate::{Result, ServerError};

/// Ceiling on the stale-sweep cadence.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The framed TCP front-end.
///
/// Owns the accept loop and the periodic keepalive and stale sweeps; each
/// accepted socket gets its own session task that feeds a frame decoder and
/// dispatches decoded messages into the [`MessageHandler`].
pub struct TcpServer {
    config: TcpConfig,
    manager: Arc<ConnectionManager>,
    handler: Arc<MessageHandler>,
    codec: Codec,
    shutdown: CancellationToken,
    draining: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpServer {
    /// Creates a stopped server.
    pub fn new(config: TcpConfig, manager: Arc<ConnectionManager>, handler: Arc<MessageHandler>) -> Self {
        let codec = Codec::new(config.max_frame_size);
        Self {
            config,
            manager,
            handler,
            codec,
            shutdown: CancellationToken::new(),
            draining: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Binds the listener and starts the accept loop and periodic sweeps.
    /// Returns the bound address (useful when configured with port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|error| {
            DependencySnafu {
                message: format!("failed to bind tcp listener on {bind_addr}: {error}"),
            }
            .build()
        })?;
        let local_addr = listener.local_addr().map_err(|error| {
            DependencySnafu {
                message: format!("failed to read local addr: {error}"),
            }
            .build()
        })?;
        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(local_addr);

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.push(tokio::spawn(accept_loop(
            listener,
            self.config.clone(),
            Arc::clone(&self.manager),
            Arc::clone(&self.handler),
            self.codec.clone(),
            self.shutdown.clone(),
            Arc::clone(&self.draining),
        )));
        tasks.push(tokio::spawn(ping_sweep(
            self.config.ping_interval(),
            Arc::clone(&self.manager),
            self.codec.clone(),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(stale_sweep(
            self.config.ping_timeout(),
            Arc::clone(&self.manager),
            self.shutdown.clone(),
        )));

        info!(addr = %local_addr, "TCP server started.");
        Ok(local_addr)
    }

    /// Stops accepting, cancels the sweeps, and drains active sessions
    /// within the configured drain window.
    pub async fn stop(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.shutdown.cancel();

        let forced = self.manager.close_all(self.config.drain_timeout()).await;
        if forced > 0 {
            warn!(forced, "Forcibly closed connections at drain timeout.");
        }

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("TCP server stopped.");
    }

    /// The bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connection-level counter snapshot.
    pub fn stats(&self) -> ConnectionStats {
        self.manager.stats()
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    config: TcpConfig,
    manager: Arc<ConnectionManager>,
    handler: Arc<MessageHandler>,
    codec: Codec,
    shutdown: CancellationToken,
    draining: Arc<AtomicBool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                error!(%error, "Accept failed.");
                continue;
            }
        };

        // New connections are refused outright while draining.
        if draining.load(Ordering::SeqCst) {
            debug!(%peer, "Rejecting connection during drain.");
            drop(stream);
            continue;
        }

        configure_socket(&stream, config.keep_alive_interval());
        counter!("courier_tcp_connections_accepted_total").increment(1);

        tokio::spawn(handle_connection(
            stream,
            peer,
            config.max_frame_size,
            Arc::clone(&manager),
            Arc::clone(&handler),
            codec.clone(),
            shutdown.child_token(),
        ));
    }
}

fn configure_socket(stream: &TcpStream, keep_alive: Duration) {
    if let Err(error) = stream.set_nodelay(true) {
        warn!(%error, "Failed to set TCP_NODELAY.");
    }
    let keepalive = TcpKeepalive::new()
        .with_time(keep_alive)
        .with_interval(keep_alive);
    if let Err(error) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(%error, "Failed to set TCP keepalive.");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_size: usize,
    manager: Arc<ConnectionManager>,
    handler: Arc<MessageHandler>,
    codec: Codec,
    cancel: CancellationToken,
) {
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<bytes::Bytes>();

    let id = match manager.add_connection(peer, outbound_tx, cancel.clone()) {
        Ok(id) => id,
        Err(error) => {
            counter!("courier_tcp_connections_rejected_total").increment(1);
            warn!(%peer, %error, "Connection rejected.");
            reject(stream, &codec, &error).await;
            return;
        }
    };

    let (read_half, mut write_half) = stream.into_split();

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                queued = outbound_rx.recv() => match queued {
                    Some(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_cancel.cancelled() => break,
            }
        }
        let _ = write_half.shutdown().await;
    });

    read_loop(
        read_half,
        &id,
        max_frame_size,
        &manager,
        &handler,
        &codec,
        &cancel,
    )
    .await;

    // Disconnect path: release broker subscriptions, then the registry entry,
    // then stop the writer.
    handler.on_disconnect(&id).await;
    cancel.cancel();
    let _ = writer.await;
    debug!(connection_id = %id, %peer, "Connection closed.");
}

async fn read_loop(
    read_half: tokio::net::tcp::OwnedReadHalf,
    id: &ConnectionId,
    max_frame_size: usize,
    manager: &Arc<ConnectionManager>,
    handler: &Arc<MessageHandler>,
    codec: &Codec,
    cancel: &CancellationToken,
) {
    let mut framed = FramedRead::new(read_half, FrameDecoder::new(max_frame_size));

    loop {
        let item = tokio::select! {
            item = framed.next() => item,
            _ = cancel.cancelled() => return,
        };

        match item {
            None => return,
            Some(Ok(frame)) => {
                manager.update_activity(id);
                match codec.decode(&frame) {
                    Ok(message) => handler.handle_message(id, message).await,
                    Err(error) => {
                        let error = ServerError::from(error);
                        send_error(manager, id, codec, &error);
                    }
                }
            }
            Some(Err(error)) => {
                let can_continue = error.can_continue();
                let error = ServerError::from(error);
                counter!("courier_tcp_protocol_errors_total").increment(1);
                send_error(manager, id, codec, &error);
                if !can_continue {
                    warn!(connection_id = %id, %error, "Unrecoverable protocol error; closing.");
                    return;
                }
            }
        }
    }
}

fn send_error(
    manager: &Arc<ConnectionManager>,
    id: &ConnectionId,
    codec: &Codec,
    error: &ServerError,
) {
    match codec.encode_error(error.code(), &error.to_string()) {
        Ok(bytes) => {
            manager.send_to_connection(id, bytes);
        }
        Err(encode_error) => warn!(connection_id = %id, %encode_error, "Failed to encode error reply."),
    }
}

/// Best-effort error reply on a socket that never made it into the registry.
async fn reject(mut stream: TcpStream, codec: &Codec, error: &ServerError) {
    if let Ok(bytes) = codec.encode_error(error.code(), &error.to_string()) {
        let _ = stream.write_all(&bytes).await;
    }
    let _ = stream.shutdown().await;
}

async fn ping_sweep(
    interval: Duration,
    manager: Arc<ConnectionManager>,
    codec: Codec,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        match codec.encode_ping(Utc::now().timestamp_millis()) {
            Ok(bytes) => {
                let sent = manager.broadcast(bytes);
                if sent > 0 {
                    debug!(sent, "Keepalive ping sweep.");
                }
            }
            Err(error) => warn!(%error, "Failed to encode keepalive ping."),
        }
    }
}

async fn stale_sweep(
    ping_timeout: Duration,
    manager: Arc<ConnectionManager>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ping_timeout.min(MAX_SWEEP_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let evicted = manager.remove_stale_connections(ping_timeout * 2);
        if evicted > 0 {
            counter!("courier_tcp_stale_evictions_total").increment(evicted as u64);
            info!(evicted, "Evicted stale connections.");
        }
    }
}
