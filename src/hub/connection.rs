//! One live connection: a handle shared with the registry, plus the inbound and outbound loops.
//!
//! The outbound loop is the only consumer of the connection's queue. Either loop ending for any
//! reason closes the handle, which cancels the other loop; `serve` then unregisters the
//! connection and waits for the writer before marking it `Closed`.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, OutboundFrame};
use super::Hub;
use crate::error::{HubError, ProtocolError};
use crate::UserId;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Registered = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Registered,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Shared half of a connection. The registry owns it once registered; producers only ever
/// reach the queue through `try_send`.
pub struct ConnectionHandle {
    conn_id: u64,
    user_id: UserId,
    tx: mpsc::Sender<OutboundFrame>,
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("conn_id", &self.conn_id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// New connection in `Connecting`, with a bounded outbound queue of `capacity` frames.
    pub fn new(user_id: UserId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(Self {
            conn_id: next_conn_id(),
            user_id,
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            shutdown: CancellationToken::new(),
        });
        (handle, rx)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Registered
    }

    /// Connecting -> Registered. Fails if the connection was already closed.
    pub(crate) fn mark_registered(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Registered as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Closing` and cancel both loops. Returns false if it was already closing.
    pub fn close(&self) -> bool {
        let moved = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
            })
            .is_ok();
        self.shutdown.cancel();
        moved
    }

    pub(crate) fn mark_closed(&self) {
        self.shutdown.cancel();
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Resolves once the connection has started closing.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Non-blocking enqueue. A full queue is reported as a slow consumer, never waited on.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), HubError> {
        if !self.is_open() {
            return Err(HubError::ConnectionClosed {
                user_id: self.user_id,
            });
        }
        let user_id = self.user_id;
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => HubError::SlowConsumer { user_id },
            TrySendError::Closed(_) => HubError::ConnectionClosed { user_id },
        })
    }
}

/// Drive a registered connection until it closes. Runs the outbound loop as its own task and
/// the inbound loop on the current one.
pub async fn serve<W, R, E>(
    hub: Hub,
    conn: Arc<ConnectionHandle>,
    rx: mpsc::Receiver<OutboundFrame>,
    sink: W,
    stream: R,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    let user_id = conn.user_id();
    let conn_id = conn.conn_id();
    let settings = hub.settings().clone();

    let writer = tokio::spawn(outbound_loop(conn.clone(), rx, sink, settings.ping_interval));
    let inbound = inbound_loop(&hub, &conn, stream, settings.idle_timeout).await;

    match &inbound {
        Ok(()) => debug!(user_id, conn_id, "inbound loop finished"),
        Err(e) => info!(user_id, conn_id, error = %e, "inbound loop failed"),
    }

    hub.registry().unregister(user_id, conn_id);
    conn.close();

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => info!(user_id, conn_id, error = %e, "outbound loop failed"),
        Err(e) => warn!(user_id, conn_id, error = %e, "outbound task panicked"),
    }
    conn.mark_closed();
    info!(user_id, conn_id, "connection closed");
}

async fn outbound_loop<W>(
    conn: Arc<ConnectionHandle>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut sink: W,
    ping_interval: Duration,
) -> Result<(), HubError>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    let result = loop {
        tokio::select! {
            biased;
            _ = conn.closed() => break Ok(()),
            frame = rx.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break Err(HubError::Transport(e.to_string()));
                    }
                }
                None => break Ok(()),
            },
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    break Err(HubError::Transport(e.to_string()));
                }
            }
        }
    };

    conn.close();
    if result.is_ok() {
        // Best effort; the peer may already be gone.
        let _ = sink.send(Message::Close(None)).await;
    }
    result
}

async fn inbound_loop<R, E>(
    hub: &Hub,
    conn: &ConnectionHandle,
    mut stream: R,
    idle_timeout: Duration,
) -> Result<(), HubError>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let user_id = conn.user_id();
    let conn_id = conn.conn_id();
    loop {
        let next = tokio::select! {
            biased;
            _ = conn.closed() => return Ok(()),
            next = timeout(idle_timeout, stream.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                return Err(HubError::Transport(format!(
                    "no inbound frame for {}s",
                    idle_timeout.as_secs()
                )))
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(HubError::Transport(e.to_string())),
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = route_text(hub, user_id, text.as_str()).await {
                    reject_frame(hub, user_id, conn_id, e);
                }
            }
            Message::Binary(_) => {
                let err = ProtocolError::UnsupportedFrame("binary").into();
                reject_frame(hub, user_id, conn_id, err);
            }
            Message::Close(frame) => {
                debug!(user_id, conn_id, reason = ?frame, "client initiated close");
                return Ok(());
            }
            // Pongs only count as liveness; pings are answered by the transport.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn route_text(hub: &Hub, user_id: UserId, text: &str) -> Result<(), HubError> {
    let msg = ClientMessage::decode(text, user_id)?;
    hub.dispatcher().route(user_id, msg).await;
    Ok(())
}

fn reject_frame(hub: &Hub, user_id: UserId, conn_id: u64, err: HubError) {
    hub.metrics().protocol_errors.inc();
    warn!(user_id, conn_id, error = %err, "dropping inbound frame");
}
