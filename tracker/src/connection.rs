//! Connection lifecycle of live subscribers.
//!
//! Each accepted viewer gets one task that owns the socket, the receiving
//! half of its outbound queue and the only strong handle to its
//! [`Subscriber`]. The task multiplexes:
//! - eviction requests (broadcast failures, administrative disconnect)
//! - inbound frames (text keepalives are answered with a pong)
//! - outbound telemetry from the queue
//! - a periodic ping
//!
//! Any error or close ends the loop; the task then moves the subscriber to
//! `Closing`, deregisters it once and releases the socket.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::SUBSCRIBERS;
use crate::model::LiveMessage;
use crate::registry::{Outbound, Subscriber, SubscriberId, SubscriberRegistry};

/// Why a subscriber connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    Evicted,
    MalformedMessage,
    ReadError(String),
    WriteError(String),
    WriteTimeout,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Owns the strong handle of a registered subscriber. Dropping it without
/// an orderly close (aborted task, abandoned upgrade) still deregisters the
/// subscriber and releases its gauge slot.
#[derive(Debug)]
struct Registration {
    subscriber: Arc<Subscriber>,
    registry: Arc<SubscriberRegistry>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.subscriber.begin_closing() {
            self.registry.try_remove(self.subscriber.id());
            SUBSCRIBERS.dec();
            self.subscriber.mark_closed();
            debug!(subscriber = %self.subscriber.id(), "Subscriber dropped without close");
        }
    }
}

/// A registered subscriber together with its queue, before it is driven.
#[derive(Debug)]
pub struct Connection {
    registration: Registration,
    rx: mpsc::Receiver<Outbound>,
}

impl Connection {
    pub fn id(&self) -> SubscriberId {
        self.registration.subscriber.id()
    }
}

pub struct ConnectionManager {
    registry: Arc<SubscriberRegistry>,
    settings: ConnectionSettings,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(registry: Arc<SubscriberRegistry>, settings: ConnectionSettings) -> Self {
        Self {
            registry,
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Completes the handshake side of `Connecting → Open`: creates the
    /// subscriber and registers it.
    pub async fn open(&self) -> Connection {
        let id = SubscriberId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let subscriber = Arc::new(Subscriber::new(id, tx));
        subscriber.mark_open();
        self.registry.add(&subscriber).await;
        SUBSCRIBERS.inc();
        info!(subscriber = %id, "Subscriber connected");

        Connection {
            registration: Registration {
                subscriber,
                registry: Arc::clone(&self.registry),
            },
            rx,
        }
    }

    /// Serves an upgraded WebSocket until it closes.
    pub async fn serve(&self, socket: WebSocket) -> CloseReason {
        let connection = self.open().await;
        let (sink, stream) = socket.split();
        self.drive(connection, sink, stream).await
    }

    /// Requests eviction of a live subscriber. Returns `false` when it is
    /// not registered.
    pub async fn disconnect(&self, id: SubscriberId) -> bool {
        match self.registry.get(id).await {
            Some(subscriber) => {
                info!(subscriber = %id, "Administrative disconnect requested");
                subscriber.request_eviction();
                true
            }
            None => false,
        }
    }

    /// Runs the receive/send loop of an open connection over any message
    /// transport.
    pub async fn drive<W, R, E>(&self, connection: Connection, mut sink: W, mut stream: R) -> CloseReason
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let Connection {
            registration,
            mut rx,
        } = connection;
        let subscriber = &registration.subscriber;
        let period = self.settings.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;

                _ = subscriber.evicted() => break CloseReason::Evicted,

                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match (LiveMessage::Pong { payload: &text }).to_json() {
                            Ok(reply) => reply,
                            Err(e) => break CloseReason::WriteError(e.to_string()),
                        };
                        if let Err(reason) = self.write(&mut sink, Message::Text(reply)).await {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => break CloseReason::MalformedMessage,
                    Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                    Some(Err(e)) => break CloseReason::ReadError(e.to_string()),
                },

                outbound = rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(reason) = self.write(&mut sink, Message::Text(message.to_string())).await {
                            break reason;
                        }
                    }
                    // unreachable while we hold the subscriber, which owns the sender
                    None => break CloseReason::Evicted,
                },

                _ = keepalive.tick() => {
                    if let Err(reason) = self.write(&mut sink, Message::Ping(Vec::new())).await {
                        break reason;
                    }
                }
            }
        };

        self.close(subscriber, &mut rx, &mut sink, &reason).await;
        reason
    }

    async fn write<W>(&self, sink: &mut W, message: Message) -> Result<(), CloseReason>
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        match tokio::time::timeout(self.settings.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CloseReason::WriteError(e.to_string())),
            Err(_) => Err(CloseReason::WriteTimeout),
        }
    }

    async fn close<W>(
        &self,
        subscriber: &Subscriber,
        rx: &mut mpsc::Receiver<Outbound>,
        sink: &mut W,
        reason: &CloseReason,
    ) where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        if !subscriber.begin_closing() {
            return;
        }

        // in-flight deliveries now fail instead of waiting for capacity
        rx.close();
        self.registry.remove(subscriber.id()).await;
        SUBSCRIBERS.dec();

        if let Ok(Err(e)) = tokio::time::timeout(self.settings.write_timeout, sink.close()).await {
            debug!(subscriber = %subscriber.id(), "Error closing socket: {}", e);
        }
        subscriber.mark_closed();

        match reason {
            CloseReason::ClientClosed | CloseReason::Evicted => {
                info!(subscriber = %subscriber.id(), ?reason, "Subscriber disconnected")
            }
            _ => warn!(subscriber = %subscriber.id(), ?reason, "Subscriber connection failed"),
        }
    }
}
