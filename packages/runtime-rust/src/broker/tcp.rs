//! TCP client for a [`BrokerHub`](super::BrokerHub).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ember_core::{decode_frame, encode_frame, BrokerFrame, Event, EventFilter};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Broker, BrokerError, Subscription, SUBSCRIPTION_BUFFER};

/// Largest frame body accepted on either side of a hub connection.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1_048_576;

/// How long dialling the hub may take before it counts as unreachable.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `subscribe` waits for the hub to confirm a subscription.
const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type Connection = Framed<TcpStream, LengthDelimitedCodec>;

pub(crate) fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

pub(crate) async fn send_frame(
    conn: &mut Connection,
    frame: &BrokerFrame,
) -> Result<(), BrokerError> {
    let body = encode_frame(frame)?;
    conn.send(Bytes::from(body)).await?;
    Ok(())
}

/// Broker client that talks to a hub over TCP.
///
/// Publishing reuses one lazily opened connection. Every subscription gets
/// its own connection, closed when the subscription is dropped.
pub struct TcpBroker {
    addr: String,
    max_frame_length: usize,
    connect_timeout: Duration,
    publisher: Mutex<Option<Connection>>,
}

impl TcpBroker {
    /// Client for the hub at `addr` (`host:port`). Nothing is dialled yet.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            publisher: Mutex::new(None),
        }
    }

    /// Overrides the largest frame body sent or accepted.
    #[must_use]
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Overrides how long dialling the hub may take.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Address of the hub.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<Connection, BrokerError> {
        let dialled = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connecting to hub timed out",
                ))
            });
        let stream = dialled.map_err(|source| BrokerError::Unreachable {
            addr: self.addr.clone(),
            source,
        })?;
        stream.set_nodelay(true)?;
        Ok(Framed::new(stream, codec(self.max_frame_length)))
    }

    /// Reads frames until the hub confirms `topic`. Deliveries that overtake
    /// the confirmation are kept, filtered, in arrival order.
    async fn await_ack(
        conn: &mut Connection,
        topic: &str,
        filter: &EventFilter,
    ) -> Result<Vec<Event>, BrokerError> {
        let mut early = Vec::new();
        loop {
            let bytes = match conn.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(BrokerError::Closed),
            };
            match decode_frame(&bytes)? {
                BrokerFrame::Subscribed { topic: acked } if acked == topic => return Ok(early),
                BrokerFrame::Deliver { event, .. } => {
                    if filter.matches(&event) {
                        early.push(event);
                    }
                }
                other => trace!(kind = other.kind(), "ignoring frame while subscribing"),
            }
        }
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn publish(&self, topic: &str, event: Event) -> Result<(), BrokerError> {
        let frame = BrokerFrame::Publish {
            topic: topic.to_string(),
            event,
        };

        let mut publisher = self.publisher.lock().await;
        if publisher.is_none() {
            *publisher = Some(self.connect().await?);
        }
        let conn = publisher.as_mut().ok_or(BrokerError::Closed)?;
        if let Err(err) = send_frame(conn, &frame).await {
            // Reconnect on the next publish.
            *publisher = None;
            return Err(err);
        }
        trace!(topic, addr = %self.addr, "published event");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        filter: EventFilter,
    ) -> Result<Subscription, BrokerError> {
        let mut conn = self.connect().await?;
        send_frame(
            &mut conn,
            &BrokerFrame::Subscribe {
                topic: topic.to_string(),
            },
        )
        .await?;

        let early = tokio::time::timeout(
            SUBSCRIBE_ACK_TIMEOUT,
            Self::await_ack(&mut conn, topic, &filter),
        )
        .await
        .map_err(|_| {
            BrokerError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "hub did not confirm subscription",
            ))
        })??;
        debug!(topic, addr = %self.addr, "subscribed via hub");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let topic_name = topic.to_string();

        tokio::spawn(async move {
            for event in early {
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            loop {
                let received = tokio::select! {
                    () = stop.cancelled() => None,
                    received = conn.next() => Some(received),
                };
                let Some(received) = received else {
                    let unsubscribe = BrokerFrame::Unsubscribe {
                        topic: topic_name.clone(),
                    };
                    if let Err(err) = send_frame(&mut conn, &unsubscribe).await {
                        trace!(topic = %topic_name, error = %err, "unsubscribe not sent");
                    }
                    break;
                };

                match received {
                    Some(Ok(bytes)) => match decode_frame(&bytes) {
                        Ok(BrokerFrame::Deliver { event, .. }) => {
                            if filter.matches(&event) && tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(other) => trace!(kind = other.kind(), "ignoring unexpected frame"),
                        Err(err) => {
                            warn!(topic = %topic_name, error = %err, "dropping undecodable frame");
                        }
                    },
                    Some(Err(err)) => {
                        warn!(topic = %topic_name, error = %err, "broker connection failed");
                        break;
                    }
                    None => {
                        debug!(topic = %topic_name, "hub closed subscription");
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(topic, rx, cancel))
    }
}
