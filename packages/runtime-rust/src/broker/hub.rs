//! TCP broker hub with deferred startup.
//!
//! `new()` allocates the topic table, `start()` binds the listener and
//! `serve()` accepts client connections until the shutdown future resolves.
//! Processes that share a hub see each other's broadcast events.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use ember_core::{decode_frame, encode_frame, BrokerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::tcp::{codec, send_frame, Connection};
use crate::config::HubConfig;

/// Identifier the hub assigns to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Which connections listen on which topic.
///
/// Each subscriber is represented by the sender half of its connection's
/// bounded outbound queue.
#[derive(Debug, Default)]
pub struct TopicTable {
    topics: DashMap<String, HashMap<ConnectionId, mpsc::Sender<Bytes>>>,
}

impl TopicTable {
    /// Number of connections subscribed to `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }

    fn subscribe(&self, topic: &str, id: ConnectionId, tx: mpsc::Sender<Bytes>) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);
    }

    fn unsubscribe(&self, topic: &str, id: ConnectionId) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.remove(&id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    fn remove_connection(&self, id: ConnectionId) {
        self.topics.retain(|_, subs| {
            subs.remove(&id);
            !subs.is_empty()
        });
    }

    /// Queues `frame` for every subscriber of `topic` without waiting.
    /// Returns how many subscribers accepted it.
    fn fan_out(&self, topic: &str, frame: &Bytes) -> usize {
        let Some(subs) = self.topics.get(topic) else {
            return 0;
        };
        let mut delivered = 0;
        for (id, tx) in subs.iter() {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection = id.0, topic, "outbound queue full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}

/// Broadcast hub for [`TcpBroker`](super::TcpBroker) clients.
pub struct BrokerHub {
    config: HubConfig,
    listener: Option<TcpListener>,
    topics: Arc<TopicTable>,
    next_id: AtomicU64,
}

impl BrokerHub {
    /// Creates a hub without binding any port.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            listener: None,
            topics: Arc::new(TopicTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Shared view of the subscription table.
    #[must_use]
    pub fn topics(&self) -> Arc<TopicTable> {
        Arc::clone(&self.topics)
    }

    /// Binds the listener to the configured host and port.
    ///
    /// Returns the bound port, which differs from the configured one when
    /// port 0 asks the OS for an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("broker hub bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// connection and waits for their tasks to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let topics = self.topics;
        let next_id = self.next_id;
        let capacity = self.config.outbound_channel_capacity.max(1);
        let max_frame_length = self.config.max_frame_length;

        let cancel = CancellationToken::new();
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = ConnectionId(next_id.fetch_add(1, Ordering::Relaxed));
                        let span = info_span!("hub_connection", connection = id.0, %peer);
                        connections.spawn(
                            handle_connection(
                                stream,
                                id,
                                Arc::clone(&topics),
                                capacity,
                                max_frame_length,
                                cancel.child_token(),
                            )
                            .instrument(span),
                        );
                    }
                    Err(err) => warn!(error = %err, "failed to accept connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        cancel.cancel();
        let count = connections.len();
        if count > 0 {
            info!("closing {} hub connections", count);
        }
        while connections.join_next().await.is_some() {}
        info!("broker hub stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    id: ConnectionId,
    topics: Arc<TopicTable>,
    capacity: usize,
    max_frame_length: usize,
    cancel: CancellationToken,
) {
    if let Err(err) = stream.set_nodelay(true) {
        trace!(error = %err, "could not disable nagle");
    }
    let mut conn: Connection = Framed::new(stream, codec(max_frame_length));
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity);
    debug!("connection opened");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            outbound = rx.recv() => {
                let Some(bytes) = outbound else { break };
                if let Err(err) = conn.send(bytes).await {
                    debug!(error = %err, "write failed");
                    break;
                }
            }
            inbound = conn.next() => match inbound {
                Some(Ok(bytes)) => {
                    let Some(reply) = handle_frame(&bytes, id, &topics, &tx) else {
                        continue;
                    };
                    if let Err(err) = send_frame(&mut conn, &reply).await {
                        debug!(error = %err, "write failed");
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(error = %err, "read failed");
                    break;
                }
                None => break,
            },
        }
    }

    topics.remove_connection(id);
    debug!("connection closed");
}

/// Applies one client frame. Returns the frame to answer with, if any.
fn handle_frame(
    bytes: &[u8],
    id: ConnectionId,
    topics: &TopicTable,
    tx: &mpsc::Sender<Bytes>,
) -> Option<BrokerFrame> {
    let frame = match decode_frame(bytes) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "dropping undecodable frame");
            return None;
        }
    };

    match frame {
        BrokerFrame::Subscribe { topic } => {
            topics.subscribe(&topic, id, tx.clone());
            debug!(%topic, "subscribed");
            Some(BrokerFrame::Subscribed { topic })
        }
        BrokerFrame::Unsubscribe { topic } => {
            topics.unsubscribe(&topic, id);
            debug!(%topic, "unsubscribed");
            None
        }
        BrokerFrame::Publish { topic, event } => {
            let deliver = BrokerFrame::Deliver {
                topic: topic.clone(),
                event,
            };
            match encode_frame(&deliver) {
                Ok(body) => {
                    let delivered = topics.fan_out(&topic, &Bytes::from(body));
                    trace!(%topic, delivered, "fanned out event");
                }
                Err(err) => warn!(%topic, error = %err, "failed to encode delivery"),
            }
            None
        }
        other => {
            warn!(kind = other.kind(), "unexpected frame from client");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ember_core::{Event, EventFilter};
    use tokio::sync::oneshot;

    use super::*;
    use crate::broker::{Broker, Subscription, TcpBroker};

    struct RunningHub {
        port: u16,
        topics: Arc<TopicTable>,
        shutdown: oneshot::Sender<()>,
        task: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    async fn run_hub() -> RunningHub {
        let mut hub = BrokerHub::new(HubConfig::default());
        let port = hub.start().await.expect("bind");
        let topics = hub.topics();
        let (shutdown, rx) = oneshot::channel();
        let task = tokio::spawn(hub.serve(async move {
            let _ = rx.await;
        }));
        RunningHub {
            port,
            topics,
            shutdown,
            task,
        }
    }

    fn client(hub: &RunningHub) -> TcpBroker {
        TcpBroker::new(format!("127.0.0.1:{}", hub.port))
    }

    fn chat_message(msg: &str) -> Event {
        Event::new("message")
            .with_field("author", "a")
            .with_field("msg", msg)
    }

    async fn next(sub: &mut Subscription) -> Event {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("event should arrive")
            .expect("subscription open")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition should hold");
    }

    #[test]
    fn new_creates_hub_without_binding() {
        let hub = BrokerHub::new(HubConfig::default());
        assert!(hub.listener.is_none());
        assert!(Arc::ptr_eq(&hub.topics(), &hub.topics()));
    }

    #[tokio::test]
    async fn serve_requires_start() {
        let hub = BrokerHub::new(HubConfig::default());
        let err = hub.serve(std::future::pending::<()>()).await.unwrap_err();
        assert!(err.to_string().contains("start() must be called"));
    }

    #[tokio::test]
    async fn fan_out_across_clients() {
        let hub = run_hub().await;
        let first = client(&hub);
        let second = client(&hub);
        let publisher = client(&hub);

        let mut a = first.subscribe("chat", EventFilter::of_type("message")).await.unwrap();
        let mut b = second.subscribe("chat", EventFilter::any()).await.unwrap();
        assert_eq!(hub.topics.subscriber_count("chat"), 2);

        publisher.publish("chat", Event::new("presence")).await.unwrap();
        publisher.publish("chat", chat_message("hi")).await.unwrap();

        assert_eq!(next(&mut a).await, chat_message("hi"));
        assert_eq!(next(&mut b).await, Event::new("presence"));
        assert_eq!(next(&mut b).await, chat_message("hi"));

        hub.shutdown.send(()).unwrap();
        hub.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let hub = run_hub().await;
        let publisher = client(&hub);
        publisher.publish("chat", chat_message("early")).await.unwrap();

        let mut late = client(&hub)
            .subscribe("chat", EventFilter::any())
            .await
            .unwrap();
        publisher.publish("chat", chat_message("late")).await.unwrap();

        assert_eq!(next(&mut late).await, chat_message("late"));
        hub.shutdown.send(()).unwrap();
    }

    #[tokio::test]
    async fn dropping_subscription_releases_it_on_the_hub() {
        let hub = run_hub().await;
        let broker = client(&hub);
        let sub = broker.subscribe("chat", EventFilter::any()).await.unwrap();
        assert_eq!(hub.topics.subscriber_count("chat"), 1);

        drop(sub);
        let topics = Arc::clone(&hub.topics);
        wait_until(move || topics.subscriber_count("chat") == 0).await;
        hub.shutdown.send(()).unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_subscriptions() {
        let hub = run_hub().await;
        let mut sub = client(&hub)
            .subscribe("chat", EventFilter::any())
            .await
            .unwrap();

        hub.shutdown.send(()).unwrap();
        hub.task.await.unwrap().unwrap();

        let end = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("subscription should end");
        assert!(end.is_none());
    }
}
