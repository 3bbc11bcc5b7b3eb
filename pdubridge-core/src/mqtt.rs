//! MQTT client wrapper.
//!
//! Wraps a rumqttc [`AsyncClient`] with the bridge's publish contract:
//! retained per-metric topics, a connection-level last will on the bridge
//! status topic, a bounded offline queue drained in order on reconnect, and
//! topic-filter dispatch for inbound commands. `publish` and `subscribe` are
//! safe to call from any task.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use pdubridge_common::error::{Error, Result};
use pdubridge_common::topics::{BRIDGE_STATUS_TOPIC, topic_matches};

pub use rumqttc::QoS;

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Offline publish queue bound; oldest entries drop when full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "pdubridge".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    10_000
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Handler invoked with the exact topic and payload of a matching publish.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Subscription {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
    retain: bool,
    qos: QoS,
}

/// Bounded FIFO holding publishes made while the broker is away.
struct OfflineQueue {
    entries: VecDeque<QueuedPublish>,
    capacity: usize,
    dropped: u64,
}

impl OfflineQueue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    fn push(&mut self, entry: QueuedPublish) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    fn pop(&mut self) -> Option<QueuedPublish> {
        self.entries.pop_front()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Inner {
    client: AsyncClient,
    connected: AtomicBool,
    closing: AtomicBool,
    queue: Mutex<OfflineQueue>,
    dropped: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Thread-safe MQTT access shared by the manager and every poller.
#[derive(Clone)]
pub struct MqttLink {
    inner: Arc<Inner>,
    event_loop: Arc<Mutex<Option<EventLoop>>>,
}

impl MqttLink {
    /// Build the client. No connection is attempted until [`MqttLink::start`]
    /// spawns the event loop.
    pub fn new(settings: &MqttSettings) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        // The broker flips the bridge status to offline on an unclean drop.
        options.set_last_will(LastWill::new(
            BRIDGE_STATUS_TOPIC,
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, 64);

        Self {
            inner: Arc::new(Inner {
                client,
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                queue: Mutex::new(OfflineQueue::new(settings.queue_capacity)),
                dropped: AtomicU64::new(0),
                subscriptions: Mutex::new(Vec::new()),
            }),
            event_loop: Arc::new(Mutex::new(Some(event_loop))),
        }
    }

    /// Spawn the broker I/O task. Panics if called twice.
    pub fn start(&self) -> JoinHandle<()> {
        let event_loop = self
            .event_loop
            .lock()
            .unwrap()
            .take()
            .expect("MqttLink::start called twice");
        let inner = self.inner.clone();

        tokio::spawn(run_event_loop(inner, event_loop))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Publishes dropped from the full offline queue.
    pub fn dropped_publishes(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    pub fn queued_publishes(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Publish, buffering while the broker is away.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        retain: bool,
        qos: QoS,
    ) -> Result<()> {
        let topic = topic.into();
        let payload = payload.into();

        if !self.is_connected() {
            self.enqueue(topic, payload, retain, qos);
            return Ok(());
        }

        if let Err(e) = self
            .inner
            .client
            .publish(topic.as_str(), qos, retain, payload.clone())
            .await
        {
            tracing::debug!(topic = %topic, error = %e, "Publish failed, buffering");
            self.enqueue(topic, payload, retain, qos);
        }
        Ok(())
    }

    fn enqueue(&self, topic: String, payload: Vec<u8>, retain: bool, qos: QoS) {
        let mut queue = self.inner.queue.lock().unwrap();
        let before = queue.dropped;
        queue.push(QueuedPublish {
            topic,
            payload,
            retain,
            qos,
        });
        if queue.dropped > before {
            self.inner.dropped.fetch_add(queue.dropped - before, Ordering::SeqCst);
        }
    }

    /// Register a handler for a topic filter (supports `+` and `#`).
    /// Handler panics are caught and logged; the subscription survives.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<()> {
        let filter = filter.into();

        self.inner.subscriptions.lock().unwrap().push(Subscription {
            filter: filter.clone(),
            qos,
            handler,
        });

        if self.is_connected() {
            self.inner
                .client
                .subscribe(filter.as_str(), qos)
                .await
                .map_err(|e| Error::MqttDisconnected(format!("subscribe {}: {}", filter, e)))?;
        }
        Ok(())
    }

    /// Drop handlers whose filter falls under a device prefix.
    pub fn unsubscribe_prefix(&self, prefix: &str) {
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .retain(|s| !s.filter.starts_with(prefix));
    }

    /// Publish the retained offline markers and close the connection.
    pub async fn shutdown(&self, device_status_topics: &[String]) {
        for topic in device_status_topics {
            let _ = self
                .inner
                .client
                .publish(topic.as_str(), QoS::AtLeastOnce, true, "offline")
                .await;
        }
        let _ = self
            .inner
            .client
            .publish(BRIDGE_STATUS_TOPIC, QoS::AtLeastOnce, true, "offline")
            .await;

        self.inner.closing.store(true, Ordering::SeqCst);
        let _ = self.inner.client.disconnect().await;
    }
}

async fn run_event_loop(inner: Arc<Inner>, mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                tracing::info!("Connected to MQTT broker");
                // Resubscribe and drain from a separate task so the event
                // loop keeps polling (the request channel is bounded).
                tokio::spawn(on_connect(inner.clone()));
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                dispatch(&inner, &publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = inner.connected.swap(false, Ordering::SeqCst);
                if inner.closing.load(Ordering::SeqCst) {
                    tracing::info!("MQTT connection closed");
                    break;
                }
                if was_connected {
                    tracing::warn!(error = %e, "MQTT connection lost, buffering publishes");
                } else {
                    tracing::debug!(error = %e, "MQTT reconnect attempt failed");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Post-connect work: resubscribe, mark online, drain the offline queue in
/// order, then open the direct-publish path.
async fn on_connect(inner: Arc<Inner>) {
    let filters: Vec<(String, QoS)> = inner
        .subscriptions
        .lock()
        .unwrap()
        .iter()
        .map(|s| (s.filter.clone(), s.qos))
        .collect();

    for (filter, qos) in filters {
        if let Err(e) = inner.client.subscribe(filter.as_str(), qos).await {
            tracing::warn!(filter = %filter, error = %e, "Resubscribe failed");
        }
    }

    if let Err(e) = inner
        .client
        .publish(BRIDGE_STATUS_TOPIC, QoS::AtLeastOnce, true, "online")
        .await
    {
        tracing::warn!(error = %e, "Failed to publish online marker");
    }

    loop {
        let next = inner.queue.lock().unwrap().pop();
        match next {
            Some(entry) => {
                if let Err(e) = inner
                    .client
                    .publish(entry.topic.as_str(), entry.qos, entry.retain, entry.payload)
                    .await
                {
                    tracing::warn!(topic = %entry.topic, error = %e, "Queued publish failed");
                }
            }
            None => {
                inner.connected.store(true, Ordering::SeqCst);
                // Catch anything enqueued between the empty check and the
                // flag flip.
                if inner.queue.lock().unwrap().len() == 0 {
                    break;
                }
            }
        }
    }

    let queued = inner.queue.lock().unwrap().len();
    tracing::debug!(remaining = queued, "Offline queue drained");
}

fn dispatch(inner: &Arc<Inner>, topic: &str, payload: &[u8]) {
    let handlers: Vec<MessageHandler> = inner
        .subscriptions
        .lock()
        .unwrap()
        .iter()
        .filter(|s| topic_matches(&s.filter, topic))
        .map(|s| s.handler.clone())
        .collect();

    for handler in handlers {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(topic, payload)));
        if result.is_err() {
            tracing::error!(topic = %topic, "Message handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_queue_bounded_fifo() {
        let mut queue = OfflineQueue::new(3);
        for i in 0..5 {
            queue.push(QueuedPublish {
                topic: format!("t/{}", i),
                payload: Vec::new(),
                retain: false,
                qos: QoS::AtMostOnce,
            });
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped, 2);
        // Oldest entries were dropped; order of the rest is preserved.
        assert_eq!(queue.pop().unwrap().topic, "t/2");
        assert_eq!(queue.pop().unwrap().topic, "t/3");
        assert_eq!(queue.pop().unwrap().topic, "t/4");
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_publish_buffers_while_disconnected() {
        let link = MqttLink::new(&MqttSettings::default());
        assert!(!link.is_connected());

        for i in 0..50 {
            link.publish(format!("pdu/d1/outlet/{}/state", i), "on", true, QoS::AtLeastOnce)
                .await
                .unwrap();
        }

        assert_eq!(link.queued_publishes(), 50);
        assert_eq!(link.dropped_publishes(), 0);
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_and_counts() {
        let settings = MqttSettings {
            queue_capacity: 10,
            ..MqttSettings::default()
        };
        let link = MqttLink::new(&settings);

        for i in 0..15 {
            link.publish(format!("t/{}", i), "x", false, QoS::AtMostOnce)
                .await
                .unwrap();
        }

        assert_eq!(link.queued_publishes(), 10);
        assert_eq!(link.dropped_publishes(), 5);
    }

    #[tokio::test]
    async fn test_dispatch_matching_and_panic_isolation() {
        let link = MqttLink::new(&MqttSettings::default());

        let hits = Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();
        link.subscribe(
            "pdu/+/outlet/+/command",
            QoS::AtLeastOnce,
            Arc::new(move |topic, payload| {
                assert_eq!(topic, "pdu/d1/outlet/3/command");
                assert_eq!(payload, b"off");
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        link.subscribe(
            "pdu/#",
            QoS::AtLeastOnce,
            Arc::new(|_, _| panic!("handler bug")),
        )
        .await
        .unwrap();

        dispatch(&link.inner, "pdu/d1/outlet/3/command", b"off");
        dispatch(&link.inner, "other/topic", b"x");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_prefix() {
        let link = MqttLink::new(&MqttSettings::default());
        link.subscribe("pdu/d1/outlet/1/command", QoS::AtLeastOnce, Arc::new(|_, _| {}))
            .await
            .unwrap();
        link.subscribe("pdu/d2/outlet/1/command", QoS::AtLeastOnce, Arc::new(|_, _| {}))
            .await
            .unwrap();

        link.unsubscribe_prefix("pdu/d1");
        assert_eq!(link.inner.subscriptions.lock().unwrap().len(), 1);
    }
}
