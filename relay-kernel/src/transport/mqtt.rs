/**
 * MQTT BROKER POOL - Shared, reference-counted broker connections
 *
 * ROLE:
 * Junctions that talk to the same broker (same host, port and credentials)
 * share one client. Each user holds a BrokerLease; the connection closes
 * when the last lease drops.
 *
 * RECONNECT:
 * The event loop keeps polling after errors (2s back-off) and re-subscribes
 * every stored topic on each ConnAck, so subscriptions survive broker restarts.
 *
 * BACK-PRESSURE:
 * Publishing on a disconnected broker fails fast instead of queueing, and every
 * request is bounded by `request_timeout_ms` so a full request channel cannot
 * stall a send cycle.
 */

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::TransportError;
use crate::config::MqttConf;
use crate::models::Collector;

/// Minimal broker client surface; rumqttc in production, a recorder in tests.
pub trait BrokerClient: Send + Sync {
    fn publish<'a>(&'a self, topic: &'a str, qos: u8, payload: Vec<u8>) -> BoxFuture<'a, Result<(), TransportError>>;
    fn subscribe<'a>(&'a self, topic: &'a str, qos: u8) -> BoxFuture<'a, Result<(), TransportError>>;
    fn unsubscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;
}

pub fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

impl BrokerClient for AsyncClient {
    fn publish<'a>(&'a self, topic: &'a str, qos: u8, payload: Vec<u8>) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            AsyncClient::publish(self, topic, qos_level(qos), false, payload)
                .await
                .map_err(|e| TransportError::Mqtt(e.to_string()))
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str, qos: u8) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            AsyncClient::subscribe(self, topic, qos_level(qos))
                .await
                .map_err(|e| TransportError::Mqtt(e.to_string()))
        })
    }

    fn unsubscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            AsyncClient::unsubscribe(self, topic)
                .await
                .map_err(|e| TransportError::Mqtt(e.to_string()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerKey {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerKey {
    pub fn default_broker(cfg: &MqttConf) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            username: None,
            password: None,
        }
    }

    pub fn for_collector(collector: &Collector, cfg: &MqttConf) -> Self {
        Self {
            host: collector
                .broker_host
                .clone()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| cfg.host.clone()),
            port: collector.broker_port.unwrap_or(cfg.port),
            username: collector.username.clone(),
            password: collector.password.clone(),
        }
    }
}

impl std::fmt::Display for BrokerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub topic: String,
    pub payload: String,
}

pub struct BrokerConnection {
    key: BrokerKey,
    client: Arc<dyn BrokerClient>,
    subscriptions: Mutex<BTreeMap<String, u8>>,
    /// Latest message per topic.
    inbox: Mutex<BTreeMap<String, InboxMessage>>,
    connected: AtomicBool,
    request_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnection {
    pub fn new(key: BrokerKey, client: Arc<dyn BrokerClient>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            key,
            client,
            request_timeout,
            subscriptions: Mutex::new(BTreeMap::new()),
            inbox: Mutex::new(BTreeMap::new()),
            connected: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &BrokerKey {
        &self.key
    }

    async fn bounded(&self, request: BoxFuture<'_, Result<(), TransportError>>) -> Result<(), TransportError> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| TransportError::Mqtt(format!("request to {} timed out", self.key)))?
    }

    pub async fn publish(&self, topic: &str, qos: u8, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected(format!("broker {}", self.key)));
        }
        self.bounded(self.client.publish(topic, qos, payload)).await
    }

    /// Records the topic first so a reconnect re-subscribes it even if this call fails.
    /// While disconnected the request is left to the next ConnAck.
    pub async fn subscribe(&self, topic: &str, qos: u8) -> Result<(), TransportError> {
        self.subscriptions.lock().insert(topic.to_string(), qos);
        if !self.is_connected() {
            tracing::debug!("[mqtt] {topic} queued until {} connects", self.key);
            return Ok(());
        }
        self.bounded(self.client.subscribe(topic, qos)).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().remove(topic);
        self.inbox.lock().retain(|t, _| !topic_matches(topic, t));
        if !self.is_connected() {
            return Ok(());
        }
        self.bounded(self.client.unsubscribe(topic)).await
    }

    pub async fn resubscribe_all(&self) {
        let subs: Vec<(String, u8)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(t, q)| (t.clone(), *q))
            .collect();
        for (topic, qos) in subs {
            if let Err(e) = self.bounded(self.client.subscribe(&topic, qos)).await {
                tracing::warn!("[mqtt] re-subscribe {topic} on {} failed: {e}", self.key);
            }
        }
        tracing::debug!("[mqtt] re-subscribed topics on {}", self.key);
    }

    pub fn record_incoming(&self, topic: &str, payload: &[u8]) {
        let message = InboxMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        };
        self.inbox.lock().insert(topic.to_string(), message);
    }

    /// Latest messages whose topic matches `filter`.
    pub fn inbox_matching(&self, filter: &str) -> Vec<InboxMessage> {
        self.inbox
            .lock()
            .values()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn shutdown(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

pub type Connector = Arc<dyn Fn(&BrokerKey) -> Arc<BrokerConnection> + Send + Sync>;

struct PoolEntry {
    conn: Arc<BrokerConnection>,
    refs: usize,
}

struct PoolInner {
    conns: Mutex<HashMap<BrokerKey, PoolEntry>>,
    connector: Connector,
}

impl PoolInner {
    fn release(&self, key: &BrokerKey) {
        let mut conns = self.conns.lock();
        let Some(entry) = conns.get_mut(key) else { return };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            if let Some(entry) = conns.remove(key) {
                entry.conn.shutdown();
                tracing::info!("[mqtt] closed connection to {key}");
            }
        }
    }
}

#[derive(Clone)]
pub struct MqttPool {
    inner: Arc<PoolInner>,
}

impl MqttPool {
    pub fn new(cfg: MqttConf) -> Self {
        Self::with_connector(Arc::new(move |key: &BrokerKey| connect_rumqttc(key, &cfg)))
    }

    pub fn with_connector(connector: Connector) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                conns: Mutex::new(HashMap::new()),
                connector,
            }),
        }
    }

    /// Shared connection for `key`, opened on first use.
    pub fn acquire(&self, key: &BrokerKey) -> BrokerLease {
        let mut conns = self.inner.conns.lock();
        let entry = conns.entry(key.clone()).or_insert_with(|| {
            tracing::info!("[mqtt] opening connection to {key}");
            PoolEntry {
                conn: (self.inner.connector)(key),
                refs: 0,
            }
        });
        entry.refs += 1;
        BrokerLease {
            pool: Arc::downgrade(&self.inner),
            conn: entry.conn.clone(),
        }
    }

    /// Connection for `key` if some lease currently holds it open.
    pub fn get(&self, key: &BrokerKey) -> Option<Arc<BrokerConnection>> {
        self.inner.conns.lock().get(key).map(|e| e.conn.clone())
    }

    pub fn open_connections(&self) -> usize {
        self.inner.conns.lock().len()
    }

    pub fn lease_count(&self, key: &BrokerKey) -> usize {
        self.inner.conns.lock().get(key).map_or(0, |e| e.refs)
    }
}

pub struct BrokerLease {
    pool: Weak<PoolInner>,
    conn: Arc<BrokerConnection>,
}

impl BrokerLease {
    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.conn
    }
}

impl Deref for BrokerLease {
    type Target = BrokerConnection;

    fn deref(&self) -> &BrokerConnection {
        &self.conn
    }
}

impl Drop for BrokerLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(&self.conn.key);
        }
    }
}

fn connect_rumqttc(key: &BrokerKey, cfg: &MqttConf) -> Arc<BrokerConnection> {
    let client_id = format!("{}-{}", cfg.client_id_prefix, uuid::Uuid::new_v4().simple());
    let mut opts = MqttOptions::new(client_id, key.host.clone(), key.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    if let Some(user) = &key.username {
        opts.set_credentials(user.clone(), key.password.clone().unwrap_or_default());
    }
    let (client, eventloop) = AsyncClient::new(opts, 64);
    let conn = BrokerConnection::new(
        key.clone(),
        Arc::new(client),
        Duration::from_millis(cfg.request_timeout_ms.max(1)),
    );
    let handle = tokio::spawn(run_event_loop(Arc::downgrade(&conn), eventloop));
    *conn.task.lock() = Some(handle);
    conn
}

async fn run_event_loop(conn: Weak<BrokerConnection>, mut eventloop: EventLoop) {
    loop {
        let event = eventloop.poll().await;
        let Some(conn) = conn.upgrade() else { break };
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                conn.set_connected(true);
                tracing::info!("[mqtt] connected to {}", conn.key);
                // The request channel is drained by this loop, so re-subscribe from another task.
                tokio::spawn(async move { conn.resubscribe_all().await });
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                conn.record_incoming(&p.topic, &p.payload);
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => conn.set_connected(false),
            Ok(_) => {}
            Err(e) => {
                conn.set_connected(false);
                tracing::warn!("[mqtt] {} error: {e:?}", conn.key);
                drop(conn);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// MQTT topic filter match with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use relay_devkit::MockMqttClient;

    pub(crate) struct MockBroker(pub MockMqttClient);

    impl BrokerClient for MockBroker {
        fn publish<'a>(&'a self, topic: &'a str, qos: u8, payload: Vec<u8>) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async move {
                self.0
                    .publish(topic, qos_level(qos), false, payload)
                    .await
                    .map_err(|e| TransportError::Mqtt(e.to_string()))
            })
        }

        fn subscribe<'a>(&'a self, topic: &'a str, qos: u8) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async move {
                self.0
                    .subscribe(topic, qos_level(qos))
                    .await
                    .map_err(|e| TransportError::Mqtt(e.to_string()))
            })
        }

        fn unsubscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async move {
                self.0
                    .unsubscribe(topic)
                    .await
                    .map_err(|e| TransportError::Mqtt(e.to_string()))
            })
        }
    }

    /// Pool whose every connection records into `client`.
    pub(crate) fn mock_pool(client: MockMqttClient) -> MqttPool {
        mock_pool_with(client, true)
    }

    /// Same as `mock_pool`, with connections starting in the given connected state.
    pub(crate) fn mock_pool_with(client: MockMqttClient, connected: bool) -> MqttPool {
        MqttPool::with_connector(Arc::new(move |key: &BrokerKey| {
            let conn = mock_connection(key.clone(), client.clone());
            conn.set_connected(connected);
            conn
        }))
    }

    /// Pool whose connections also receive what `client.simulate_incoming` sends.
    pub(crate) fn relaying_pool(client: MockMqttClient) -> MqttPool {
        MqttPool::with_connector(Arc::new(move |key: &BrokerKey| {
            let conn = mock_connection(key.clone(), client.clone());
            conn.set_connected(true);
            let mut incoming = client.setup_receiver();
            let weak = Arc::downgrade(&conn);
            tokio::spawn(async move {
                while let Some(msg) = incoming.recv().await {
                    let Some(conn) = weak.upgrade() else { break };
                    conn.record_incoming(&msg.topic, &msg.payload);
                }
            });
            conn
        }))
    }

    pub(crate) fn mock_connection(key: BrokerKey, client: MockMqttClient) -> Arc<BrokerConnection> {
        BrokerConnection::new(key, Arc::new(MockBroker(client)), Duration::from_millis(200))
    }

    /// Never completes a request, like a client whose request channel is full.
    struct StalledBroker;

    impl BrokerClient for StalledBroker {
        fn publish<'a>(&'a self, _: &'a str, _: u8, _: Vec<u8>) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(futures::future::pending())
        }

        fn subscribe<'a>(&'a self, _: &'a str, _: u8) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(futures::future::pending())
        }

        fn unsubscribe<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(futures::future::pending())
        }
    }

    fn key(host: &str) -> BrokerKey {
        BrokerKey {
            host: host.into(),
            port: 1883,
            username: None,
            password: None,
        }
    }

    #[test]
    fn test_topic_filters() {
        assert!(topic_matches("sensors/#", "sensors/kitchen/temp"));
        assert!(topic_matches("sensors/+/temp", "sensors/kitchen/temp"));
        assert!(!topic_matches("sensors/+/temp", "sensors/kitchen/hum"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[tokio::test]
    async fn test_pool_shares_and_releases_connections() {
        let pool = mock_pool(MockMqttClient::new());
        let a = pool.acquire(&key("broker"));
        let b = pool.acquire(&key("broker"));
        let c = pool.acquire(&key("other"));
        assert!(Arc::ptr_eq(a.connection(), b.connection()));
        assert_eq!(pool.open_connections(), 2);
        assert_eq!(pool.lease_count(&key("broker")), 2);

        drop(a);
        assert_eq!(pool.lease_count(&key("broker")), 1);
        drop(b);
        drop(c);
        assert_eq!(pool.open_connections(), 0);
        assert!(pool.get(&key("broker")).is_none());
    }

    #[tokio::test]
    async fn test_subscribe_list_unsubscribe() {
        let client = MockMqttClient::new();
        let pool = mock_pool(client.clone());
        let lease = pool.acquire(&key("broker"));

        lease.subscribe("sensors/kitchen/temp", 1).await.unwrap();
        assert_eq!(client.get_subscriptions(), vec!["sensors/kitchen/temp"]);
        assert_eq!(client.subscription_qos("sensors/kitchen/temp"), Some(QoS::AtLeastOnce));

        lease.unsubscribe("sensors/kitchen/temp").await.unwrap();
        assert!(client.get_subscriptions().is_empty());

        // Nothing left to restore after a reconnect.
        lease.resubscribe_all().await;
        assert!(client.get_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_restores_topics_after_reconnect() {
        let client = MockMqttClient::new();
        let pool = mock_pool(client.clone());
        let lease = pool.acquire(&key("broker"));
        lease.subscribe("a/#", 0).await.unwrap();
        lease.subscribe("b/c", 2).await.unwrap();

        // A broker restart forgets every subscription.
        client.clear();
        lease.resubscribe_all().await;
        assert_eq!(client.get_subscriptions(), vec!["a/#", "b/c"]);
        assert_eq!(client.subscription_qos("b/c"), Some(QoS::ExactlyOnce));
    }

    #[test]
    fn test_inbox_keeps_latest_per_topic() {
        let conn = mock_connection(key("x"), MockMqttClient::new());
        conn.record_incoming("home/temp", b"20.5");
        conn.record_incoming("home/temp", b"21.0");
        conn.record_incoming("other", b"1");
        let msgs = conn.inbox_matching("home/#");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, "21.0");
    }

    #[tokio::test]
    async fn test_publish_fails_fast_while_disconnected() {
        let client = MockMqttClient::new();
        let pool = mock_pool_with(client.clone(), false);
        let lease = pool.acquire(&key("broker"));

        let err = lease.publish("panel/data", 1, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));
        assert!(client.get_published_messages().is_empty());

        // Subscriptions wait for the ConnAck re-subscribe.
        lease.subscribe("home/#", 0).await.unwrap();
        assert!(client.get_subscriptions().is_empty());
        lease.set_connected(true);
        lease.resubscribe_all().await;
        assert_eq!(client.get_subscriptions(), vec!["home/#"]);
        lease.publish("panel/data", 1, b"x".to_vec()).await.unwrap();
        assert_eq!(client.find_messages_by_topic("panel/data").len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_request_times_out() {
        let conn = BrokerConnection::new(key("x"), Arc::new(StalledBroker), Duration::from_millis(50));
        conn.set_connected(true);
        let started = std::time::Instant::now();
        let err = conn.publish("panel/data", 0, Vec::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Mqtt(ref m) if m.contains("timed out")));
        assert!(conn.subscribe("a/b", 0).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_refused_publish_is_reported() {
        let client = MockMqttClient::new();
        let lease = mock_pool(client.clone()).acquire(&key("broker"));
        client.set_fail_publish(true);
        assert!(matches!(
            lease.publish("panel/data", 0, Vec::new()).await,
            Err(TransportError::Mqtt(_))
        ));
    }
}
