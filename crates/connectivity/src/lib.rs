#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Owns the single MQTT session shared by the telemetry sender and any other
//! subscriber of broker-delivered topics.
//!
//! Grounded on the teacher's `EngineHandler`/`EffectHandler` split (an
//! external event source fed into the rest of the system through a bounded
//! channel rather than direct calls) and on the connectivity lifecycle of
//! `AwsIotConnectivityModule`: connect with backoff, re-subscribe receivers
//! whenever a reconnect did not rejoin a prior session, and never block the
//! client's own callback/poll loop on downstream consumers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing};
use task::labels::TaskLabels;
use task::{JoinHandleTask, TaskManager};

/// The MQTT quality-of-service level, re-exported so downstream crates don't
/// need their own dependency on the transport crate just to name a QoS.
pub use rumqttc::QoS;

/// All the errors this crate surfaces directly (broker-reported failures are
/// delivered as lifecycle events, not returned errors, since the caller of
/// `publish` usually isn't the one that should react to them).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The outbound publish queue rejected the request because the session
    /// is currently disconnected or a prior publish is still queued.
    #[error("publish was rejected: {0}")]
    PublishRejected(#[from] rumqttc::ClientError),
}

/// Static connection parameters, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// Broker hostname or IP.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
    /// MQTT client identifier.
    pub client_id: String,
    /// Keep-alive interval, in seconds.
    pub keep_alive_secs: u64,
    /// Session expiry interval, in seconds. `0` disables persistent sessions.
    pub session_expiry_secs: u32,
    /// Starting backoff, in milliseconds, before the first connection retry.
    pub start_backoff_ms: u64,
    /// Upper bound, in milliseconds, the exponential backoff saturates at.
    pub max_backoff_ms: u64,
    /// Path to a PEM-encoded root CA bundle, if server validation needs one
    /// beyond the platform's trust store.
    pub root_ca_path: Option<String>,
}

/// A lifecycle event describing the state of the underlying MQTT session.
/// Delivered to subscribers over a bounded channel so the polling loop never
/// blocks on a slow consumer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ConnectivityEvent {
    /// A connection attempt has started.
    Attempting,
    /// The connection succeeded.
    Success {
        /// Whether the broker resumed a prior persistent session.
        rejoined: bool,
    },
    /// The connection attempt failed.
    Failure {
        /// Broker- or transport-reported reason code, when one is available.
        code: Option<u8>,
        /// A human-readable description of the failure.
        reason: String,
    },
    /// An established connection was interrupted.
    Interrupted {
        /// Broker-reported disconnect reason code, when one is available.
        code: Option<u8>,
    },
    /// The session resumed after an interruption, without needing a fresh
    /// `connect()` round-trip (e.g. the transport's own keep-alive recovered).
    Resumed,
    /// The client was stopped deliberately and will not reconnect.
    Stopped,
}

struct TopicSubscription {
    qos: QoS,
    sender: flume::Sender<Vec<u8>>,
}

/// Owns the MQTT client handle and the bookkeeping needed to fan inbound
/// messages and lifecycle events out to subscribers.
pub struct ConnectivityManager {
    client: AsyncClient,
    eventloop: EventLoop,
    config: ConnectivityConfig,
    topics: Arc<Mutex<HashMap<String, TopicSubscription>>>,
    lifecycle_subscribers: Arc<Mutex<Vec<flume::Sender<ConnectivityEvent>>>>,
    diagnostics: Arc<diagnostics::Counters>,
    stop_tx: flume::Sender<()>,
    stop_rx: flume::Receiver<()>,
}

/// A cheaply cloneable handle used to publish and subscribe without owning
/// the manager's poll loop.
#[derive(Clone)]
pub struct ConnectivityHandle {
    client: AsyncClient,
    topics: Arc<Mutex<HashMap<String, TopicSubscription>>>,
    lifecycle_subscribers: Arc<Mutex<Vec<flume::Sender<ConnectivityEvent>>>>,
    stop_tx: flume::Sender<()>,
}

impl ConnectivityHandle {
    /// Publishes a payload to `topic`, failing only if the client's local
    /// outbound queue rejects it outright; broker-side failures surface as
    /// `ConnectivityEvent::Failure`/`Interrupted` on the lifecycle channel.
    pub async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), Error> {
        self.client.publish(topic, qos, false, payload).await?;
        Ok(())
    }

    /// Registers interest in `topic`, returning a channel that receives the
    /// raw payload of every message delivered on it from now on. Calling this
    /// again for the same topic replaces the previous subscriber.
    pub fn subscribe_topic(&self, topic: impl Into<String>, qos: QoS) -> flume::Receiver<Vec<u8>> {
        let (sender, receiver) = flume::bounded(64);
        let mut topics = self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = topics.insert(topic.into(), TopicSubscription { qos, sender });
        receiver
    }

    /// Registers interest in connectivity lifecycle events.
    pub fn subscribe_lifecycle(&self) -> flume::Receiver<ConnectivityEvent> {
        let (sender, receiver) = flume::bounded(16);
        let mut subscribers = self
            .lifecycle_subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(sender);
        receiver
    }

    /// Requests that `run` disconnect and return. Idempotent: calling this
    /// more than once, or after `run` has already stopped, is a no-op.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

impl ConnectivityManager {
    /// Builds a manager and its client, without connecting yet. Connection
    /// is attempted once `run` starts polling.
    pub fn new(config: ConnectivityConfig, diagnostics: Arc<diagnostics::Counters>) -> Self {
        let mut options = MqttOptions::new(config.client_id.clone(), config.broker_host.clone(), config.broker_port);
        let _ = options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        let _ = options.set_clean_session(config.session_expiry_secs == 0);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (stop_tx, stop_rx) = flume::bounded(1);

        Self {
            client,
            eventloop,
            config,
            topics: Arc::new(Mutex::new(HashMap::new())),
            lifecycle_subscribers: Arc::new(Mutex::new(Vec::new())),
            diagnostics,
            stop_rx,
            stop_tx,
        }
    }

    /// A handle that can be cloned out and used to publish/subscribe, and to
    /// stop the poll loop, independently of the task driving `run`.
    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            client: self.client.clone(),
            topics: self.topics.clone(),
            lifecycle_subscribers: self.lifecycle_subscribers.clone(),
            stop_tx: self.stop_tx.clone(),
        }
    }

    fn emit(&self, event: ConnectivityEvent) {
        let subscribers = self
            .lifecycle_subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for subscriber in subscribers.iter() {
            let _ = subscriber.try_send(event.clone());
        }
    }

    fn deliver(&self, topic: &str, payload: Vec<u8>) {
        let topics = self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(subscription) = topics.get(topic) {
            if subscription.sender.try_send(payload).is_err() {
                tracing::warn!(topic, "dropping inbound message, subscriber channel is full or gone");
            }
        } else {
            tracing::warn!(topic, "no subscriber registered for inbound topic");
        }
    }

    async fn resubscribe_all(
        client: &AsyncClient,
        topics: &Arc<Mutex<HashMap<String, TopicSubscription>>>,
    ) {
        let topics: Vec<(String, QoS)> = {
            let topics = topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            topics.iter().map(|(topic, sub)| (topic.clone(), sub.qos)).collect()
        };
        for (topic, qos) in topics {
            if let Err(error) = client.subscribe(topic.as_str(), qos).await {
                tracing::warn!(%error, topic, "failed to re-subscribe after reconnect");
            }
        }
    }

    /// Drives the MQTT event loop until told to stop, retrying the first
    /// connection (and any subsequent reconnect attempt) with exponential
    /// backoff between `start_backoff_ms` and `max_backoff_ms`. A stop
    /// request issues a client-initiated disconnect, emits
    /// `ConnectivityEvent::Stopped`, and returns.
    pub async fn run(mut self) {
        let mut backoff_ms = self.config.start_backoff_ms;
        let mut session_ever_established = false;

        loop {
            let poll = tokio::select! {
                poll = self.eventloop.poll() => poll,
                _ = self.stop_rx.recv_async() => {
                    if let Err(error) = self.client.disconnect().await {
                        tracing::warn!(%error, "client-initiated disconnect failed while stopping");
                    }
                    self.emit(ConnectivityEvent::Stopped);
                    return;
                }
            };

            match poll {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    backoff_ms = self.config.start_backoff_ms;
                    let rejoined = ack.session_present;
                    self.emit(ConnectivityEvent::Success { rejoined });
                    if !rejoined {
                        Self::resubscribe_all(&self.client, &self.topics).await;
                    }
                    session_ever_established = true;
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    self.deliver(&publish.topic, publish.payload.to_vec());
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    self.emit(ConnectivityEvent::Interrupted { code: None });
                }
                Ok(Event::Outgoing(Outgoing::PingReq)) | Ok(Event::Incoming(Incoming::PingResp)) => {
                    if session_ever_established {
                        self.emit(ConnectivityEvent::Resumed);
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    self.diagnostics.inc_send_publish_failed();
                    if session_ever_established {
                        self.emit(ConnectivityEvent::Interrupted { code: None });
                    } else {
                        self.emit(ConnectivityEvent::Failure { code: None, reason: error.to_string() });
                    }
                    tracing::warn!(%error, backoff_ms, "mqtt poll failed, backing off before retry");
                    self.emit(ConnectivityEvent::Attempting);
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms);
                }
            }
        }
    }
}

/// Spawns the manager's poll loop on the async runtime and registers it with
/// `task_manager`, the way the teacher registers its receiver/exporter tasks.
pub fn spawn(manager: ConnectivityManager, task_manager: &mut TaskManager) {
    let task_labels = TaskLabels::new("connectivity", "mqtt-session", "agent");
    let cleanup_labels = task_labels.clone();
    let process_labels = task_manager.process_labels();

    let join_handle: JoinHandleTask = tokio::task::spawn(async move {
        manager.run().await;
        TaskManager::no_task_cleaner(process_labels, cleanup_labels)
    });

    task_manager.register(join_handle, &task_labels);
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> ConnectivityConfig {
        ConnectivityConfig {
            broker_host: "localhost".into(),
            broker_port: 1883,
            client_id: "test-client".into(),
            keep_alive_secs: 30,
            session_expiry_secs: 0,
            start_backoff_ms: 100,
            max_backoff_ms: 1_000,
            root_ca_path: None,
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_configured_ceiling() {
        let cfg = config();
        let mut backoff_ms = cfg.start_backoff_ms;
        for _ in 0..10 {
            backoff_ms = (backoff_ms * 2).min(cfg.max_backoff_ms);
        }
        assert_eq!(backoff_ms, cfg.max_backoff_ms);
    }

    #[test]
    fn subscribing_to_a_topic_twice_replaces_the_previous_receiver() {
        let manager = ConnectivityManager::new(config(), Arc::new(diagnostics::Counters::new()));
        let handle = manager.handle();

        let first = handle.subscribe_topic("veh/dtc", QoS::AtLeastOnce);
        let second = handle.subscribe_topic("veh/dtc", QoS::AtLeastOnce);

        manager.deliver("veh/dtc", vec![1, 2, 3]);

        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stopping_the_handle_makes_run_return() {
        let manager = ConnectivityManager::new(config(), Arc::new(diagnostics::Counters::new()));
        let handle = manager.handle();
        let events = handle.subscribe_lifecycle();

        let join_handle = tokio::spawn(manager.run());
        handle.stop();

        tokio::time::timeout(Duration::from_secs(5), join_handle)
            .await
            .expect("run did not return after stop was requested")
            .expect("run task panicked");

        let mut saw_stopped = false;
        while let Ok(event) = events.try_recv() {
            saw_stopped |= matches!(event, ConnectivityEvent::Stopped);
        }
        assert!(saw_stopped, "run must emit Stopped before returning");
    }

    #[test]
    fn lifecycle_events_fan_out_to_every_subscriber() {
        let manager = ConnectivityManager::new(config(), Arc::new(diagnostics::Counters::new()));
        let handle = manager.handle();

        let a = handle.subscribe_lifecycle();
        let b = handle.subscribe_lifecycle();

        manager.emit(ConnectivityEvent::Stopped);

        assert!(matches!(a.try_recv().unwrap(), ConnectivityEvent::Stopped));
        assert!(matches!(b.try_recv().unwrap(), ConnectivityEvent::Stopped));
    }
}
