use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use scopewire_frame::{CONTROL, PUBLISH};
use scopewire_transport::Endpoint;
use tracing::{debug, warn};

use crate::connection::{Connection, PeerInfo, SocketConfig};
use crate::control::{ControlMessage, CONTROL_SUBSCRIBE, CONTROL_UNSUBSCRIBE};
use crate::error::Result;
use crate::hub::{Hub, HubEvent};
use crate::pattern::Pattern;
use crate::topic::matches_prefix;

/// A prefix a subscriber just asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub peer_id: String,
    pub prefix: String,
}

struct Subscriber {
    info: Arc<PeerInfo>,
    prefixes: Vec<String>,
}

/// Publishing end of publish/subscribe.
///
/// Each message is `[topic, body]`. A subscriber only receives topics that
/// match one of the prefixes it subscribed to; there is no replay for late
/// joiners, but [`take_new_subscriptions`](Self::take_new_subscriptions)
/// lets the owner send a snapshot with [`publish_to`](Self::publish_to).
pub struct PublishSocket {
    hub: Hub,
    subscribers: HashMap<String, Subscriber>,
    fresh: Vec<Subscription>,
}

impl PublishSocket {
    /// Bind with default settings.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        Self::bind_with_config(endpoint, SocketConfig::default())
    }

    /// Bind with explicit settings.
    pub fn bind_with_config(endpoint: &Endpoint, config: SocketConfig) -> Result<Self> {
        Ok(Self {
            hub: Hub::bind(endpoint, Pattern::Publish, config)?,
            subscribers: HashMap::new(),
            fresh: Vec::new(),
        })
    }

    /// The bound endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        self.hub.endpoint()
    }

    /// Apply pending joins, leaves and subscription changes.
    pub fn poll(&mut self) -> Result<()> {
        while let Some(event) = self.hub.try_event()? {
            match event {
                HubEvent::Joined(info) => {
                    self.subscribers.insert(
                        info.peer_id.clone(),
                        Subscriber {
                            info,
                            prefixes: Vec::new(),
                        },
                    );
                }
                HubEvent::Left(info) => {
                    self.subscribers.remove(&info.peer_id);
                    self.fresh.retain(|s| s.peer_id != info.peer_id);
                }
                HubEvent::Message(info, message) if message.channel == CONTROL => {
                    let parsed = message
                        .part(0)
                        .map(|part| serde_json::from_slice::<ControlMessage>(part));
                    match parsed {
                        Some(Ok(control)) => self.apply_control(&info, control),
                        Some(Err(err)) => {
                            warn!(peer_id = %info.peer_id, error = %err, "bad control message")
                        }
                        None => {}
                    }
                }
                HubEvent::Message(info, message) => {
                    debug!(peer_id = %info.peer_id, channel = message.channel, "subscriber sent data; ignored");
                }
            }
        }
        Ok(())
    }

    fn apply_control(&mut self, info: &PeerInfo, control: ControlMessage) {
        let Some(subscriber) = self.subscribers.get_mut(&info.peer_id) else {
            return;
        };
        let prefix = control.prefix.unwrap_or_default();
        match control.msg_type.as_str() {
            CONTROL_SUBSCRIBE => {
                if !subscriber.prefixes.contains(&prefix) {
                    debug!(peer_id = %info.peer_id, prefix = %prefix, "subscribed");
                    subscriber.prefixes.push(prefix.clone());
                    self.fresh.push(Subscription {
                        peer_id: info.peer_id.clone(),
                        prefix,
                    });
                }
            }
            CONTROL_UNSUBSCRIBE => subscriber.prefixes.retain(|p| p != &prefix),
            other => debug!(peer_id = %info.peer_id, msg_type = other, "unknown control message"),
        }
    }

    /// Subscriptions added since the last call.
    pub fn take_new_subscriptions(&mut self) -> Result<Vec<Subscription>> {
        self.poll()?;
        Ok(std::mem::take(&mut self.fresh))
    }

    /// Send `[topic, body]` to every subscriber whose prefixes match `topic`.
    ///
    /// Returns how many subscribers it was delivered to.
    pub fn publish(&mut self, topic: &str, body: &[u8]) -> Result<usize> {
        self.poll()?;
        let targets: Vec<String> = self
            .subscribers
            .values()
            .filter(|s| s.prefixes.iter().any(|p| matches_prefix(p, topic)))
            .map(|s| s.info.peer_id.clone())
            .collect();

        let mut delivered = 0;
        for peer_id in targets {
            match self.hub.send(&peer_id, PUBLISH, &[topic.as_bytes(), body]) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(peer_id = %peer_id, error = %err, "subscriber dropped");
                    self.subscribers.remove(&peer_id);
                }
            }
        }
        Ok(delivered)
    }

    /// Send `[topic, body]` to one subscriber regardless of its filters.
    pub fn publish_to(&mut self, peer_id: &str, topic: &str, body: &[u8]) -> Result<()> {
        self.hub.send(peer_id, PUBLISH, &[topic.as_bytes(), body])
    }

    /// Connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Total (subscriber, prefix) pairs.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.values().map(|s| s.prefixes.len()).sum()
    }
}

/// Subscribing end of publish/subscribe.
pub struct SubscribeSocket {
    connection: Connection,
    prefixes: Vec<String>,
}

impl SubscribeSocket {
    /// Connect with default settings. Nothing is delivered until [`subscribe`](Self::subscribe).
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_with_config(endpoint, &SocketConfig::default())
    }

    /// Connect with explicit settings.
    pub fn connect_with_config(endpoint: &Endpoint, config: &SocketConfig) -> Result<Self> {
        Ok(Self {
            connection: Connection::connect(endpoint, Pattern::Subscribe, config)?,
            prefixes: Vec::new(),
        })
    }

    /// The publisher side of this connection.
    pub fn peer(&self) -> &PeerInfo {
        self.connection.info()
    }

    /// Receive every topic under `prefix` (`""` for all).
    pub fn subscribe(&mut self, prefix: &str) -> Result<()> {
        let payload = serde_json::to_vec(&ControlMessage::subscribe(prefix))?;
        self.connection.send(CONTROL, &[&payload])?;
        if !self.prefixes.iter().any(|p| p == prefix) {
            self.prefixes.push(prefix.to_string());
        }
        Ok(())
    }

    /// Stop receiving topics under `prefix`.
    pub fn unsubscribe(&mut self, prefix: &str) -> Result<()> {
        let payload = serde_json::to_vec(&ControlMessage::unsubscribe(prefix))?;
        self.connection.send(CONTROL, &[&payload])?;
        self.prefixes.retain(|p| p != prefix);
        Ok(())
    }

    /// Wait up to `timeout` for the next `(topic, body)`.
    ///
    /// Topics that no longer match a local prefix (a race with
    /// `unsubscribe`) are skipped.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<(String, Bytes)>> {
        let Some(message) = self.connection.recv_timeout(timeout)? else {
            return Ok(None);
        };
        if message.channel != PUBLISH || message.len() != 2 {
            debug!(channel = message.channel, parts = message.len(), "ignoring malformed publish");
            return Ok(None);
        }
        let Some(topic) = message.part_str(0).map(str::to_string) else {
            debug!("ignoring non-utf8 topic");
            return Ok(None);
        };
        if !self.prefixes.iter().any(|p| matches_prefix(p, &topic)) {
            return Ok(None);
        }
        let body = message.parts[1].clone();
        Ok(Some((topic, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_for_subscriptions(publisher: &mut PublishSocket, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.subscription_count() < n {
            assert!(Instant::now() < deadline, "subscribers never registered");
            publisher.poll().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn recv_within(socket: &mut SubscribeSocket, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        let mut topics = Vec::new();
        while Instant::now() < deadline {
            if let Some((topic, _)) = socket.recv_timeout(Duration::from_millis(20)).unwrap() {
                topics.push(topic);
            }
        }
        topics
    }

    #[test]
    fn prefix_filter_selects_dotted_segments() {
        let mut publisher = PublishSocket::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let mut subscriber = SubscribeSocket::connect(publisher.endpoint()).unwrap();
        subscriber.subscribe("scope.stage").unwrap();
        wait_for_subscriptions(&mut publisher, 1);

        assert_eq!(publisher.publish("scope.stage.x", b"1").unwrap(), 1);
        assert_eq!(publisher.publish("scope.camera.gain", b"2").unwrap(), 0);
        assert_eq!(publisher.publish("scope.stage.y", b"3").unwrap(), 1);

        let topics = recv_within(&mut subscriber, Duration::from_millis(300));
        assert_eq!(topics, vec!["scope.stage.x", "scope.stage.y"]);
    }

    #[test]
    fn new_subscriptions_are_reported_once() {
        let mut publisher = PublishSocket::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let mut subscriber = SubscribeSocket::connect(publisher.endpoint()).unwrap();
        subscriber.subscribe("").unwrap();
        wait_for_subscriptions(&mut publisher, 1);

        let fresh = publisher.take_new_subscriptions().unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].prefix, "");
        assert!(publisher.take_new_subscriptions().unwrap().is_empty());

        publisher
            .publish_to(&fresh[0].peer_id, "snapshot.value", b"7")
            .unwrap();
        let (topic, body) = subscriber
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("snapshot should arrive");
        assert_eq!(topic, "snapshot.value");
        assert_eq!(body.as_ref(), b"7");
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut publisher = PublishSocket::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let mut subscriber = SubscribeSocket::connect(publisher.endpoint()).unwrap();
        subscriber.subscribe("lamp").unwrap();
        wait_for_subscriptions(&mut publisher, 1);
        subscriber.unsubscribe("lamp").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.subscription_count() > 0 {
            assert!(Instant::now() < deadline);
            publisher.poll().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(publisher.publish("lamp.on", b"true").unwrap(), 0);
    }

    #[test]
    fn departed_subscriber_is_forgotten() {
        let mut publisher = PublishSocket::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let mut subscriber = SubscribeSocket::connect(publisher.endpoint()).unwrap();
        subscriber.subscribe("").unwrap();
        wait_for_subscriptions(&mut publisher, 1);
        drop(subscriber);

        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.subscriber_count() > 0 {
            assert!(Instant::now() < deadline);
            publisher.poll().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
