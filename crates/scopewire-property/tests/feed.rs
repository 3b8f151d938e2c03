//! Publisher and subscriber talking over real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use scopewire_property::{
    HeartbeatMonitor, HeartbeatPublisher, LateJoin, PropertyPublisher, PropertySubscriber,
    PublisherConfig,
};
use scopewire_transport::Endpoint;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

fn wait_for_subscriptions(publisher: &PropertyPublisher, n: usize) {
    let deadline = Instant::now() + WAIT;
    while publisher.subscription_count() < n {
        assert!(Instant::now() < deadline, "subscriber never registered");
        thread::sleep(Duration::from_millis(5));
    }
}

fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn prefix_subscriber_sees_stage_but_not_camera() {
    let publisher = PropertyPublisher::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
    let subscriber = PropertySubscriber::connect(publisher.endpoint()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    subscriber.subscribe_prefix("scope.stage", move |name, _| {
        sink.lock().unwrap().push(name.to_string());
    });
    wait_for_subscriptions(&publisher, 1);

    publisher.update("scope.stage.x", &10.0).unwrap();
    publisher.update("scope.camera.gain", &2).unwrap();
    publisher.update("scope.stage.y", &-3.5).unwrap();

    assert_eq!(subscriber.wait_for("scope.stage.y", WAIT), Some(json!(-3.5)));
    // Everything reaches the mirror; only matching names reach the callback.
    assert_eq!(subscriber.get("scope.camera.gain"), Some(json!(2)));
    assert_eq!(*seen.lock().unwrap(), vec!["scope.stage.x", "scope.stage.y"]);
}

#[test]
fn unsubscribed_callback_stops_firing() {
    let publisher = PropertyPublisher::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
    let subscriber = PropertySubscriber::connect(publisher.endpoint()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let id = subscriber.subscribe("scope.lamp.on", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    wait_for_subscriptions(&publisher, 1);

    publisher.update("scope.lamp.on", &true).unwrap();
    subscriber.wait_for("scope.lamp.on", WAIT).unwrap();
    assert!(subscriber.unsubscribe(id));
    assert!(!subscriber.unsubscribe(id));
    publisher.update("scope.lamp.on", &false).unwrap();
    subscriber
        .wait_until("scope.lamp.on", WAIT, |v| v == &json!(false))
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn deltas_mode_sends_no_history() {
    let publisher = PropertyPublisher::bind(&Endpoint::tcp("127.0.0.1", 0)).unwrap();
    publisher.update("scope.stage.x", &1).unwrap();
    let subscriber = PropertySubscriber::connect(publisher.endpoint()).unwrap();
    wait_for_subscriptions(&publisher, 1);
    publisher.update("scope.stage.y", &2).unwrap();

    subscriber.wait_for("scope.stage.y", WAIT).unwrap();
    assert_eq!(subscriber.get("scope.stage.x"), None);

    publisher.rebroadcast().unwrap();
    assert_eq!(subscriber.wait_for("scope.stage.x", WAIT), Some(json!(1)));
}

#[test]
fn snapshot_mode_replays_matching_values_to_new_subscribers() {
    let publisher = PropertyPublisher::bind_with_config(
        &Endpoint::tcp("127.0.0.1", 0),
        PublisherConfig {
            late_join: LateJoin::Snapshot,
            ..PublisherConfig::default()
        },
    )
    .unwrap();
    publisher.update("scope.stage.x", &5).unwrap();
    publisher.update("scope.camera.gain", &3).unwrap();

    let subscriber =
        PropertySubscriber::connect_filtered(publisher.endpoint(), &["scope.stage"]).unwrap();
    assert_eq!(subscriber.wait_for("scope.stage.x", WAIT), Some(json!(5)));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(subscriber.get("scope.camera.gain"), None);
}

#[test]
fn heartbeat_loss_and_restore_are_reported() {
    let interval = Duration::from_millis(50);
    let mut beat = HeartbeatPublisher::spawn(&Endpoint::tcp("127.0.0.1", 0), interval).unwrap();
    let endpoint = beat.endpoint().clone();

    let lost = Arc::new(AtomicUsize::new(0));
    let restored = Arc::new(AtomicUsize::new(0));
    let (l, r) = (Arc::clone(&lost), Arc::clone(&restored));
    let monitor = HeartbeatMonitor::spawn(
        &endpoint,
        interval,
        3,
        move || {
            l.fetch_add(1, Ordering::SeqCst);
        },
        move || {
            r.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    eventually(|| monitor.beats() >= 2);
    assert!(monitor.is_alive());

    beat.stop();
    drop(beat);
    eventually(|| lost.load(Ordering::SeqCst) == 1);
    assert!(!monitor.is_alive());
    assert_eq!(restored.load(Ordering::SeqCst), 0);

    let _beat = HeartbeatPublisher::spawn(&endpoint, interval).unwrap();
    eventually(|| restored.load(Ordering::SeqCst) == 1);
    assert!(monitor.is_alive());
}
