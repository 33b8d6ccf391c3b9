//! Client lifecycle against the in-memory broker
//!
//! Connect, negotiate, heartbeat, publish gating, subscription replay and
//! reconnection, all driven tick by tick on a simulated clock.

use homenode::backoff::{Backoff, BackoffConfig};
use homenode::client::{
    Client, ClientConfig, ConnectionState, NegotiationState, PublishError, ServerConfig,
};
use homenode::platform::{CounterStore, Platform};
use homenode::protocol::{DeviceIdentity, MacAddress, Message};
use homenode::testing::{
    catch_restart, MemoryStore, MockBroker, MockPlatform, MockTransport, RecordingRetryPolicy,
};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

const MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const CLIENT_ID: &str = "dev1-02:00:00:00:00:01";
const TICK_MS: u64 = 50;

type TestClient = Client<MockTransport, RecordingRetryPolicy, MockPlatform>;

fn negotiating_config() -> ClientConfig {
    ClientConfig::new(vec![ServerConfig::new("broker", 1883)])
        .with_topics(Some("ava"), Some("status"))
}

fn plain_config() -> ClientConfig {
    ClientConfig::new(vec![ServerConfig::new("broker", 1883)])
}

fn new_client(broker: &MockBroker, platform: &MockPlatform, config: ClientConfig) -> TestClient {
    Client::new(
        DeviceIdentity::new("dev1", MAC).unwrap(),
        config,
        broker.transport(),
        RecordingRetryPolicy::new(),
        platform.clone(),
    )
}

/// Tick every `TICK_MS` until the clock reaches `until_ms` (inclusive)
fn run_until(client: &mut TestClient, platform: &MockPlatform, until_ms: u64) {
    while platform.now_ms() < until_ms {
        platform.advance(TICK_MS.min(until_ms - platform.now_ms()));
        client.tick();
    }
}

fn status_payloads(broker: &MockBroker) -> Vec<Value> {
    broker
        .published_on("status")
        .iter()
        .map(|m| serde_json::from_slice(&m.payload).unwrap())
        .collect()
}

#[test]
fn test_no_competitor_scenario() {
    let broker = MockBroker::new();
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, negotiating_config());

    client.tick();
    assert_eq!(
        client.state(),
        ConnectionState::Negotiating(NegotiationState::Begin)
    );

    run_until(&mut client, &platform, 1_950);
    assert!(!client.is_initialized());
    assert!(broker.published().is_empty());

    run_until(&mut client, &platform, 2_000);
    assert!(client.is_initialized());
    assert_eq!(client.state(), ConnectionState::Active);

    let statuses = status_payloads(&broker);
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["restarted"], true);
    assert_eq!(statuses[0]["name"], "dev1");
    assert_eq!(statuses[0]["mac"], "02:00:00:00:00:01");
    assert_eq!(statuses[0]["uptime"], 2_000);
    assert_eq!(statuses[0]["ip"], "192.168.1.50");
    assert_eq!(statuses[0]["freeMemory"], 32_768);
    assert_eq!(statuses[0]["maxCycleTime"], 50);
    assert!(statuses[0]["avgCycleTime"].as_f64().unwrap() > 0.0);
    assert_eq!(broker.retained("ava").unwrap().payload_str(), Some("1"));

    run_until(&mut client, &platform, 61_950);
    assert_eq!(status_payloads(&broker).len(), 1);

    run_until(&mut client, &platform, 62_000);
    let statuses = status_payloads(&broker);
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[1]["restarted"], false);
    assert_eq!(statuses[1]["uptime"], 62_000);
    assert_eq!(client.next_heartbeat_ms(), 122_000);
}

#[test]
fn test_connecting_ticks_report_good_and_send_nothing() {
    let broker = MockBroker::new();
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, negotiating_config());

    run_until(&mut client, &platform, 1_000);

    assert!(client.retry_policy().good_count() > 0);
    assert_eq!(client.retry_policy().bad_count(), 0);
    assert!(broker.published_by(CLIENT_ID).is_empty());
}

#[test]
fn test_delayed_tick_sends_one_catch_up_heartbeat() {
    let broker = MockBroker::new();
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, negotiating_config());
    client.tick();
    run_until(&mut client, &platform, 2_000);
    assert_eq!(status_payloads(&broker).len(), 1);

    // stalled for three and a half intervals
    platform.set_time(62_000 + 210_000);
    client.tick();

    assert_eq!(status_payloads(&broker).len(), 2);
    assert_eq!(client.next_heartbeat_ms(), 302_000);

    platform.advance(TICK_MS);
    client.tick();
    assert_eq!(status_payloads(&broker).len(), 2);
}

#[test]
fn test_publish_is_gated_until_initialized() {
    let broker = MockBroker::new();
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, negotiating_config());

    assert!(matches!(
        client.publish("home/dev1/temp", "21.5", false),
        Err(PublishError::NotInitialized)
    ));

    client.tick();
    assert!(matches!(
        client.publish("home/dev1/temp", "21.5", false),
        Err(PublishError::NotInitialized)
    ));
    assert!(broker.published_on("home/dev1/temp").is_empty());

    run_until(&mut client, &platform, 2_000);
    client.publish("home/dev1/temp", "21.5", false).unwrap();
    assert_eq!(broker.published_on("home/dev1/temp").len(), 1);
}

#[test]
fn test_publish_failure_is_reported_not_fatal() {
    let broker = MockBroker::new();
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, plain_config());
    client.tick();

    broker.set_failing_publishes(true);
    assert!(matches!(
        client.publish("home/dev1/temp", "21.5", false),
        Err(PublishError::Transport(_))
    ));

    run_until(&mut client, &platform, 120_000);
    assert_eq!(client.state(), ConnectionState::Active);
}

#[test]
fn test_subscriptions_dispatch_and_replay() {
    let broker = MockBroker::new();
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, plain_config());

    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    client.subscribe("home/dev1/set", move |message: &Message| {
        sink.borrow_mut()
            .push(message.payload_str().unwrap_or_default().to_string());
    });
    client.subscribe("home/dev1/mode", |_: &Message| {});

    client.tick();
    assert_eq!(
        broker.subscriptions(CLIENT_ID),
        vec!["home/dev1/set".to_string(), "home/dev1/mode".to_string()]
    );

    broker.publish_external(Message::new("home/dev1/set", "on", false));
    platform.advance(TICK_MS);
    client.tick();
    assert_eq!(*received.borrow(), vec!["on".to_string()]);

    client.unsubscribe("home/dev1/set");
    assert_eq!(
        broker.subscriptions(CLIENT_ID),
        vec!["home/dev1/mode".to_string()]
    );

    broker.drop_connection(CLIENT_ID);
    platform.advance(TICK_MS);
    client.tick();

    assert!(client.is_initialized());
    assert_eq!(
        broker.subscriptions(CLIENT_ID),
        vec!["home/dev1/mode".to_string()]
    );
}

#[test]
fn test_subscribe_while_connected_subscribes_immediately() {
    let broker = MockBroker::new();
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, plain_config());
    client.tick();

    client.subscribe("home/dev1/set", |_: &Message| {});

    assert_eq!(
        broker.subscriptions(CLIENT_ID),
        vec!["home/dev1/set".to_string()]
    );
}

#[test]
fn test_connection_failure_waits_for_retry_schedule() {
    let broker = MockBroker::new();
    broker.refuse_host("broker");
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, plain_config());

    client.tick();
    assert_eq!(client.retry_policy().bad_count(), 1);
    assert_eq!(
        client.state(),
        ConnectionState::Disconnected {
            next_attempt_ms: 1_000
        }
    );

    run_until(&mut client, &platform, 950);
    assert_eq!(broker.connect_attempts().len(), 1);

    broker.accept_host("broker");
    run_until(&mut client, &platform, 1_000);
    assert_eq!(broker.connect_attempts().len(), 2);
    assert_eq!(client.state(), ConnectionState::Active);
}

#[test]
fn test_retry_delay_grows_then_resets_after_success() {
    let broker = MockBroker::new();
    broker.refuse_host("broker");
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, plain_config());

    client.tick();
    run_until(&mut client, &platform, 1_000);
    assert_eq!(
        client.state(),
        ConnectionState::Disconnected {
            next_attempt_ms: 3_000
        }
    );

    broker.accept_host("broker");
    run_until(&mut client, &platform, 3_000);
    assert!(client.is_initialized());

    broker.refuse_host("broker");
    broker.drop_connection(CLIENT_ID);
    platform.advance(TICK_MS);
    client.tick();
    assert_eq!(
        client.state(),
        ConnectionState::Disconnected {
            next_attempt_ms: 3_050 + 1_000
        }
    );
}

#[test]
fn test_reconnect_hook_and_restarted_flag_after_connection_loss() {
    let broker = MockBroker::new();
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, negotiating_config());

    let reconnects = Rc::new(RefCell::new(0));
    let counter = reconnects.clone();
    client.on_reconnect(move || *counter.borrow_mut() += 1);

    client.tick();
    run_until(&mut client, &platform, 2_000);
    assert_eq!(*reconnects.borrow(), 1);

    broker.drop_connection(CLIENT_ID);
    assert_eq!(broker.retained("ava").unwrap().payload_str(), Some("0"));

    // the retained will is our own "0": the name is claimed on the reconnect tick
    run_until(&mut client, &platform, 2_050);
    assert!(client.is_initialized());
    assert_eq!(*reconnects.borrow(), 2);
    let statuses = status_payloads(&broker);
    assert_eq!(statuses.last().unwrap()["restarted"], true);
    assert_eq!(broker.retained("ava").unwrap().payload_str(), Some("1"));
}

#[test]
fn test_persistent_connection_failure_escalates_to_restart() {
    let broker = MockBroker::new();
    broker.refuse_host("broker");
    let platform = MockPlatform::new();
    let store = MemoryStore::new();
    let backoff = Backoff::new(
        "connection",
        BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 8_000,
        },
        platform.clone(),
        store.clone(),
    );
    let mut client = Client::new(
        DeviceIdentity::new("dev1", MAC).unwrap(),
        plain_config(),
        broker.transport(),
        backoff,
        platform.clone(),
    );

    client.tick();
    platform.set_time(999);
    client.tick();
    assert_eq!(broker.connect_attempts().len(), 1);

    platform.set_time(1_000);
    let restart = catch_restart(|| client.tick()).unwrap_err();

    assert_eq!(restart.at_ms, 1_000);
    assert_eq!(platform.restarts(), 1);
    assert_eq!(store.read("connection.delay"), Some(2_000));
}

#[test]
fn test_shutdown_withdraws_availability() {
    let broker = MockBroker::new();
    let platform = MockPlatform::new();
    let mut client = new_client(&broker, &platform, negotiating_config());
    client.tick();
    run_until(&mut client, &platform, 2_000);

    client.shutdown();

    assert!(!broker.is_connected(CLIENT_ID));
    assert_eq!(broker.retained("ava").unwrap().payload_str(), Some("0"));
    assert!(matches!(
        client.state(),
        ConnectionState::Disconnected { .. }
    ));
}
