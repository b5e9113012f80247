//! MQTT transport behaviour tests
//!
//! Drive `MqttTransport` against the scripted client and check the packets
//! it produces and the callbacks it fires: CONNECT identity, subscriptions,
//! twin and method topics, telemetry acknowledgment and resend, module input
//! queues, SAS refresh and teardown.


use iothub_transport::auth::{CredentialType, SasTokenStatus};
use iothub_transport::callbacks::{
    ConnectionStatus, ConnectionStatusReason, MethodHandle, TwinUpdateState,
};
use iothub_transport::error::TransportError;
use iothub_transport::device::DeviceConfig;
use iothub_transport::message::{
    ConfirmationResult, Message, MessageDisposition, OutboundMessage, OutboundQueue,
};
use iothub_transport::options::TransportOption;
use iothub_transport::retry::RetryPolicy;
use iothub_transport::sas::{token_expiry, SasTokenAuthorization, SharedAccessKeyAuthorization};
use iothub_transport::testing::MockAuthorization;
use iothub_transport::transport::mqtt::connection::{
    DESIRED_PROPERTIES_TOPIC, METHOD_SUBSCRIBE_TOPIC, TWIN_RESPONSE_TOPIC,
};
use iothub_transport::transport::mqtt::{
    ClientStatus, ConnackCode, MqttClientError, MqttEvent, PacketState,
};
use iothub_transport::transport::{ProcessItemResult, SendStatus, TransportConfig, TwinReport};
use rumqttc::QoS;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::*;

const AUTHENTICATED: (ConnectionStatus, ConnectionStatusReason) =
    (ConnectionStatus::Authenticated, ConnectionStatusReason::Ok);

fn key_config() -> TransportConfig {
    TransportConfig::new(HUB, SUFFIX, "d1").with_device_key("a2V5")
}

/// Harness with the device registered
fn registered() -> MqttHarness {
    let mut harness = MqttHarness::new();
    harness.register(&key_config());
    harness
}

#[test]
fn test_nothing_happens_before_register() {
    let mut harness = MqttHarness::new();

    harness.tick(3);

    assert_eq!(harness.client.connect_count(), 0);
    assert_eq!(harness.transport.client_status(), ClientStatus::NotConnected);
}

#[test]
fn test_connect_identity_for_device_key() {
    // Arrange
    let mut harness = registered();

    // Act
    harness.tick(1);

    // Assert
    let connect = harness.client.log().connects[0].clone();
    assert_eq!(connect.hostname, HOSTNAME);
    assert_eq!(connect.port, 8883);
    assert_eq!(connect.client_id, "d1");
    assert!(connect.username.starts_with(
        "myhub.azure-devices.net/d1/?api-version=2017-11-08-preview&DeviceClientType="
    ));
    assert_eq!(
        connect.password.as_deref(),
        Some("SharedAccessSignature sr=myhub.azure-devices.net/devices/d1&sig=mock&se=3600")
    );
    assert_eq!(connect.keep_alive_secs, 240);
    assert!(!connect.clean_session);
    assert_eq!(
        harness.auth.requested_scopes(),
        vec![Some("myhub.azure-devices.net/devices/d1".to_string())]
    );
    assert_eq!(harness.transport.client_status(), ClientStatus::Connected);
    assert_eq!(harness.transport.packet_state(), PacketState::Connack);
    assert_eq!(harness.callbacks.statuses(), vec![AUTHENTICATED]);
}

#[test]
fn test_x509_connects_without_password() {
    let config = TransportConfig::new(HUB, SUFFIX, "d1");
    let mut harness = MqttHarness::for_config(config.clone());
    harness.register(&config);

    harness.tick(1);

    assert_eq!(harness.client.log().connects[0].password, None);
    assert!(harness.auth.requested_scopes().is_empty());
}

#[test]
fn test_module_identity_strings() {
    let config = key_config().with_module("m1");
    let mut harness = MqttHarness::for_config(config.clone());
    harness.register(&config);

    harness.tick(1);

    let connect = harness.client.log().connects[0].clone();
    assert_eq!(connect.client_id, "d1/m1");
    assert!(connect.username.starts_with("myhub.azure-devices.net/d1/m1/?api-version="));
    assert_eq!(
        harness.auth.requested_scopes(),
        vec![Some("myhub.azure-devices.net/devices/d1/modules/m1".to_string())]
    );
}

#[test]
fn test_expired_sas_token_is_reported_and_not_sent() {
    let mut config = TransportConfig::new(HUB, SUFFIX, "d1");
    config.device_sas_token = Some("SharedAccessSignature sr=x&se=1".to_string());
    let auth = MockAuthorization::new(CredentialType::SasToken);
    auth.set_token_status(SasTokenStatus::Invalid);
    let mut harness = MqttHarness::with_auth(config.clone(), auth);
    harness.register(&config);

    harness.tick(1);

    assert_eq!(harness.client.connect_count(), 0);
    assert_eq!(harness.transport.connect_fail_count(), 1);
    assert_eq!(
        harness.callbacks.statuses(),
        vec![(
            ConnectionStatus::Unauthenticated,
            ConnectionStatusReason::ExpiredSasToken
        )]
    );
}

#[test]
fn test_device_key_signs_a_fresh_token() {
    // Arrange
    let mut harness = MqttHarness::new();
    let device = DeviceConfig::new("d1", Arc::new(SharedAccessKeyAuthorization::new("a2V5")))
        .with_device_key("a2V5");
    harness
        .transport
        .register(device, OutboundQueue::new())
        .unwrap();

    // Act
    harness.tick(1);

    // Assert
    let password = harness.client.log().connects[0]
        .password
        .clone()
        .expect("password");
    assert!(password
        .starts_with("SharedAccessSignature sr=myhub.azure-devices.net%2Fdevices%2Fd1&sig="));
    let expiry = token_expiry(&password).expect("se field");
    assert!(expiry > chrono::Utc::now() + chrono::Duration::minutes(59));
    assert_eq!(harness.callbacks.statuses(), vec![AUTHENTICATED]);
}

#[test]
fn test_expired_user_token_never_reaches_the_client() {
    let token = "SharedAccessSignature sr=myhub.azure-devices.net%2Fdevices%2Fd1&sig=x&se=1";
    let mut config = TransportConfig::new(HUB, SUFFIX, "d1");
    config.device_sas_token = Some(token.to_string());
    let mut harness = MqttHarness::for_config(config);
    let device =
        DeviceConfig::new("d1", Arc::new(SasTokenAuthorization::new(token))).with_sas_token(token);
    harness
        .transport
        .register(device, OutboundQueue::new())
        .unwrap();

    harness.tick(1);

    assert_eq!(harness.client.connect_count(), 0);
    assert_eq!(
        harness.callbacks.statuses(),
        vec![(
            ConnectionStatus::Unauthenticated,
            ConnectionStatusReason::ExpiredSasToken
        )]
    );
}

#[test]
fn test_register_rejects_mismatched_identity() {
    let mut harness = MqttHarness::new();

    let wrong_device = harness
        .transport
        .register(key_device("d2"), OutboundQueue::new());
    let wrong_key = harness.transport.register(
        DeviceConfig::new(
            "d1",
            Arc::new(MockAuthorization::new(CredentialType::DeviceKey)),
        )
        .with_device_key("b3RoZXI="),
        OutboundQueue::new(),
    );

    assert!(wrong_device.is_err_and(|e| e.is_invalid_argument()));
    assert!(wrong_key.is_err_and(|e| e.is_invalid_argument()));
    assert!(!harness.transport.is_registered());
}

#[test]
fn test_pending_topics_share_one_subscribe() {
    // Arrange
    let mut harness = registered();
    let handle = harness.handle();
    harness.transport.subscribe(handle).unwrap();
    harness.transport.subscribe_device_twin(handle).unwrap();
    harness.transport.subscribe_device_method(handle).unwrap();

    // Act
    harness.tick(2);

    // Assert
    let subscribes = harness.client.log().subscribes.clone();
    assert_eq!(subscribes.len(), 1);
    assert_eq!(subscribes[0].0, 1);
    assert_eq!(
        subscribes[0].1,
        vec![
            ("devices/d1/messages/devicebound/#".to_string(), QoS::AtLeastOnce),
            (TWIN_RESPONSE_TOPIC.to_string(), QoS::AtMostOnce),
            (METHOD_SUBSCRIBE_TOPIC.to_string(), QoS::AtMostOnce),
        ]
    );
    assert_eq!(harness.transport.packet_state(), PacketState::Suback);
}

#[test]
fn test_no_subscriptions_go_straight_to_publish() {
    let mut harness = registered();

    harness.tick(2);

    assert!(harness.client.log().subscribes.is_empty());
    assert_eq!(harness.transport.packet_state(), PacketState::Publish);
}

#[test]
fn test_twin_get_follows_suback_and_response_subscribes_desired() {
    // Arrange
    let mut harness = registered();
    harness
        .transport
        .subscribe_device_twin(harness.handle())
        .unwrap();

    // Act: CONNECT, SUBSCRIBE, then the full twin get
    harness.tick(3);

    // Assert
    assert_eq!(
        harness.client.published_topics("$iothub/twin/GET"),
        vec!["$iothub/twin/GET/?$rid=2".to_string()]
    );
    assert_eq!(harness.transport.packet_state(), PacketState::Publish);

    // Act: the hub answers
    harness
        .client
        .receive("$iothub/twin/res/200/?$rid=2", b"{\"desired\":{}}", QoS::AtMostOnce, 0);
    harness.tick(1);

    // Assert
    assert_eq!(
        harness.callbacks.twin_updates(),
        vec![(TwinUpdateState::Complete, b"{\"desired\":{}}".to_vec())]
    );
    harness.tick(1);
    let subscribes = harness.client.log().subscribes.clone();
    assert_eq!(subscribes.len(), 2);
    assert_eq!(
        subscribes[1].1,
        vec![(DESIRED_PROPERTIES_TOPIC.to_string(), QoS::AtMostOnce)]
    );
}

#[test]
fn test_desired_patch_is_partial_and_auto_acked() {
    let mut harness = registered();
    harness
        .transport
        .subscribe_device_twin(harness.handle())
        .unwrap();
    harness.tick(3);

    harness.client.receive(
        "$iothub/twin/PATCH/properties/desired/?$version=4",
        b"{\"rate\":5}",
        QoS::AtLeastOnce,
        41,
    );
    harness.tick(1);

    assert_eq!(
        harness.callbacks.twin_updates(),
        vec![(TwinUpdateState::Partial, b"{\"rate\":5}".to_vec())]
    );
    assert_eq!(harness.client.log().acks, vec![(41, QoS::AtLeastOnce)]);
}

#[test]
fn test_on_demand_twin_get_and_timeout() {
    // Arrange
    let mut harness = registered();
    let handle = harness.handle();
    harness.transport.subscribe_device_twin(handle).unwrap();
    let answers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&answers);
    harness
        .transport
        .get_twin_async(
            handle,
            Box::new(move |state, payload| {
                sink.lock()
                    .unwrap()
                    .push((state, payload.map(<[u8]>::to_vec)));
            }),
        )
        .unwrap();

    // Act: sent once publishing starts
    harness.tick(4);

    // Assert
    assert_eq!(
        harness.client.published_topics("$iothub/twin/GET"),
        vec![
            "$iothub/twin/GET/?$rid=2".to_string(),
            "$iothub/twin/GET/?$rid=3".to_string()
        ]
    );
    assert!(answers.lock().unwrap().is_empty());

    // Act: no answer within the get timeout
    harness.clock.advance(Duration::from_secs(61));
    harness.tick(1);

    // Assert
    assert_eq!(
        *answers.lock().unwrap(),
        vec![(TwinUpdateState::Complete, None)]
    );
}

#[test]
fn test_reported_properties_follow_process_item_states() {
    // Arrange
    let mut harness = registered();
    let handle = harness.handle();
    harness.transport.subscribe_device_twin(handle).unwrap();

    // Act / Assert: not connected yet
    assert_eq!(
        harness
            .transport
            .process_item(handle, TwinReport::new(1, &b"{}"[..])),
        ProcessItemResult::NotConnected
    );
    harness.tick(2);
    assert_eq!(
        harness
            .transport
            .process_item(handle, TwinReport::new(1, &b"{}"[..])),
        ProcessItemResult::NotConnected
    );
    harness.tick(1);

    // Act
    let result = harness
        .transport
        .process_item(handle, TwinReport::new(9, &b"{\"fw\":2}"[..]));

    // Assert
    assert_eq!(result, ProcessItemResult::Ok);
    let reported = harness
        .client
        .published_topics("$iothub/twin/PATCH/properties/reported/");
    assert_eq!(
        reported,
        vec!["$iothub/twin/PATCH/properties/reported/?$rid=3".to_string()]
    );

    // Act: the hub acknowledges the patch
    harness
        .client
        .receive("$iothub/twin/res/204/?$rid=3", b"", QoS::AtMostOnce, 0);
    harness.tick(1);

    // Assert
    assert_eq!(harness.callbacks.reported(), vec![(9, 204)]);
}

#[test]
fn test_process_item_waits_for_twin_suback() {
    let mut harness = registered();
    let handle = harness.handle();
    harness.tick(2);

    let result = harness
        .transport
        .process_item(handle, TwinReport::new(1, &b"{}"[..]));

    assert_eq!(harness.transport.packet_state(), PacketState::Publish);
    assert_eq!(result, ProcessItemResult::Continue);
}

#[test]
fn test_unanswered_report_completes_with_408() {
    let mut harness = registered();
    let handle = harness.handle();
    harness.transport.subscribe_device_twin(handle).unwrap();
    harness.tick(3);
    harness
        .transport
        .process_item(handle, TwinReport::new(5, &b"{}"[..]));

    harness.clock.advance(Duration::from_secs(301));
    harness.tick(1);

    assert_eq!(harness.callbacks.reported(), vec![(5, 408)]);
}

#[test]
fn test_telemetry_publish_and_puback() {
    // Arrange
    let mut harness = registered();
    let mut message = Message::from_string("{\"t\":21}");
    message.set_property("alert", "true").unwrap();
    message.properties_mut().message_id = Some("m-1".to_string());
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    harness
        .queue
        .push(OutboundMessage::with_callback(message, move |result| {
            sink.lock().unwrap().push(result);
        }));

    // Act
    harness.tick(3);

    // Assert
    let publishes = harness.client.publishes();
    assert_eq!(publishes.len(), 1);
    let (packet_id, topic, qos, body) = publishes[0].clone();
    assert_eq!(packet_id, 1);
    assert_eq!(topic, "devices/d1/messages/events/alert=true&%24.mid=m-1");
    assert_eq!(qos, QoS::AtLeastOnce);
    assert_eq!(body, b"{\"t\":21}".to_vec());
    assert_eq!(*results.lock().unwrap(), vec![ConfirmationResult::Ok]);
    assert_eq!(
        harness.transport.send_status(harness.handle()).unwrap(),
        SendStatus::Idle
    );
}

#[test]
fn test_telemetry_resend_then_timeout_resets_connection() {
    // Arrange
    let mut harness = registered();
    harness.client.set_auto_puback(false);
    let (message, results) = tracked_message("slow");
    harness.queue.push(message);
    harness.tick(3);
    assert_eq!(
        harness.transport.send_status(harness.handle()).unwrap(),
        SendStatus::Busy
    );

    // Act: first window passes, the message is republished
    harness.clock.advance(Duration::from_secs(61));
    harness.tick(1);

    // Assert
    let topics = harness.client.published_topics("devices/d1/messages/events/");
    assert_eq!(topics.len(), 2);
    assert!(results.lock().unwrap().is_empty());

    // Act: second window passes, attempts are exhausted
    harness.clock.advance(Duration::from_secs(61));
    harness.tick(1);

    // Assert
    assert_eq!(
        *results.lock().unwrap(),
        vec![ConfirmationResult::MessageTimeout]
    );
    assert_eq!(harness.client.log().disconnects, 1);
    assert_eq!(harness.transport.client_status(), ClientStatus::NotConnected);
}

#[test]
fn test_failed_publish_completes_with_error_and_keeps_draining() {
    let mut harness = registered();
    harness.tick(2);
    harness.client.fail_publish(true);
    let (first, first_results) = tracked_message("first");
    let (second, second_results) = tracked_message("second");
    harness.queue.push(first);
    harness.queue.push(second);

    harness.tick(1);

    assert_eq!(*first_results.lock().unwrap(), vec![ConfirmationResult::Error]);
    assert_eq!(*second_results.lock().unwrap(), vec![ConfirmationResult::Error]);
    assert!(harness.queue.is_empty());
}

#[test]
fn test_refused_credentials_are_unrecoverable() {
    // Arrange
    let mut harness = registered();
    harness
        .client
        .set_connack(Some(ConnackCode::BadUsernamePassword));

    // Act
    harness.tick(3);

    // Assert
    assert_eq!(
        harness.callbacks.statuses(),
        vec![(
            ConnectionStatus::Unauthenticated,
            ConnectionStatusReason::BadCredential
        )]
    );
    assert_eq!(harness.client.connect_count(), 1);
    assert_eq!(harness.client.log().disconnects, 1);
    assert_eq!(harness.transport.client_status(), ClientStatus::NotConnected);
}

#[test]
fn test_server_unavailable_retries() {
    let mut harness = registered();
    harness
        .transport
        .set_retry_policy(RetryPolicy::Immediate, 0)
        .unwrap();
    harness
        .client
        .set_connack(Some(ConnackCode::ServerUnavailable));

    harness.tick(2);
    harness.client.set_connack(Some(ConnackCode::Accepted));
    harness.tick(1);

    assert_eq!(harness.client.connect_count(), 2);
    assert_eq!(
        harness.callbacks.statuses(),
        vec![
            (
                ConnectionStatus::Unauthenticated,
                ConnectionStatusReason::DeviceDisabled
            ),
            AUTHENTICATED,
        ]
    );
}

#[test]
fn test_client_error_reconnects_and_resubscribes() {
    // Arrange
    let mut harness = registered();
    harness.transport.subscribe(harness.handle()).unwrap();
    harness.tick(3);

    // Act
    harness
        .client
        .push_event(MqttEvent::Error(MqttClientError::ConnectionError));
    harness.tick(1);
    assert_eq!(
        harness.callbacks.statuses().last().copied(),
        Some((
            ConnectionStatus::Unauthenticated,
            ConnectionStatusReason::NoNetwork
        ))
    );
    harness.tick(3);

    // Assert
    assert_eq!(harness.client.connect_count(), 2);
    let subscribes = harness.client.log().subscribes.clone();
    assert_eq!(subscribes.len(), 2);
    assert_eq!(subscribes[1].1, subscribes[0].1);
}

#[test]
fn test_retry_policy_none_reports_expiry_once() {
    let mut harness = registered();
    harness.transport.set_retry_policy(RetryPolicy::None, 0).unwrap();

    harness.tick(3);

    assert_eq!(harness.client.connect_count(), 0);
    assert_eq!(
        harness.callbacks.statuses(),
        vec![(
            ConnectionStatus::Unauthenticated,
            ConnectionStatusReason::RetryExpired
        )]
    );
}

#[test]
fn test_cloud_message_properties_and_disposition() {
    // Arrange
    let mut harness = registered();
    let handle = harness.handle();
    harness.transport.subscribe(handle).unwrap();
    harness.tick(3);

    // Act
    harness.client.receive(
        "devices/d1/messages/devicebound/%24.mid=m1&%24.cid=c1&color=red",
        b"hello",
        QoS::AtLeastOnce,
        17,
    );
    harness.tick(1);

    // Assert
    let mut messages = harness.callbacks.take_messages();
    assert_eq!(messages.len(), 1);
    let message = messages.remove(0);
    assert_eq!(message.body().as_ref(), b"hello");
    assert_eq!(message.properties().message_id.as_deref(), Some("m1"));
    assert_eq!(message.properties().correlation_id.as_deref(), Some("c1"));
    assert_eq!(message.property("color"), Some("red"));
    assert!(harness.client.log().acks.is_empty());

    // Act
    harness
        .transport
        .send_message_disposition(handle, message, MessageDisposition::Accepted)
        .unwrap();

    // Assert
    assert_eq!(harness.client.log().acks, vec![(17, QoS::AtLeastOnce)]);
}

#[test]
fn test_abandoned_message_sends_no_puback() {
    let mut harness = registered();
    let handle = harness.handle();
    harness.transport.subscribe(handle).unwrap();
    harness.tick(3);
    harness.client.receive(
        "devices/d1/messages/devicebound/",
        b"x",
        QoS::AtLeastOnce,
        3,
    );
    harness.tick(1);
    let message = harness.callbacks.take_messages().remove(0);

    harness
        .transport
        .send_message_disposition(handle, message, MessageDisposition::Abandoned)
        .unwrap();

    assert!(harness.client.log().acks.is_empty());
}

#[test]
fn test_method_request_and_response_topic() {
    // Arrange
    let mut harness = registered();
    let handle = harness.handle();
    harness.transport.subscribe_device_method(handle).unwrap();
    harness.tick(3);

    // Act
    harness.client.receive(
        "$iothub/methods/POST/reboot/?$rid=abc",
        b"{\"delay\":1}",
        QoS::AtMostOnce,
        0,
    );
    harness.tick(1);
    harness
        .transport
        .device_method_response(handle, &MethodHandle::new("abc"), b"{\"ok\":1}", 200)
        .unwrap();

    // Assert
    assert_eq!(harness.callbacks.method_names(), vec!["reboot".to_string()]);
    let responses = harness.client.published_topics("$iothub/methods/res/");
    assert_eq!(responses, vec!["$iothub/methods/res/200/?$rid=abc".to_string()]);
    let (_, _, qos, body) = harness.client.publishes().last().cloned().unwrap();
    assert_eq!(qos, QoS::AtMostOnce);
    assert_eq!(body, b"{\"ok\":1}".to_vec());
}

#[test]
fn test_unsubscribe_method_sends_unsubscribe() {
    let mut harness = registered();
    let handle = harness.handle();
    harness.transport.subscribe_device_method(handle).unwrap();
    harness.tick(3);

    harness.transport.unsubscribe_device_method(handle);

    let unsubscribes = harness.client.log().unsubscribes.clone();
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(unsubscribes[0].1, vec![METHOD_SUBSCRIBE_TOPIC.to_string()]);
}

#[test]
fn test_module_input_queue() {
    // Arrange
    let config = key_config().with_module("m1");
    let mut harness = MqttHarness::for_config(config.clone());
    let handle = harness.register(&config);
    harness.transport.subscribe_input_queue(handle).unwrap();
    harness.tick(3);

    // Act
    harness.client.receive(
        "devices/d1/modules/m1/inputs/input1/%24.mid=x1",
        b"payload",
        QoS::AtLeastOnce,
        8,
    );
    harness.tick(1);

    // Assert
    let subscribes = harness.client.log().subscribes.clone();
    assert_eq!(
        subscribes[0].1,
        vec![("devices/d1/modules/m1/#".to_string(), QoS::AtMostOnce)]
    );
    let inputs = harness.callbacks.take_input_messages();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].properties().input_name.as_deref(), Some("input1"));
    assert_eq!(inputs[0].properties().message_id.as_deref(), Some("x1"));
    assert!(harness.callbacks.take_messages().is_empty());
}

#[test]
fn test_input_queue_requires_module() {
    let mut harness = registered();

    let result = harness.transport.subscribe_input_queue(harness.handle());

    assert!(matches!(result, Err(TransportError::InvalidArgument { .. })));
    assert!(harness.transport.subscriptions().pending().is_empty());
}

#[test]
fn test_sas_token_refresh_reconnects() {
    // Arrange
    let mut harness = registered();
    harness.tick(1);

    // Act: past 80% of the token lifetime
    harness.clock.advance(Duration::from_secs(2881));
    harness.tick(1);

    // Assert
    assert_eq!(harness.transport.client_status(), ClientStatus::NotConnected);
    assert_eq!(
        harness.callbacks.statuses()[1],
        (
            ConnectionStatus::Unauthenticated,
            ConnectionStatusReason::ExpiredSasToken
        )
    );

    // Act
    harness.tick(1);

    // Assert
    assert_eq!(harness.client.connect_count(), 2);
    assert_eq!(harness.callbacks.statuses().last().copied(), Some(AUTHENTICATED));
}

#[test]
fn test_x509_option_rejected_for_key_device() {
    let mut harness = registered();

    let result = harness.transport.set_option(
        TransportOption::X509Certificate("pem".into()),
    );

    assert!(result.is_err_and(|e| e.is_invalid_argument()));
}

#[test]
fn test_keep_alive_change_forces_reconnect_with_new_value() {
    let mut harness = registered();
    harness.tick(2);

    harness
        .transport
        .set_option(TransportOption::KeepAliveSecs(60))
        .unwrap();
    harness.tick(1);

    assert_eq!(harness.client.log().disconnects, 1);
    assert_eq!(harness.client.connect_count(), 2);
    assert_eq!(harness.client.log().connects[1].keep_alive_secs, 60);
}

#[test]
fn test_unregister_settles_queue_and_disconnects() {
    let mut harness = registered();
    let handle = harness.handle();
    harness.tick(2);
    let (message, results) = tracked_message("late");
    harness.queue.push(message);

    harness.transport.unregister(handle);

    assert_eq!(*results.lock().unwrap(), vec![ConfirmationResult::BecauseDestroy]);
    assert_eq!(harness.client.log().disconnects, 1);
    assert!(!harness.transport.is_registered());
}

#[test]
fn test_destroy_completes_everything() {
    // Arrange
    let mut harness = registered();
    let handle = harness.handle();
    harness.client.set_auto_puback(false);
    let (in_flight, in_flight_results) = tracked_message("in flight");
    harness.queue.push(in_flight);
    harness.tick(3);
    let (waiting, waiting_results) = tracked_message("waiting");
    harness.queue.push(waiting);
    let twin_answer = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&twin_answer);
    harness
        .transport
        .get_twin_async(
            handle,
            Box::new(move |state, payload| {
                *sink.lock().unwrap() = Some((state, payload.is_none()));
            }),
        )
        .unwrap();

    // Act
    harness.transport.destroy();

    // Assert
    assert_eq!(
        *in_flight_results.lock().unwrap(),
        vec![ConfirmationResult::BecauseDestroy]
    );
    assert_eq!(
        *waiting_results.lock().unwrap(),
        vec![ConfirmationResult::BecauseDestroy]
    );
    assert_eq!(
        *twin_answer.lock().unwrap(),
        Some((TwinUpdateState::Complete, true))
    );
    assert_eq!(harness.client.log().disconnects, 1);
}
