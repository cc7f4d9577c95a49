//! Client-core behavior driven through a scripted transport: queueing,
//! confirmation ordering, timeouts, subscriptions and the twin queue.

use std::cell::RefCell;
use std::rc::Rc;

use hublink::tick::ManualClock;
use hublink::transport::{
    MethodId, OptionResult, ProcessItemStatus, SendConfirmationCallback, TwinUpdateKind,
};
use hublink::{
    ClientError, ClientOption, ConfirmationStatus, ConnectionStatus, ConnectionStatusReason,
    Credentials, DeviceClient, DeviceConfig, Disposition, Message, MessageInfo, RetryPolicy,
    SendStatus,
};

mod common;
use common::MockTransport;

fn device_config(clock: Rc<ManualClock>) -> DeviceConfig {
    let mut config = DeviceConfig::new("d1", Credentials::DeviceKey("a2V5".into()));
    config.clock = Some(clock);
    config
}

fn client_on(mock: &Rc<RefCell<MockTransport>>, clock: Rc<ManualClock>) -> DeviceClient {
    DeviceClient::with_transport(mock.clone(), device_config(clock))
        .expect("client construction failed")
}

fn confirmation_recorder(
    order: &Rc<RefCell<Vec<(u32, ConfirmationStatus)>>>,
    tag: u32,
) -> SendConfirmationCallback {
    let order = order.clone();
    Box::new(move |status| order.borrow_mut().push((tag, status)))
}

#[test]
fn confirmations_fire_in_fifo_order() {
    common::init_logging();
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in 1..=3u32 {
        let message = Message::from_text(format!("payload {tag}"));
        client
            .send_event_async(&message, Some(confirmation_recorder(&order, tag)))
            .unwrap();
    }

    assert_eq!(SendStatus::Busy, client.send_status().unwrap());
    client.do_work();

    let order = order.borrow();
    assert_eq!(
        vec![
            (1, ConfirmationStatus::Ok),
            (2, ConfirmationStatus::Ok),
            (3, ConfirmationStatus::Ok),
        ],
        *order
    );
    assert_eq!(SendStatus::Idle, client.send_status().unwrap());
}

#[test]
fn destroy_drains_queued_messages_exactly_once() {
    common::init_logging();
    let mock = MockTransport::new();
    mock.borrow_mut().complete_sends = false;
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in 1..=2u32 {
        client
            .send_event_async(
                &Message::from_text("queued"),
                Some(confirmation_recorder(&order, tag)),
            )
            .unwrap();
    }
    // A message without a callback is dropped silently on destroy.
    client
        .send_event_async(&Message::from_text("silent"), None)
        .unwrap();

    drop(client);

    assert_eq!(
        vec![
            (1, ConfirmationStatus::Destroyed),
            (2, ConfirmationStatus::Destroyed),
        ],
        *order.borrow()
    );
    assert!(mock.borrow().unregistered);
}

#[test]
fn per_message_timeout_fires_once_and_spares_earlier_messages() {
    common::init_logging();
    let mock = MockTransport::new();
    mock.borrow_mut().complete_sends = false;
    let clock = ManualClock::new(10);
    let mut client = client_on(&mock, clock.clone());

    let order = Rc::new(RefCell::new(Vec::new()));

    // Enqueued before the option takes effect: keeps timeout 0.
    client
        .send_event_async(
            &Message::from_text("untimed"),
            Some(confirmation_recorder(&order, 1)),
        )
        .unwrap();

    client.set_option(ClientOption::MessageTimeout(1)).unwrap();
    client
        .send_event_async(
            &Message::from_text("timed"),
            Some(confirmation_recorder(&order, 2)),
        )
        .unwrap();

    clock.set(12);
    client.do_work();

    assert_eq!(vec![(2, ConfirmationStatus::MessageTimeout)], *order.borrow());
    // The untimed message is still queued.
    assert_eq!(1, mock.borrow().devices[0].1.borrow().len());
}

#[test]
fn send_event_fails_when_the_tick_source_is_unavailable() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock.clone());

    clock.set_failing(true);
    let result = client.send_event_async(&Message::from_text("x"), None);
    assert!(matches!(result, Err(ClientError::IndefiniteTime)));
}

#[test]
fn message_callback_styles_are_mutually_exclusive() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    assert!(matches!(
        client.clear_message_callback(),
        Err(ClientError::Other(_))
    ));

    client
        .set_message_callback(|_| Disposition::Accepted)
        .unwrap();
    assert!(client.set_message_callback_ex(|_| {}).is_err());

    client.clear_message_callback().unwrap();
    client.set_message_callback_ex(|_| {}).unwrap();
    assert!(client
        .set_message_callback(|_| Disposition::Accepted)
        .is_err());

    // Only the first registration subscribes on the transport.
    assert_eq!(2, mock.borrow().subscribe_calls.len());
    assert_eq!(vec!["messages"], mock.borrow().unsubscribe_calls);
}

#[test]
fn method_callback_styles_are_mutually_exclusive() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    client
        .set_device_method_callback(|_, _| (200, Vec::new()))
        .unwrap();
    assert!(client.set_device_method_callback_ex(|_, _, _| {}).is_err());
    client.clear_device_method_callback().unwrap();
    assert!(matches!(
        client.clear_device_method_callback(),
        Err(ClientError::Other(_))
    ));
}

#[test]
fn sync_message_handler_disposition_reaches_the_transport() {
    common::init_logging();
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = seen.clone();
        client
            .set_message_callback(move |message| {
                seen.borrow_mut().push(message.binary().unwrap().to_vec());
                Disposition::Accepted
            })
            .unwrap();
    }

    mock.borrow_mut()
        .inbound_messages
        .push((Message::from_binary(b"hello".to_vec()), "tok-1".into()));
    client.do_work();

    assert_eq!(vec![b"hello".to_vec()], *seen.borrow());
    assert_eq!(
        vec![("tok-1".to_owned(), Disposition::Accepted)],
        mock.borrow().dispositions
    );
}

#[test]
fn deferred_message_disposition_is_sent_through_the_client() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    let taken: Rc<RefCell<Option<MessageInfo>>> = Rc::new(RefCell::new(None));
    {
        let taken = taken.clone();
        client
            .set_message_callback_ex(move |info| {
                *taken.borrow_mut() = Some(info);
            })
            .unwrap();
    }

    mock.borrow_mut()
        .inbound_messages
        .push((Message::from_text("deferred"), "tok-9".into()));
    client.do_work();

    assert!(mock.borrow().dispositions.is_empty());

    let info = taken.borrow_mut().take().expect("handler takes the message");
    assert_eq!("deferred", info.message().text().unwrap());
    client
        .send_message_disposition(info, Disposition::Rejected)
        .unwrap();

    assert_eq!(
        vec![("tok-9".to_owned(), Disposition::Rejected)],
        mock.borrow().dispositions
    );
}

#[test]
fn sync_method_handler_answers_inline() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    client
        .set_device_method_callback(|name, payload| {
            assert_eq!("reboot", name);
            assert_eq!(b"{}", payload);
            (200, b"done".to_vec())
        })
        .unwrap();

    mock.borrow_mut()
        .inbound_methods
        .push(("reboot".into(), b"{}".to_vec(), 7));
    client.do_work();

    assert_eq!(
        vec![(7u64, 200, b"done".to_vec())],
        mock.borrow().method_responses
    );
}

#[test]
fn deferred_method_response_routes_by_method_id() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    let pending: Rc<RefCell<Option<MethodId>>> = Rc::new(RefCell::new(None));
    {
        let pending = pending.clone();
        client
            .set_device_method_callback_ex(move |_, _, method| {
                *pending.borrow_mut() = Some(method);
            })
            .unwrap();
    }

    mock.borrow_mut()
        .inbound_methods
        .push(("restart".into(), Vec::new(), 42));
    client.do_work();
    assert!(mock.borrow().method_responses.is_empty());

    let method = pending.borrow_mut().take().expect("handler stored the id");
    client.device_method_response(method, 202, b"later").unwrap();
    assert_eq!(
        vec![(42u64, 202, b"later".to_vec())],
        mock.borrow().method_responses
    );
}

#[test]
fn reported_state_flows_through_the_twin_queue() {
    common::init_logging();
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    let statuses = Rc::new(RefCell::new(Vec::new()));
    {
        let statuses = statuses.clone();
        client
            .send_reported_state(
                br#"{"state":"ready"}"#,
                Some(Box::new(move |status| statuses.borrow_mut().push(status))),
            )
            .unwrap();
    }

    // The first reported-state update subscribes for twin traffic.
    assert_eq!(vec!["twin"], mock.borrow().subscribe_calls);

    // While the transport answers Continue the item stays queued.
    mock.borrow_mut().process_item_result = Some(ProcessItemStatus::Continue);
    client.do_work();
    assert!(mock.borrow().accepted_items.is_empty());

    mock.borrow_mut().process_item_result = Some(ProcessItemStatus::Ok);
    client.do_work();
    assert_eq!(vec![1], mock.borrow().accepted_items);
    assert!(statuses.borrow().is_empty());

    mock.borrow_mut().pending_acks.push((1, 204));
    client.do_work();
    assert_eq!(vec![204], *statuses.borrow());
}

#[test]
fn twin_acks_complete_in_acceptance_order() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    let statuses = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..2 {
        let statuses = statuses.clone();
        client
            .send_reported_state(
                b"{}",
                Some(Box::new(move |status| statuses.borrow_mut().push(status))),
            )
            .unwrap();
    }

    client.do_work();
    assert_eq!(vec![1, 2], mock.borrow().accepted_items);

    let mut borrowed = mock.borrow_mut();
    borrowed.pending_acks.push((1, 200));
    borrowed.pending_acks.push((2, 200));
    drop(borrowed);
    client.do_work();

    assert_eq!(vec![200, 200], *statuses.borrow());
}

#[test]
fn twin_updates_route_to_the_handler_and_oneshots() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    let updates = Rc::new(RefCell::new(Vec::new()));
    {
        let updates = updates.clone();
        client
            .set_device_twin_callback(move |kind, payload| {
                updates
                    .borrow_mut()
                    .push((kind, String::from_utf8(payload.to_vec()).unwrap()));
            })
            .unwrap();
    }

    let oneshot = Rc::new(RefCell::new(Vec::new()));
    {
        let oneshot = oneshot.clone();
        client
            .get_twin_async(move |kind, payload| {
                oneshot
                    .borrow_mut()
                    .push((kind, String::from_utf8(payload.to_vec()).unwrap()));
            })
            .unwrap();
    }
    assert_eq!(1, mock.borrow().twin_requests);

    let mut borrowed = mock.borrow_mut();
    borrowed
        .inbound_twins
        .push((TwinUpdateKind::Complete, br#"{"desired":{}}"#.to_vec()));
    borrowed
        .inbound_twins
        .push((TwinUpdateKind::Partial, br#"{"x":1}"#.to_vec()));
    drop(borrowed);
    client.do_work();

    // The full document answers the one-shot read; the patch goes to the
    // registered handler.
    assert_eq!(
        vec![(TwinUpdateKind::Complete, r#"{"desired":{}}"#.to_owned())],
        *oneshot.borrow()
    );
    assert_eq!(
        vec![(TwinUpdateKind::Partial, r#"{"x":1}"#.to_owned())],
        *updates.borrow()
    );
}

#[test]
fn twin_subscription_failure_propagates() {
    let mock = MockTransport::new();
    mock.borrow_mut().fail_subscribe = true;
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    assert!(client.set_device_twin_callback(|_, _| {}).is_err());
    assert!(client.send_reported_state(b"{}", None).is_err());
}

#[test]
fn connection_status_reaches_the_registered_handler() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    let statuses = Rc::new(RefCell::new(Vec::new()));
    {
        let statuses = statuses.clone();
        client.set_connection_status_callback(move |status, reason| {
            statuses.borrow_mut().push((status, reason));
        });
    }

    mock.borrow_mut().inbound_status.push((
        ConnectionStatus::Unauthenticated,
        ConnectionStatusReason::NoNetwork,
    ));
    client.do_work();

    assert_eq!(
        vec![(
            ConnectionStatus::Unauthenticated,
            ConnectionStatusReason::NoNetwork
        )],
        *statuses.borrow()
    );
}

#[test]
fn diagnostic_sampling_annotates_messages() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    assert!(matches!(
        client.set_option(ClientOption::DiagnosticSamplingPercentage(101)),
        Err(ClientError::Other(_))
    ));

    client
        .set_option(ClientOption::DiagnosticSamplingPercentage(100))
        .unwrap();
    client
        .send_event_async(&Message::from_text("sampled"), None)
        .unwrap();
    client.do_work();

    let mock = mock.borrow();
    assert_eq!(1, mock.completed_messages.len());
    assert!(mock.completed_messages[0].properties().get("diag-id").is_some());
    assert!(mock.completed_messages[0]
        .properties()
        .get("diag-creation-time-utc")
        .is_some());
}

#[test]
fn retry_policy_is_stored_and_forwarded() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    // Creation installs the default policy.
    assert_eq!(
        (RetryPolicy::ExponentialBackoffWithJitter, 0),
        client.retry_policy()
    );
    assert_eq!(
        vec![(RetryPolicy::ExponentialBackoffWithJitter, 0)],
        mock.borrow().retry_policies
    );

    client
        .set_retry_policy(RetryPolicy::LinearBackoff, 120)
        .unwrap();
    assert_eq!((RetryPolicy::LinearBackoff, 120), client.retry_policy());
    assert_eq!(2, mock.borrow().retry_policies.len());
}

#[test]
fn option_results_combine_across_transport_and_upload() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    // Recognized by the transport.
    client.set_option(ClientOption::Batching(true)).unwrap();
    assert!(mock
        .borrow()
        .options_seen
        .iter()
        .any(|option| option.contains("Batching")));

    // Recognized by the upload client even when the transport declines.
    mock.borrow_mut().option_result = Some(OptionResult::NotRecognized);
    client
        .set_option(ClientOption::BlobUploadTimeoutSecs(30))
        .unwrap();

    // Recognized by neither party.
    assert!(matches!(
        client.set_option(ClientOption::Batching(false)),
        Err(ClientError::InvalidArg(_))
    ));

    // A hard failure wins over recognition.
    mock.borrow_mut().option_result = Some(OptionResult::Error);
    assert!(matches!(
        client.set_option(ClientOption::TrustedCerts("pem".into())),
        Err(ClientError::Other(_))
    ));
}

#[test]
fn product_info_replaces_the_user_agent_suffix() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let mut client = client_on(&mock, clock);

    client.do_work();
    let default_agent = mock.borrow().product_info_seen.clone().unwrap();
    assert!(default_agent.starts_with("hublink/"));

    client
        .set_option(ClientOption::ProductInfo("acme-sensor/2.1".into()))
        .unwrap();
    client.do_work();
    let replaced = mock.borrow().product_info_seen.clone().unwrap();
    assert!(replaced.starts_with("acme-sensor/2.1 hublink/"));

    client
        .set_option(ClientOption::ProductInfo("acme-sensor/2.2".into()))
        .unwrap();
    client.do_work();
    let replaced_again = mock.borrow().product_info_seen.clone().unwrap();
    assert!(replaced_again.starts_with("acme-sensor/2.2 hublink/"));
    assert!(!replaced_again.contains("2.1"));
}

#[test]
fn duplicate_device_registration_is_rejected() {
    let mock = MockTransport::new();
    let clock = ManualClock::new(0);
    let _client = client_on(&mock, clock.clone());

    let result = DeviceClient::with_transport(mock.clone(), device_config(clock));
    assert!(result.is_err());
    // The shared transport stays usable for the first client.
    assert!(!mock.borrow().unregistered);
}
