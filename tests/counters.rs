mod common;

use std::sync::Arc;

use common::Harness;
use conduit::concurrent::counters::CLIENT_HEARTBEAT_TYPE_ID;
use conduit::{Counter, CounterState, Error, ErrorCode, SystemClock};

const ORDERS_TYPE_ID: i32 = 1001;

fn await_counter(harness: &Harness, correlation_id: i64) -> Arc<Counter> {
    let mut found = None;
    harness.work_until(&[&harness.client], || {
        found = harness
            .client
            .find_counter(correlation_id)
            .expect("find counter");
        found.is_some()
    });
    found.expect("counter")
}

#[test]
fn user_counter_is_visible_through_the_reader() {
    let harness = Harness::new();
    let id = harness
        .client
        .add_counter(ORDERS_TYPE_ID, b"desk-7", "orders accepted: desk-7")
        .expect("add counter");
    let counter = await_counter(&harness, id);
    assert_eq!(counter.registration_id(), id);

    assert_eq!(counter.increment().expect("increment"), 0);
    assert_eq!(counter.increment().expect("increment"), 1);
    counter.set(40).expect("set");
    assert_eq!(counter.get().expect("get"), 40);

    let reader = harness.client.counters_reader();
    assert_eq!(reader.counter_value(counter.id()), 40);
    assert_eq!(reader.counter_type_id(counter.id()), ORDERS_TYPE_ID);
    assert_eq!(reader.counter_label(counter.id()), "orders accepted: desk-7");
    assert_eq!(reader.counter_registration_id(counter.id()), id);
    assert_eq!(reader.counter_owner_id(counter.id()), harness.client.client_id());
    assert_eq!(
        reader.find_by_type_id_and_key(ORDERS_TYPE_ID, b"desk-7"),
        Some(counter.id())
    );

    let mut labels = Vec::new();
    reader.for_each(|_, type_id, _, label| {
        if type_id == ORDERS_TYPE_ID {
            labels.push(label.to_string());
        }
    });
    assert_eq!(labels, vec!["orders accepted: desk-7".to_string()]);
}

#[test]
fn closed_counter_is_reclaimed_by_driver() {
    let harness = Harness::new();
    let id = harness
        .client
        .add_counter(ORDERS_TYPE_ID, &[], "scratch")
        .expect("add counter");
    let counter = await_counter(&harness, id);
    let counter_id = counter.id();

    counter.close().expect("close");
    assert!(counter.is_closed());
    assert!(matches!(counter.get(), Err(Error::ClosedResource("counter"))));
    assert!(matches!(counter.increment(), Err(Error::ClosedResource(_))));
    counter.close().expect("close is idempotent");

    let reader = harness.client.counters_reader();
    harness.work_until(&[&harness.client], || {
        matches!(reader.counter_state(counter_id), CounterState::Reclaimed)
    });
    assert!(matches!(
        harness.client.find_counter(id),
        Err(Error::UnknownRegistration(_))
    ));
}

#[test]
fn exhausted_counters_are_rejected() {
    let harness = Harness::with(
        Arc::new(SystemClock),
        |driver| driver.counters_capacity = 4,
        |_| {},
    );
    let first = harness.client.add_counter(ORDERS_TYPE_ID, &[], "a").expect("add");
    await_counter(&harness, first);
    let second = harness.client.add_counter(ORDERS_TYPE_ID, &[], "b").expect("add");
    await_counter(&harness, second);

    let third = harness.client.add_counter(ORDERS_TYPE_ID, &[], "c").expect("add");
    let mut outcome = None;
    harness.work_until(&[&harness.client], || match harness.client.find_counter(third) {
        Ok(None) => false,
        other => {
            outcome = Some(other);
            true
        }
    });
    match outcome.expect("outcome") {
        Err(Error::Registration { code, .. }) => assert_eq!(code, ErrorCode::ResourceExhausted),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn reserved_type_ids_are_refused() {
    let harness = Harness::new();
    let other = harness.connect_another();
    let id = harness
        .client
        .add_counter(CLIENT_HEARTBEAT_TYPE_ID, &other.client_id().to_le_bytes(), "spoof")
        .expect("add counter");

    let mut outcome = None;
    harness.work_until(&[&harness.client], || match harness.client.find_counter(id) {
        Ok(None) => false,
        other => {
            outcome = Some(other);
            true
        }
    });
    match outcome.expect("outcome") {
        Err(Error::Registration { code, .. }) => assert_eq!(code, ErrorCode::GenericError),
        other => panic!("unexpected {other:?}"),
    }
    let reader = harness.client.counters_reader();
    let mut labels = Vec::new();
    reader.for_each(|_, _, _, label| labels.push(label.to_string()));
    assert!(!labels.iter().any(|label| label == "spoof"), "{labels:?}");
}
