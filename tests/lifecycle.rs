mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{Harness, IPC, STREAM_ID};
use conduit::{Client, Error, ErrorCode, Image, SystemClock};

/// Runs duty cycles until `find` stops answering `Ok(None)` and returns
/// the error it produced.
fn await_error<T: std::fmt::Debug>(
    harness: &Harness,
    client: &Client,
    mut find: impl FnMut() -> conduit::Result<Option<T>>,
) -> Error {
    let mut outcome = None;
    harness.work_until(&[client], || match find() {
        Ok(None) => false,
        Ok(Some(handle)) => panic!("unexpected registration {handle:?}"),
        Err(err) => {
            outcome = Some(err);
            true
        }
    });
    outcome.expect("error")
}

#[test]
fn closed_publication_and_subscription_reject_use() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();
    let publication_id = publication.correlation_id();

    publication.close().expect("close publication");
    assert!(publication.is_closed());
    assert!(matches!(
        publication.offer(b"late"),
        Err(Error::ClosedResource("publication"))
    ));
    assert!(matches!(
        publication.position(),
        Err(Error::ClosedResource(_))
    ));
    publication.close().expect("close is idempotent");
    assert!(matches!(
        harness.client.find_publication(publication_id),
        Err(Error::UnknownRegistration(id)) if id == publication_id
    ));

    subscription.close().expect("close subscription");
    assert!(matches!(
        subscription.poll(|_, _| {}, 10),
        Err(Error::ClosedResource("subscription"))
    ));
    assert_eq!(subscription.image_count(), 0);
    subscription.close().expect("close is idempotent");
}

#[test]
fn client_close_closes_every_handle() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();
    let image = subscription.images()[0].clone();

    harness.client.close();
    assert!(harness.client.is_closed());
    assert!(publication.is_closed());
    assert!(subscription.is_closed());
    assert!(image.is_closed());
    assert_eq!(image.poll(|_, _| {}, 10), 0);
    assert!(matches!(publication.offer(b"x"), Err(Error::ClosedResource(_))));
    assert!(matches!(
        harness.client.add_publication(IPC, STREAM_ID),
        Err(Error::ClientClosed)
    ));
    assert!(matches!(
        harness.client.find_subscription(subscription.registration_id()),
        Err(Error::ClientClosed)
    ));
    harness.client.close();
}

#[test]
fn closing_publication_makes_image_unavailable() {
    let available = Arc::new(AtomicUsize::new(0));
    let unavailable = Arc::new(AtomicUsize::new(0));
    let harness = {
        let available = Arc::clone(&available);
        let unavailable = Arc::clone(&unavailable);
        Harness::with(
            Arc::new(SystemClock),
            |_| {},
            move |ctx| {
                ctx.on_available_image = Some(Arc::new(move |_: &Image| {
                    available.fetch_add(1, Ordering::SeqCst);
                }));
                ctx.on_unavailable_image = Some(Arc::new(move |_: &Image| {
                    unavailable.fetch_add(1, Ordering::SeqCst);
                }));
            },
        )
    };
    let (publication, subscription) = harness.connected_pair();
    assert_eq!(available.load(Ordering::SeqCst), 1);

    let position = harness.offer(&publication, b"last words");
    assert_eq!(harness.receive(&subscription, 1), vec![b"last words".to_vec()]);
    let image = subscription.images()[0].clone();

    publication.close().expect("close");
    harness.work_until(&[&harness.client], || subscription.image_count() == 0);

    assert_eq!(unavailable.load(Ordering::SeqCst), 1);
    assert!(image.is_closed());
    assert_eq!(image.position(), position);
    assert!(image.is_end_of_stream());
    assert!(!subscription.is_connected());
}

#[test]
fn unsupported_media_is_reported_once() {
    let harness = Harness::new();
    let id = harness
        .client
        .add_publication("aeron:udp?endpoint=localhost:40123", STREAM_ID)
        .expect("add");

    let err = await_error(&harness, &harness.client, || harness.client.find_publication(id));
    match err {
        Error::Registration {
            correlation_id,
            code,
            ..
        } => {
            assert_eq!(correlation_id, id);
            assert_eq!(code, ErrorCode::NotSupported);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        harness.client.find_publication(id),
        Err(Error::UnknownRegistration(_))
    ));
}

#[test]
fn malformed_channels_are_rejected() {
    let harness = Harness::new();
    let id = harness
        .client
        .add_subscription("bogus:ipc", STREAM_ID)
        .expect("add");
    let err = await_error(&harness, &harness.client, || harness.client.find_subscription(id));
    assert!(
        matches!(
            err,
            Error::Registration {
                code: ErrorCode::InvalidChannel,
                ..
            }
        ),
        "{err:?}"
    );

    assert!(matches!(
        harness.client.add_publication("", STREAM_ID),
        Err(Error::Administration(_))
    ));
}

#[test]
fn correlation_ids_are_unique_across_clients() {
    let harness = Harness::new();
    let other = harness.connect_another();
    assert_ne!(harness.client.client_id(), other.client_id());

    let mut ids = vec![harness.client.client_id(), other.client_id()];
    for stream_id in 0..5 {
        ids.push(harness.client.add_subscription(IPC, stream_id).expect("add"));
        ids.push(other.add_publication(IPC, stream_id).expect("add"));
    }
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
}

#[test]
fn publications_on_one_stream_share_a_session() {
    let harness = Harness::new();
    let subscription = harness.subscription(IPC, STREAM_ID);
    let first = harness.publication(IPC, STREAM_ID);
    let second = harness.publication(IPC, STREAM_ID);

    assert_ne!(first.correlation_id(), second.correlation_id());
    assert_eq!(first.registration_id(), second.registration_id());
    assert_eq!(first.session_id(), second.session_id());

    harness.work_until(&[&harness.client], || second.is_connected());
    harness.offer(&first, b"one");
    first.close().expect("close first");
    harness.work();
    harness.offer(&second, b"two");

    assert_eq!(
        harness.receive(&subscription, 2),
        vec![b"one".to_vec(), b"two".to_vec()]
    );
    assert_eq!(subscription.image_count(), 1);
}

#[test]
fn late_subscriber_joins_at_publication_position() {
    let harness = Harness::new();
    let (publication, early) = harness.connected_pair();
    for _ in 0..3 {
        harness.offer(&publication, b"before");
    }
    harness.receive(&early, 3);
    let joined_at = publication.position().expect("position");

    let late = harness.subscription(IPC, STREAM_ID);
    harness.work_until(&[&harness.client], || late.image_count() == 1);
    let image = late.images()[0].clone();
    assert_eq!(image.join_position(), joined_at);
    assert_eq!(image.position(), joined_at);

    harness.offer(&publication, b"after");
    assert_eq!(harness.receive(&late, 1), vec![b"after".to_vec()]);
}
