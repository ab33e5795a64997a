mod common;

use common::{Harness, IPC, STREAM_ID, TERM_LENGTH};
use conduit::{ControlledAction, Error};

#[test]
fn hello_world_over_ipc() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();

    let position = harness.offer(&publication, b"Hello World!");
    assert_eq!(position, 64);

    let mut seen = Vec::new();
    harness.work_until(&[&harness.client], || {
        subscription
            .poll(
                |payload, header| {
                    seen.push((
                        payload.to_vec(),
                        header.session_id(),
                        header.stream_id(),
                        header.position(),
                    ))
                },
                10,
            )
            .expect("poll");
        !seen.is_empty()
    });

    let (payload, session_id, stream_id, header_position) = &seen[0];
    assert_eq!(payload.as_slice(), b"Hello World!");
    assert_eq!(*session_id, publication.session_id());
    assert_eq!(*stream_id, STREAM_ID);
    assert_eq!(*header_position, position);

    let image = subscription
        .image_by_session_id(publication.session_id())
        .expect("image");
    assert_eq!(image.position(), position);
    assert_eq!(image.source_identity(), "aeron:ipc");
}

#[test]
fn offer_positions_strictly_increase() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();

    let mut last = publication.position().expect("position");
    for seq in 0..20u32 {
        let position = harness.offer(&publication, &seq.to_le_bytes());
        assert!(position > last, "{position} <= {last}");
        last = position;
    }
    assert_eq!(publication.position().expect("position"), last);

    let received = harness.receive(&subscription, 20);
    let decoded: Vec<u32> = received
        .iter()
        .map(|m| u32::from_le_bytes(m[..4].try_into().expect("len")))
        .collect();
    assert_eq!(decoded, (0..20).collect::<Vec<_>>());
}

#[test]
fn poll_respects_fragment_limit() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();
    for seq in 0..5u8 {
        harness.offer(&publication, &[seq; 16]);
    }

    let mut calls = 0;
    let fragments = subscription
        .poll(|_, _| calls += 1, 2)
        .expect("poll");
    assert_eq!(fragments, 2);
    assert_eq!(calls, 2);

    let rest = harness.receive(&subscription, 3);
    assert_eq!(rest, vec![vec![2u8; 16], vec![3u8; 16], vec![4u8; 16]]);
}

#[test]
fn large_message_is_fragmented_and_reassembled() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();
    assert_eq!(publication.max_payload_length(), 1408 - 32);

    let message: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    harness.offer(&publication, &message);
    harness.offer(&publication, b"tail");

    let received = harness.receive(&subscription, 2);
    assert_eq!(received[0], message);
    assert_eq!(received[1], b"tail");
}

#[test]
fn oversized_message_is_rejected() {
    let harness = Harness::new();
    let (publication, _subscription) = harness.connected_pair();
    assert_eq!(publication.max_message_length(), TERM_LENGTH / 8);

    let message = vec![0u8; TERM_LENGTH / 8 + 1];
    let err = publication.offer(&message).expect_err("too large");
    assert!(matches!(err, Error::MessageTooLarge { .. }), "{err:?}");

    let err = publication
        .try_claim(publication.max_payload_length() + 1)
        .expect_err("too large");
    assert!(matches!(err, Error::MessageTooLarge { .. }), "{err:?}");
}

#[test]
fn try_claim_commit_abort_and_drop() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();
    harness.work();

    let mut claim = publication.try_claim(8).expect("claim");
    assert_eq!(claim.length(), 8);
    claim.put_bytes(0, b"claimed!");
    claim.commit();

    let claim = publication.try_claim(8).expect("claim");
    claim.abort();

    {
        let mut claim = publication.try_claim(4).expect("claim");
        claim.put_bytes(0, b"lost");
    }

    harness.offer(&publication, b"after");
    let received = harness.receive(&subscription, 2);
    assert_eq!(received, vec![b"claimed!".to_vec(), b"after".to_vec()]);
}

#[test]
fn controlled_poll_abort_redelivers() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();
    harness.offer(&publication, b"first");
    harness.offer(&publication, b"second");
    harness.work();

    let image = subscription.images()[0].clone();
    let before = image.position();
    let fragments = subscription
        .controlled_poll(|_, _| ControlledAction::Abort, 10)
        .expect("poll");
    assert_eq!(fragments, 0);
    assert_eq!(image.position(), before);

    let mut seen = Vec::new();
    let fragments = subscription
        .controlled_poll(
            |payload, _| {
                seen.push(payload.to_vec());
                ControlledAction::Break
            },
            10,
        )
        .expect("poll");
    assert_eq!(fragments, 1);
    assert_eq!(seen, vec![b"first".to_vec()]);

    subscription
        .controlled_poll(
            |payload, _| {
                seen.push(payload.to_vec());
                ControlledAction::Commit
            },
            10,
        )
        .expect("poll");
    assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
}

#[test]
fn controlled_poll_abort_of_fragmented_message_redelivers_whole() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();
    let message: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();
    harness.offer(&publication, &message);
    harness.work();

    let mut aborted = 0;
    subscription
        .controlled_poll(
            |_, _| {
                aborted += 1;
                ControlledAction::Abort
            },
            10,
        )
        .expect("poll");
    assert_eq!(aborted, 1);

    let mut seen = Vec::new();
    subscription
        .controlled_poll(
            |payload, _| {
                seen.push(payload.to_vec());
                ControlledAction::Continue
            },
            10,
        )
        .expect("poll");
    assert_eq!(seen, vec![message]);
}

#[test]
fn publication_without_subscriber_is_not_connected() {
    let harness = Harness::new();
    let publication = harness.publication(IPC, 77);
    harness.work();

    assert!(!publication.is_connected());
    assert!(matches!(publication.offer(b"nobody"), Err(Error::NotConnected)));

    let subscription = harness.subscription(IPC, 77);
    harness.work_until(&[&harness.client], || publication.is_connected());
    harness.offer(&publication, b"somebody");
    assert_eq!(harness.receive(&subscription, 1), vec![b"somebody".to_vec()]);
}

#[test]
fn slow_subscriber_back_pressures_publisher() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();
    let message = [7u8; 1024];

    let mut accepted = 0;
    let err = loop {
        match publication.offer(&message) {
            Ok(_) => accepted += 1,
            Err(Error::AdminAction) => {}
            Err(err) => break err,
        }
        assert!(accepted < 1000, "never back pressured");
    };
    assert!(matches!(err, Error::BackPressured), "{err:?}");
    assert!(publication.position().expect("position") >= publication.position_limit().expect("limit"));
    assert!(accepted >= (TERM_LENGTH / 2) / 1056);

    let drained = harness.receive(&subscription, accepted);
    assert_eq!(drained.len(), accepted);
    harness.work();
    harness.offer(&publication, &message);
}

#[test]
fn stream_crosses_term_boundaries() {
    let harness = Harness::new();
    let (publication, subscription) = harness.connected_pair();
    let count = 4 * TERM_LENGTH / 1000;

    let mut received = Vec::new();
    let mut last_position = 0;
    for seq in 0..count as u32 {
        let mut message = vec![0u8; 1000];
        message[..4].copy_from_slice(&seq.to_le_bytes());
        last_position = harness.offer(&publication, &message);
        subscription
            .poll(|payload, _| received.push(payload.to_vec()), 16)
            .expect("poll");
    }
    assert!(last_position > 3 * TERM_LENGTH as i64);

    harness.work_until(&[&harness.client], || {
        subscription
            .poll(|payload, _| received.push(payload.to_vec()), 16)
            .expect("poll");
        received.len() >= count
    });
    let sequence: Vec<u32> = received
        .iter()
        .map(|m| u32::from_le_bytes(m[..4].try_into().expect("len")))
        .collect();
    assert_eq!(sequence, (0..count as u32).collect::<Vec<_>>());
}
