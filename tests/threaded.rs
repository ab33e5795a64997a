use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use conduit::{
    Client, Context, DriverContext, Error, IdleStrategy, MediaDriver, Publication, Subscription,
    ThreadingMode,
};
use tempfile::tempdir;

const IPC: &str = "aeron:ipc";
const TIMEOUT: Duration = Duration::from_secs(10);

fn driver_context(dir: &std::path::Path) -> DriverContext {
    DriverContext {
        dir: dir.to_path_buf(),
        term_length: 64 * 1024,
        to_driver_buffer_capacity: 64 * 1024,
        to_clients_buffer_capacity: 64 * 1024,
        counters_capacity: 128,
        threading_mode: ThreadingMode::Dedicated,
        idle_strategy: IdleStrategy::Sleeping(Duration::from_micros(100)),
        ..DriverContext::default()
    }
}

fn client_context(dir: &std::path::Path) -> Context {
    Context {
        dir: dir.to_path_buf(),
        idle_strategy: IdleStrategy::Sleeping(Duration::from_micros(100)),
        ..Context::default()
    }
}

fn await_some<T>(mut find: impl FnMut() -> conduit::Result<Option<T>>) -> T {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Some(found) = find().expect("find") {
            return found;
        }
        assert!(Instant::now() < deadline, "registration not answered");
        thread::sleep(Duration::from_millis(1));
    }
}

fn connected(client: &Client, stream_id: i32) -> (Arc<Publication>, Arc<Subscription>) {
    let sub_id = client.add_subscription(IPC, stream_id).expect("add sub");
    let pub_id = client.add_publication(IPC, stream_id).expect("add pub");
    let subscription = await_some(|| client.find_subscription(sub_id));
    let publication = await_some(|| client.find_publication(pub_id));
    let deadline = Instant::now() + TIMEOUT;
    while !(publication.is_connected() && subscription.is_connected()) {
        assert!(Instant::now() < deadline, "never connected");
        thread::sleep(Duration::from_millis(1));
    }
    (publication, subscription)
}

fn offer_blocking(publication: &Publication, message: &[u8]) -> i64 {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match publication.offer(message) {
            Ok(position) => return position,
            Err(err) if err.is_transient() => {
                assert!(Instant::now() < deadline, "offer stuck on {err}");
                thread::yield_now();
            }
            Err(err) => panic!("offer failed: {err}"),
        }
    }
}

#[test]
fn dedicated_driver_and_conductor_round_trip() {
    let dir = tempdir().expect("tempdir");
    let _driver = MediaDriver::launch(driver_context(dir.path())).expect("launch");
    let client = Client::connect(client_context(dir.path())).expect("connect");
    assert!(client.conductor_agent_invoker().is_none());

    let (publication, subscription) = connected(&client, 1);
    offer_blocking(&publication, b"ping");

    let deadline = Instant::now() + TIMEOUT;
    let mut received = Vec::new();
    while received.is_empty() {
        subscription
            .poll(|payload, _| received.push(payload.to_vec()), 10)
            .expect("poll");
        assert!(Instant::now() < deadline, "nothing received");
    }
    assert_eq!(received, vec![b"ping".to_vec()]);
    client.close();
}

#[test]
fn concurrent_publishers_keep_per_thread_order() {
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 500;

    let dir = tempdir().expect("tempdir");
    let _driver = MediaDriver::launch(driver_context(dir.path())).expect("launch");
    let client = Client::connect(client_context(dir.path())).expect("connect");
    let (publication, subscription) = connected(&client, 2);

    let publishers: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let publication = Arc::clone(&publication);
            thread::spawn(move || {
                for seq in 0..PER_THREAD {
                    let mut message = [0u8; 64];
                    message[..4].copy_from_slice(&thread_id.to_le_bytes());
                    message[4..8].copy_from_slice(&seq.to_le_bytes());
                    offer_blocking(&publication, &message);
                }
            })
        })
        .collect();

    let mut next_seq: HashMap<u32, u32> = HashMap::new();
    let mut total = 0;
    let deadline = Instant::now() + Duration::from_secs(30);
    while total < THREADS * PER_THREAD {
        subscription
            .poll(
                |payload, _| {
                    let thread_id = u32::from_le_bytes(payload[..4].try_into().expect("id"));
                    let seq = u32::from_le_bytes(payload[4..8].try_into().expect("seq"));
                    let expected = next_seq.entry(thread_id).or_insert(0);
                    assert_eq!(seq, *expected, "thread {thread_id} out of order");
                    *expected += 1;
                    total += 1;
                },
                64,
            )
            .expect("poll");
        assert!(Instant::now() < deadline, "received {total}");
    }
    for publisher in publishers {
        publisher.join().expect("publisher thread");
    }
    assert_eq!(next_seq.len(), THREADS as usize);
    assert!(next_seq.values().all(|&n| n == PER_THREAD));
}

#[test]
fn client_launches_embedded_driver() {
    let dir = tempdir().expect("tempdir");
    let driver_dir = dir.path().join("embedded");
    let ctx = Context {
        embedded_driver: Some(DriverContext {
            dir_delete_on_shutdown: true,
            ..driver_context(&dir.path().join("ignored"))
        }),
        ..client_context(&driver_dir)
    };
    let client = Client::connect(ctx).expect("connect");
    assert!(driver_dir.join("cnc.dat").exists());

    let (publication, subscription) = connected(&client, 3);
    offer_blocking(&publication, b"in-process");
    let deadline = Instant::now() + TIMEOUT;
    let mut received = 0;
    while received == 0 {
        received += subscription.poll(|_, _| {}, 10).expect("poll");
        assert!(Instant::now() < deadline, "nothing received");
    }

    client.close();
    assert!(!driver_dir.exists());
    assert!(matches!(
        client.add_publication(IPC, 3),
        Err(Error::ClientClosed)
    ));
}
