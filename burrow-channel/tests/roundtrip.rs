//! End-to-end delivery: publish through a channel server, stream to a
//! remote subscriber over TCP, acknowledge, and verify the cursor survives
//! a restart.

use std::{io, time::Duration};

use burrow_channel::{publisher, ChannelServer, Message, Subscriber};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Event {
    text: String,
    n: u32,
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn publish_subscribe_ack_restart() {
    let dir = tempfile::tempdir().unwrap();
    let index_dir = dir.path().join("index");
    let data_dir = dir.path().join("data");
    let state_file = dir.path().join("state");

    let cancel = CancellationToken::new();
    let server = ChannelServer::open(&index_dir, &data_dir, &state_file).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_server = server.clone();
    let accept_cancel = cancel.clone();
    let server_task = tokio::spawn(async move { accept_server.run(listener, accept_cancel).await });

    // Register the subscription before anything is published so it observes
    // every message.
    let subscriber = Subscriber::connect(&addr.to_string(), "worker").await.unwrap();
    {
        let server = server.clone();
        eventually("subscription registration", move || {
            server.subscription_head("worker").is_some()
        })
        .await;
    }

    let (message_tx, mut message_rx) = mpsc::channel::<Message<Event>>(16);
    let subscriber_cancel = cancel.clone();
    let subscriber_task = tokio::spawn(subscriber.run(
        |bytes| serde_json::from_slice::<Event>(bytes).map_err(io::Error::from),
        message_tx,
        subscriber_cancel,
    ));

    let (publisher, publish_loop) = publisher::<_, Event, u32>(
        server.clone(),
        |event| serde_json::to_vec(event).map_err(io::Error::from),
        16,
        None,
    );
    let publish_cancel = cancel.clone();
    let publish_task = tokio::spawn(publish_loop.run(publish_cancel));

    let mut handles = Vec::new();
    for n in 1..=3 {
        let event = Event {
            text: format!("event {n}"),
            n,
        };
        handles.push(publisher.send(&event, n).await);
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.wait().await.unwrap(), i as u64 + 1);
    }

    // All three arrive in publish order; ack each in order.
    for n in 1..=3u32 {
        let message = message_rx.recv().await.unwrap();
        assert_eq!(message.id(), n as u64);
        assert_eq!(
            message.data(),
            &Event {
                text: format!("event {n}"),
                n,
            }
        );
        message.ack().await.wait().await.unwrap();
    }

    {
        let server = server.clone();
        eventually("cursor to advance to 3", move || {
            server.subscription_head("worker") == Some(3)
        })
        .await;
    }

    cancel.cancel();
    drop(publisher);
    let _ = publish_task.await.unwrap();
    let _ = subscriber_task.await.unwrap();
    let _ = server_task.await.unwrap();
    drop(server);

    // A restarted server resumes with the same head and cursor.
    let reopened = ChannelServer::open(&index_dir, &data_dir, &state_file).unwrap();
    assert_eq!(reopened.head(), 3);
    assert_eq!(reopened.subscription_head("worker"), Some(3));
}

#[tokio::test]
async fn bad_subscribe_line_closes_connection() {
    use tokio::io::AsyncWriteExt;

    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let server = ChannelServer::open(
        &dir.path().join("index"),
        &dir.path().join("data"),
        &dir.path().join("state"),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_server = server.clone();
    let accept_cancel = cancel.clone();
    let server_task = tokio::spawn(async move { accept_server.run(listener, accept_cancel).await });

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"NOPE worker\n").await.unwrap();

    // The server refuses the line by closing the connection.
    let mut buf = [0u8; 1];
    use tokio::io::AsyncReadExt;
    let read = stream.read(&mut buf).await.unwrap();
    assert_eq!(read, 0);

    cancel.cancel();
    let _ = server_task.await.unwrap();
}
