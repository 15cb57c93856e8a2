use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::timeout;

use resp_client::{
    Config, Connection, Error, Event, Message, PushKind, Subscriber, SubscriptionChanged,
};

/// The server side writes whatever the test pushes through the channel and discards what
/// the client sends.
async fn create_tcp_connection() -> Result<(UnboundedSender<Vec<u8>>, TcpStream), std::io::Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_addr = listener.local_addr()?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let (mut read_half, mut write_half) = socket.into_split();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = read_half.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
            while let Some(data) = rx.recv().await {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    });

    let stream = TcpStream::connect(local_addr).await?;

    Ok((tx, stream))
}

fn ack(kind: &str, name: &str, count: i64) -> Vec<u8> {
    format!(
        "*3\r\n${}\r\n{}\r\n${}\r\n{}\r\n:{}\r\n",
        kind.len(),
        kind,
        name.len(),
        name,
        count
    )
    .into_bytes()
}

async fn next_event(events: &mut mpsc::Receiver<Event>) -> Event {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_subscriber_receives_messages() {
    let (tx, stream) = create_tcp_connection().await.unwrap();
    let conn = Connection::new(stream, Config::default());
    let (subscriber, mut events) = Subscriber::spawn(conn).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    subscriber.on_message("news", move |message| {
        assert_eq!(message.payload, Bytes::from("hello"));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    subscriber.subscribe(["news"]).await.unwrap();
    tx.send(ack("subscribe", "news", 1)).unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::SubscriptionChanged(SubscriptionChanged {
            kind: PushKind::Subscribe,
            channel: Some("news".to_string()),
            pattern: None,
            count: 1,
        })
    );
    assert_eq!(subscriber.subscription_count(), 1);
    assert!(subscriber.is_subscribed());

    tx.send(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n".to_vec())
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::MessageReceived(Message {
            channel: "news".to_string(),
            pattern: None,
            payload: Bytes::from("hello"),
        })
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    subscriber.unsubscribe(["news"]).await.unwrap();
    tx.send(ack("unsubscribe", "news", 0)).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        Event::SubscriptionChanged(SubscriptionChanged { count: 0, .. })
    ));
    assert!(!subscriber.is_subscribed());

    // The loop outlives the subscriptions until shut down.
    assert!(subscriber.is_running());
    subscriber.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pattern_messages() {
    let (tx, stream) = create_tcp_connection().await.unwrap();
    let (subscriber, mut events) =
        Subscriber::spawn(Connection::new(stream, Config::default())).unwrap();

    subscriber.psubscribe(["n*"]).await.unwrap();
    tx.send(ack("psubscribe", "n*", 1)).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        Event::SubscriptionChanged(SubscriptionChanged { kind: PushKind::PSubscribe, count: 1, .. })
    ));

    tx.send(b"*4\r\n$8\r\npmessage\r\n$2\r\nn*\r\n$4\r\nnews\r\n$2\r\nhi\r\n".to_vec())
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::MessageReceived(Message {
            channel: "news".to_string(),
            pattern: Some("n*".to_string()),
            payload: Bytes::from("hi"),
        })
    );

    subscriber.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_closed_stream_ends_loop() {
    let (tx, stream) = create_tcp_connection().await.unwrap();
    let (subscriber, mut events) =
        Subscriber::spawn(Connection::new(stream, Config::default())).unwrap();

    subscriber.subscribe(["news"]).await.unwrap();
    tx.send(ack("subscribe", "news", 1)).unwrap();
    next_event(&mut events).await;

    drop(tx);
    assert_eq!(timeout(Duration::from_secs(5), events.recv()).await.unwrap(), None);

    let err = subscriber.shutdown().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn test_callbacks_run_with_undrained_events() {
    let (tx, stream) = create_tcp_connection().await.unwrap();
    let config = Config::default().with_event_capacity(1);
    let (subscriber, _events) = Subscriber::spawn(Connection::new(stream, config)).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    subscriber.on_message("news", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    subscriber.subscribe(["news"]).await.unwrap();
    tx.send(ack("subscribe", "news", 1)).unwrap();
    for _ in 0..5 {
        tx.send(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nhi\r\n".to_vec())
            .unwrap();
    }

    // Nobody reads `_events`, the loop must keep dispatching anyway.
    timeout(Duration::from_secs(5), async {
        while hits.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(subscriber.is_running());
    subscriber.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropping_subscriber_closes_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    });

    let config = Config::default().with_read_timeout(Duration::from_millis(200));
    let stream = TcpStream::connect(addr).await.unwrap();
    let (subscriber, events) = Subscriber::spawn(Connection::new(stream, config)).unwrap();
    subscriber.subscribe(["news"]).await.unwrap();

    drop(subscriber);
    drop(events);

    timeout(Duration::from_secs(3), closed_rx)
        .await
        .expect("connection still open after the subscriber was dropped")
        .unwrap();
}
