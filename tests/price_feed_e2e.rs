use futures_util::{SinkExt, StreamExt};
use holdfast::application::actors::{ConnectionState, FeedEvent, PriceFeed, PriceTick};
use holdfast::config::FeedConfig;
use holdfast::domain::repositories::PriceSource;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

fn feed_config(port: u16) -> FeedConfig {
    FeedConfig {
        url: Some(format!("ws://127.0.0.1:{}/stream", port)),
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_secs(2),
        reconnect_base_delay: Duration::from_millis(20),
        max_reconnect_attempts: 3,
        connect_timeout: Duration::from_secs(1),
        event_buffer: 256,
    }
}

fn trade_json(asset: &str, sol: f64, tokens: f64) -> String {
    serde_json::json!({
        "mint": asset,
        "txType": "buy",
        "tokenAmount": tokens,
        "solAmount": sol,
    })
    .to_string()
}

async fn next_matching<F>(events: &mut broadcast::Receiver<FeedEvent>, mut pred: F) -> FeedEvent
where
    F: FnMut(&FeedEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for feed event")
}

#[tokio::test]
async fn test_subscriptions_are_restored_after_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<(usize, String)>();

    tokio::spawn(async move {
        for session in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    frames_tx.send((session, text)).unwrap();
                    if session == 0 {
                        // drop the first session right after the subscription
                        break;
                    }
                }
            }
        }
    });

    let feed = PriceFeed::new(feed_config(port), None).unwrap();
    feed.subscribe("MINT", None, None).await;
    feed.connect().await.unwrap();

    let (first_session, first) = timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first_session, 0);
    assert!(first.contains("subscribeTokenTrade"));
    assert!(first.contains("MINT"));

    let (second_session, second) = timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(second_session, 1);
    assert!(second.contains("subscribeTokenTrade"));
    assert!(second.contains("MINT"));

    feed.disconnect().await;
    assert_eq!(feed.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_malformed_messages_are_dropped_and_stream_continues() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        // wait for the subscription before streaming
        let _ = ws.next().await;
        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        ws.send(Message::Text(r#"{"mint": "MINT", "txType": "buy"}"#.to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(trade_json("MINT", 2.0, 1000.0)))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let feed = PriceFeed::new(feed_config(port), None).unwrap();
    let mut events = feed.events();
    feed.subscribe("MINT", None, None).await;
    feed.connect().await.unwrap();

    let dropped = next_matching(&mut events, |e| matches!(e, FeedEvent::MessageDropped { .. })).await;
    assert!(matches!(dropped, FeedEvent::MessageDropped { .. }));
    let price = next_matching(&mut events, |e| matches!(e, FeedEvent::Price(_))).await;
    match price {
        FeedEvent::Price(tick) => {
            assert_eq!(tick.asset, "MINT");
            assert!((tick.price - 0.002).abs() < 1e-12);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let last = feed.get_last("MINT").await.unwrap();
    assert_eq!(last.source, PriceSource::Live);
    assert_eq!(feed.state(), ConnectionState::Connected);
    feed.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    // reserve a port, then free it so nothing is listening
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = FeedConfig {
        max_reconnect_attempts: 2,
        reconnect_base_delay: Duration::from_millis(10),
        ..feed_config(port)
    };
    let feed = PriceFeed::new(config, None).unwrap();
    let mut events = feed.events();
    feed.connect().await.unwrap();

    let event = next_matching(&mut events, |e| matches!(e, FeedEvent::ReconnectFailed { .. })).await;
    assert!(matches!(event, FeedEvent::ReconnectFailed { attempts: 2 }));
    assert_eq!(feed.state(), ConnectionState::Failed { attempts: 2 });
}

#[tokio::test]
async fn test_panicking_callback_does_not_starve_other_subscribers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = ws.next().await;
        for sol in [1.0, 2.0] {
            ws.send(Message::Text(trade_json("MINT", sol, 1000.0)))
                .await
                .unwrap();
        }
        while ws.next().await.is_some() {}
    });

    let feed = PriceFeed::new(feed_config(port), None).unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered_cb = delivered.clone();
    feed.subscribe(
        "MINT",
        Some(Arc::new(|_: &PriceTick| panic!("subscriber bug"))),
        None,
    )
    .await;
    feed.subscribe(
        "MINT",
        Some(Arc::new(move |_: &PriceTick| {
            delivered_cb.fetch_add(1, Ordering::SeqCst);
        })),
        None,
    )
    .await;

    let mut events = feed.events();
    feed.connect().await.unwrap();

    for _ in 0..2 {
        next_matching(&mut events, |e| matches!(e, FeedEvent::Price(_))).await;
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert!((feed.get_last("MINT").await.unwrap().price - 0.002).abs() < 1e-12);
    feed.disconnect().await;
}

#[tokio::test]
async fn test_missing_heartbeat_ack_forces_reconnect_and_resubscribe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<(usize, String)>();

    tokio::spawn(async move {
        for session in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let frames_tx = frames_tx.clone();
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                if session == 0 {
                    // take the subscription, then stop reading so no pong goes back
                    if let Some(Ok(Message::Text(text))) = ws.next().await {
                        frames_tx.send((session, text)).unwrap();
                    }
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(ws);
                } else {
                    while let Some(Ok(message)) = ws.next().await {
                        if let Message::Text(text) = message {
                            frames_tx.send((session, text)).unwrap();
                        }
                    }
                }
            });
        }
    });

    let config = FeedConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(400),
        ..feed_config(port)
    };
    let feed = PriceFeed::new(config, None).unwrap();
    let mut events = feed.events();
    feed.subscribe("MINT", None, None).await;
    feed.connect().await.unwrap();

    let (first_session, first) = timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first_session, 0);
    assert!(first.contains("MINT"));

    let backing_off = next_matching(&mut events, |e| {
        matches!(e, FeedEvent::StateChanged(ConnectionState::BackingOff { .. }))
    })
    .await;
    assert!(matches!(
        backing_off,
        FeedEvent::StateChanged(ConnectionState::BackingOff { attempt: 1, .. })
    ));

    let (second_session, second) = timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(second_session, 1);
    assert!(second.contains("subscribeTokenTrade"));
    assert!(second.contains("MINT"));

    next_matching(&mut events, |e| {
        matches!(e, FeedEvent::StateChanged(ConnectionState::Connected))
    })
    .await;
    feed.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_cancels_pending_reconnect() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = FeedConfig {
        reconnect_base_delay: Duration::from_secs(30),
        ..feed_config(port)
    };
    let feed = PriceFeed::new(config, None).unwrap();
    let mut events = feed.events();
    feed.connect().await.unwrap();

    next_matching(&mut events, |e| {
        matches!(e, FeedEvent::StateChanged(ConnectionState::BackingOff { .. }))
    })
    .await;

    let started = std::time::Instant::now();
    feed.disconnect().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(feed.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(300)).await;
    loop {
        match events.try_recv() {
            Ok(FeedEvent::StateChanged(ConnectionState::Connecting { .. })) => {
                panic!("reconnect attempted after disconnect")
            }
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(feed.state(), ConnectionState::Disconnected);
}
