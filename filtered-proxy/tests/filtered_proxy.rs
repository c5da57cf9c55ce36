use std::sync::Arc;

use filtered_proxy::aggregator_subs::AggregatorSubscriptions;
use filtered_proxy::client_handler::ClientHandler;
use filtered_proxy::config::Config;
use filtered_proxy::roster::ClientRoster;
use futures_util::{SinkExt, StreamExt};
use polygon_wire::Metrics;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn test_config(port: u16) -> Config {
    Config {
        firehose_url: "ws://127.0.0.1:8767".to_string(),
        firehose_token: "secret".to_string(),
        ms_aggregator_url: "ws://127.0.0.1:8768".to_string(),
        proxy_port: port,
        include_extended_hours: true,
        max_client_queue: 1_000,
        client_queue_deadline_ms: 1_000,
        reconnect_backoff_max_ms: 30_000,
        log_level: "info".to_string(),
    }
}

struct TestServer {
    addr: std::net::SocketAddr,
    roster: Arc<ClientRoster>,
    aggregator_cmd_rx: mpsc::Receiver<String>,
}

async fn spawn_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let metrics = Arc::new(Metrics::new());
    let config = test_config(addr.port());
    let roster = Arc::new(ClientRoster::new(metrics.clone(), config.client_queue_deadline_ms));
    let aggregator_subs = Arc::new(AggregatorSubscriptions::new());
    let (aggregator_cmd_tx, aggregator_cmd_rx) = mpsc::channel::<String>(100);

    let handler = Arc::new(ClientHandler::new(
        &config,
        roster.clone(),
        aggregator_subs,
        aggregator_cmd_tx,
        metrics,
    ));

    tokio::spawn(async move {
        handler.serve(listener).await.ok();
    });

    TestServer { addr, roster, aggregator_cmd_rx }
}

async fn connect_and_auth(
    addr: std::net::SocketAddr,
) -> (
    futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >,
    futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >,
) {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    let (mut write, mut read) = ws.split();

    let _ = read.next().await.unwrap().unwrap(); // connected

    write
        .send(Message::Text(r#"{"action":"auth","params":"any-credential"}"#.to_string()))
        .await
        .unwrap();
    let auth_response = read.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(auth_response.contains("auth_success"));

    (write, read)
}

#[tokio::test]
async fn auth_accepts_any_non_empty_credential() {
    let server = spawn_server().await;
    let (_write, _read) = connect_and_auth(server.addr).await;
}

#[tokio::test]
async fn subscribe_then_dispatch_delivers_only_matching_selector() {
    let server = spawn_server().await;
    let (mut write, mut read) = connect_and_auth(server.addr).await;

    write
        .send(Message::Text(r#"{"action":"subscribe","params":"T.TSLA"}"#.to_string()))
        .await
        .unwrap();
    let subscribed = read.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(subscribed.contains("subscribed"));

    // give the server loop a moment to register the selector before dispatching
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    server
        .roster
        .dispatch_frame(r#"[{"ev":"T","sym":"AAPL","p":1.0,"s":1.0,"t":1700000000000}]"#, true)
        .await;
    server
        .roster
        .dispatch_frame(r#"[{"ev":"T","sym":"TSLA","p":1.0,"s":1.0,"t":1700000000000}]"#, true)
        .await;

    let received = read.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(received.contains("TSLA"));
    assert!(!received.contains("AAPL"));
}

#[tokio::test]
async fn wildcard_subscription_receives_everything() {
    let server = spawn_server().await;
    let (mut write, mut read) = connect_and_auth(server.addr).await;

    write.send(Message::Text(r#"{"action":"subscribe","params":"*"}"#.to_string())).await.unwrap();
    let _ = read.next().await.unwrap().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    server
        .roster
        .dispatch_frame(r#"[{"ev":"T","sym":"GOOGL","p":1.0,"s":1.0,"t":1700000000000}]"#, true)
        .await;

    let received = read.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(received.contains("GOOGL"));
}

#[tokio::test]
async fn no_cross_delivery_between_disjoint_selectors() {
    let server = spawn_server().await;
    let (mut write_a, mut read_a) = connect_and_auth(server.addr).await;
    let (mut write_b, mut read_b) = connect_and_auth(server.addr).await;

    write_a
        .send(Message::Text(r#"{"action":"subscribe","params":"T.AAPL"}"#.to_string()))
        .await
        .unwrap();
    let _ = read_a.next().await.unwrap().unwrap();

    write_b.send(Message::Text(r#"{"action":"subscribe","params":"*"}"#.to_string())).await.unwrap();
    let _ = read_b.next().await.unwrap().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    server
        .roster
        .dispatch_frame(r#"[{"ev":"T","sym":"GOOGL","p":1.0,"s":1.0,"t":1700000000000}]"#, true)
        .await;

    // only B (wildcard) should see the GOOGL trade
    let b_received = read_b.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(b_received.contains("GOOGL"));

    server
        .roster
        .dispatch_frame(r#"[{"ev":"T","sym":"AAPL","p":1.0,"s":1.0,"t":1700000000100}]"#, true)
        .await;

    // both should see the AAPL trade
    let a_received = read_a.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(a_received.contains("AAPL"));
    let b_received2 = read_b.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(b_received2.contains("AAPL"));
}

#[tokio::test]
async fn extended_hours_filtering_drops_out_of_session_message() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let metrics = Arc::new(Metrics::new());
    let mut config = test_config(addr.port());
    config.include_extended_hours = false;
    let roster = Arc::new(ClientRoster::new(metrics.clone(), config.client_queue_deadline_ms));
    let aggregator_subs = Arc::new(AggregatorSubscriptions::new());
    let (aggregator_cmd_tx, _aggregator_cmd_rx) = mpsc::channel::<String>(100);

    let handler = Arc::new(ClientHandler::new(
        &config,
        roster.clone(),
        aggregator_subs,
        aggregator_cmd_tx,
        metrics,
    ));
    tokio::spawn(async move {
        handler.serve(listener).await.ok();
    });

    let (mut write, mut read) = connect_and_auth(addr).await;
    write.send(Message::Text(r#"{"action":"subscribe","params":"*"}"#.to_string())).await.unwrap();
    let _ = read.next().await.unwrap().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // midnight UTC: outside the 14:30-21:00 regular session
    roster.dispatch_frame(r#"[{"ev":"T","sym":"TSLA","p":1.0,"s":1.0,"t":0}]"#, false).await;
    // 15:00 UTC: inside the regular session
    let in_session_ts = 15 * 3_600 * 1_000;
    roster
        .dispatch_frame(
            &format!(r#"[{{"ev":"T","sym":"TSLA","p":1.0,"s":1.0,"t":{in_session_ts}}}]"#),
            false,
        )
        .await;

    // the only frame the client actually receives is the in-session one
    let received = read.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(received.contains("TSLA"));
}

#[tokio::test]
async fn first_subscribe_of_bar_selector_forwards_aggregator_subscribe() {
    let mut server = spawn_server().await;
    let (mut write, mut read) = connect_and_auth(server.addr).await;

    write
        .send(Message::Text(r#"{"action":"subscribe","params":"500Ms.TSLA","since":1700000000000}"#.to_string()))
        .await
        .unwrap();
    let subscribed = read.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(subscribed.contains("subscribed"));

    let forwarded = server.aggregator_cmd_rx.recv().await.unwrap();
    assert!(forwarded.contains("subscribe"));
    assert!(forwarded.contains("500Ms.TSLA") || forwarded.contains("500"));
}

#[tokio::test]
async fn last_unsubscribe_of_bar_selector_forwards_aggregator_unsubscribe() {
    let mut server = spawn_server().await;
    let (mut write, mut read) = connect_and_auth(server.addr).await;

    write
        .send(Message::Text(r#"{"action":"subscribe","params":"500Ms.TSLA"}"#.to_string()))
        .await
        .unwrap();
    let _ = read.next().await.unwrap().unwrap();
    let _subscribe_cmd = server.aggregator_cmd_rx.recv().await.unwrap();

    write
        .send(Message::Text(r#"{"action":"unsubscribe","params":"500Ms.TSLA"}"#.to_string()))
        .await
        .unwrap();
    let unsubscribed = read.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(unsubscribed.contains("unsubscribed"));

    let forwarded = server.aggregator_cmd_rx.recv().await.unwrap();
    assert!(forwarded.contains("unsubscribe"));
}
