use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use murmur_protocol::codec::decode_server_text;
use murmur_protocol::ServerFrame;
use murmur_server::{build_state, serve, Config};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start() -> Server {
    let config: Config = toml::from_str(
        r#"
        [metrics]
        enabled = false

        [[rooms]]
        id = 7
        members = [1, 2]
        "#,
    )
    .unwrap();

    let state = build_state(config).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(serve(listener, state, async move {
        let _ = stopped.await;
    }));
    Server { addr, stop, task }
}

async fn connect(addr: SocketAddr, user: Option<&str>) -> Result<Client, WsError> {
    let mut request = format!("ws://{addr}/ws").into_client_request()?;
    if let Some(user) = user {
        request
            .headers_mut()
            .insert("x-user-id", HeaderValue::from_str(user).unwrap());
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn send(client: &mut Client, json: &str) {
    client.send(Message::Text(json.to_string())).await.unwrap();
}

async fn next_frame(client: &mut Client) -> ServerFrame {
    loop {
        match client.next().await {
            Some(Ok(Message::Text(text))) => return decode_server_text(&text).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_chat_over_websocket() {
    let server = start().await;
    let mut alice = connect(server.addr, Some("1")).await.unwrap();
    let mut bob = connect(server.addr, Some("2")).await.unwrap();

    for client in [&mut alice, &mut bob] {
        send(client, r#"{"type":"join_room","room_id":7}"#).await;
        assert!(matches!(next_frame(client).await, ServerFrame::RoomJoined { room_id: 7, .. }));
    }

    send(&mut alice, r#"{"type":"message","room_id":7,"content":"hi"}"#).await;
    for client in [&mut alice, &mut bob] {
        match next_frame(client).await {
            ServerFrame::NewMessage { room_id, sender_id, content, .. } => {
                assert_eq!(room_id, 7);
                assert_eq!(sender_id, 1);
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    send(&mut bob, "{not json").await;
    assert!(matches!(next_frame(&mut bob).await, ServerFrame::Error { room_id: None, .. }));

    send(&mut bob, r#"{"type":"message","room_id":8,"content":"nope"}"#).await;
    assert!(matches!(next_frame(&mut bob).await, ServerFrame::Error { room_id: Some(8), .. }));

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_upgrade_requires_identity() {
    let server = start().await;

    for user in [None, Some("alice")] {
        match connect(server.addr, user).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
            Err(e) => panic!("expected 401, got {e}"),
            Ok(_) => panic!("upgrade accepted without a valid identity"),
        }
    }

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let server = start().await;
    let mut client = connect(server.addr, Some("1")).await.unwrap();
    send(&mut client, r#"{"type":"join_room","room_id":7}"#).await;
    next_frame(&mut client).await;

    server.stop.send(()).unwrap();
    loop {
        match client.next().await {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
    server.task.await.unwrap().unwrap();
}
