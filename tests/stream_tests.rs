//! Session stream over a real WebSocket.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use xpctl::bridge::Frame;
use xpctl::remote::spawn_websocket_io;

const TIMEOUT: Duration = Duration::from_secs(5);

fn decode_one(data: &[u8]) -> Frame {
    let mut buf = BytesMut::from(data);
    Frame::decode(&mut buf).unwrap().unwrap()
}

#[tokio::test]
async fn test_frames_cross_websocket_and_remote_close_ends_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        // Two frames in one message, the second split across messages
        let mut first = Frame::Data(Bytes::from_static(b"login: ")).encode().to_vec();
        let exit = Frame::Exit(0).encode();
        first.extend_from_slice(&exit[..2]);
        ws.send(Message::Binary(first)).await.unwrap();

        let typed = loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => break decode_one(&data),
                Some(Ok(_)) => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        };

        ws.send(Message::Binary(exit[2..].to_vec())).await.unwrap();
        ws.close(None).await.unwrap();
        typed
    });

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/shell/stream", addr))
        .await
        .unwrap();
    let mut stream = spawn_websocket_io(ws, "test".to_string());

    let first = tokio::time::timeout(TIMEOUT, stream.incoming.recv()).await.unwrap();
    assert_eq!(first, Some(Frame::Data(Bytes::from_static(b"login: "))));

    stream
        .outgoing
        .send(Frame::Data(Bytes::from_static(b"root\n")))
        .await
        .unwrap();

    let exit = tokio::time::timeout(TIMEOUT, stream.incoming.recv()).await.unwrap();
    assert_eq!(exit, Some(Frame::Exit(0)));

    // Remote close surfaces as the end of the incoming channel
    let end = tokio::time::timeout(TIMEOUT, stream.incoming.recv()).await.unwrap();
    assert_eq!(end, None);

    assert_eq!(
        server.await.unwrap(),
        Frame::Data(Bytes::from_static(b"root\n"))
    );
}

#[tokio::test]
async fn test_local_close_sends_close_message() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return false,
            }
        }
    });

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
        .await
        .unwrap();
    let stream = spawn_websocket_io(ws, "test".to_string());
    stream.close();

    let closed = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
    assert!(closed);
}
