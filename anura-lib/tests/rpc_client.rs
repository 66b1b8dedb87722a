//! Integration tests for the transceiver RPC client against a scripted
//! TCP peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anura_lib::cbor::{self, Value};
use anura_lib::transceiver::models::ScanNodesReceivedEvent;
use anura_lib::{BluetoothAddrLE, Marshal, Notification, RpcError, TransceiverClient};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_frame(stream: &mut TcpStream) -> Option<Value> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.ok()?;
    let len = u16::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.ok()?;
    Some(cbor::from_slice(&payload).unwrap())
}

async fn write_frame(stream: &mut TcpStream, value: &Value) {
    let payload = cbor::to_vec(value).unwrap();
    stream
        .write_all(&(payload.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&payload).await.unwrap();
}

fn response(token: &Value, error: Value, result: Value) -> Value {
    Value::Array(vec![Value::Int(1), token.clone(), error, result])
}

fn notification(notification_type: &str, argument: Value) -> Value {
    Value::Array(vec![
        Value::Int(2),
        Value::Text(notification_type.into()),
        argument,
    ])
}

/// Serve the standard handshake plus a small method repertoire. Returns
/// once the client disconnects.
async fn serve(mut stream: TcpStream, ping_seen_by_id: Arc<AtomicBool>) {
    while let Some(message) = read_frame(&mut stream).await {
        let items = message.as_array().expect("request is not an array");
        let [Value::Int(0), token, method, _arg] = items else {
            panic!("unexpected message: {items:?}");
        };

        match method {
            Value::Text(name) if name == ".well-known/methods" => {
                let table = Value::Map(vec![
                    (Value::Text("ping".into()), Value::Int(10)),
                    (Value::Text("get_time".into()), Value::Int(11)),
                    (Value::Text("scan_nodes".into()), Value::Int(12)),
                ]);
                write_frame(&mut stream, &response(token, Value::Null, table)).await;
            }
            // After discovery the client must substitute the integer id.
            Value::Int(10) => {
                ping_seen_by_id.store(true, Ordering::SeqCst);
                write_frame(&mut stream, &response(token, Value::Null, Value::Null)).await;
            }
            // Keep-alive pings racing the discovery handshake still use
            // the method name.
            Value::Text(name) if name == "ping" => {
                write_frame(&mut stream, &response(token, Value::Null, Value::Null)).await;
            }
            Value::Int(11) => {
                // A response with an unknown token must be discarded
                // without completing anything.
                write_frame(
                    &mut stream,
                    &response(&Value::Int(99), Value::Null, Value::Null),
                )
                .await;
                let result = Value::Map(vec![(Value::Int(0), Value::Int(12345))]);
                write_frame(&mut stream, &response(token, Value::Null, result)).await;
            }
            Value::Int(12) => {
                write_frame(&mut stream, &response(token, Value::Null, Value::Null)).await;
                let event = ScanNodesReceivedEvent {
                    address: "a1:b2:c3:d4:e5:f6/random".parse().unwrap(),
                    rssi: -60,
                    data: Bytes::from_static(&[0x02, 0x01, 0x06]),
                };
                write_frame(
                    &mut stream,
                    &notification("scan_nodes_received", event.marshal()),
                )
                .await;
                write_frame(
                    &mut stream,
                    &notification("weather_changed", Value::Text("sunny".into())),
                )
                .await;
            }
            Value::Text(name) if name == "fail_me" => {
                let error = Value::Map(vec![
                    (Value::Int(0), Value::Int(1)),
                    (Value::Int(1), Value::Int(2)),
                    (Value::Int(2), Value::Text("boom".into())),
                ]);
                write_frame(&mut stream, &response(token, error, Value::Null)).await;
            }
            Value::Text(name) if name == "hang_up" => {
                return;
            }
            other => panic!("unexpected method: {other:?}"),
        }
    }
}

async fn connect() -> (TransceiverClient, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let ping_seen_by_id = Arc::new(AtomicBool::new(false));
    let seen = ping_seen_by_id.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve(stream, seen).await;
    });
    let client = TransceiverClient::connect("127.0.0.1", port).await.unwrap();
    (client, ping_seen_by_id)
}

#[tokio::test]
async fn test_handshake_and_method_id_substitution() {
    let (client, ping_seen_by_id) = connect().await;

    client.ping().await.unwrap();
    assert!(
        ping_seen_by_id.load(Ordering::SeqCst),
        "ping was not sent with its discovered method id"
    );

    let time = client.get_time().await.unwrap();
    assert_eq!(time.time, 12345);

    client.close().await;
}

#[tokio::test]
async fn test_request_error_response() {
    let (client, _) = connect().await;

    match client.request("fail_me", Value::Null).await {
        Err(RpcError::Request { method, error }) => {
            assert_eq!(method, "fail_me");
            assert!(error.as_map().is_some());
        }
        other => panic!("unexpected result: {other:?}"),
    }

    client.close().await;
}

#[tokio::test]
async fn test_notification_fanout_and_unknown_type() {
    let (client, _) = connect().await;

    let mut first = client.notifications();
    let mut second = client.notifications();

    client.scan_nodes().await.unwrap();

    let expected_addr: BluetoothAddrLE = "a1:b2:c3:d4:e5:f6/random".parse().unwrap();
    for stream in [&mut first, &mut second] {
        match stream.recv().await.unwrap() {
            Notification::ScanNodesReceived(event) => {
                assert_eq!(event.address, expected_addr);
                assert_eq!(event.rssi, -60);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
        match stream.recv().await.unwrap() {
            Notification::Unknown {
                notification_type, ..
            } => assert_eq!(notification_type, "weather_changed"),
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    client.close().await;
}

#[tokio::test]
async fn test_disconnect_fails_pending_and_streams() {
    let (client, _) = connect().await;
    let mut notifications = client.notifications();

    // The server hangs up without answering this request.
    match client.request("hang_up", Value::Null).await {
        Err(RpcError::Disconnected) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    assert!(matches!(
        notifications.recv().await,
        Err(RpcError::Disconnected)
    ));
    assert!(client.is_disconnected());
}
