//! Operator session over TCP: key exchange, capability frame, requests.

mod common;

use std::time::Duration;

use common::{init_tracing, Mesh};
use relaymesh_protocol::crypto::{self, ExchangePublicKey, SessionKeys};
use relaymesh_protocol::{ApiBridge, ProtocolError};
use relaymesh_transport::{read_framed, write_framed, DEFAULT_MAX_FRAME_SIZE, MEMORY_CHANNEL};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

async fn recv(stream: &mut TcpStream, keys: &SessionKeys) -> Value {
    let frame = tokio::time::timeout(
        Duration::from_secs(5),
        read_framed(stream, DEFAULT_MAX_FRAME_SIZE),
    )
    .await
    .expect("response in time")
    .unwrap()
    .expect("open stream");
    let plain = crypto::decrypt_session(&frame, &keys.rx).unwrap();
    serde_json::from_slice(&plain).unwrap()
}

async fn send(stream: &mut TcpStream, keys: &SessionKeys, message: Value) {
    let frame = crypto::encrypt_session(&serde_json::to_vec(&message).unwrap(), &keys.tx).unwrap();
    write_framed(stream, &frame).await.unwrap();
}

/// Operator side of the handshake: the Gateway speaks first.
async fn handshake(stream: &mut TcpStream) -> SessionKeys {
    let gateway = read_framed(stream, 64).await.unwrap().unwrap();
    let gateway = ExchangePublicKey::from_slice(&gateway).unwrap();
    let (private, public) = crypto::generate_exchange_keys();
    write_framed(stream, public.as_bytes()).await.unwrap();
    crypto::server_session_keys(&private, &public, &gateway).unwrap()
}

#[tokio::test]
async fn operator_session_round_trip() {
    init_tracing();
    let mesh = Mesh::new();
    let gate = mesh.gateway();
    let bridge = ApiBridge::bind("127.0.0.1:0").await.unwrap();
    let address = bridge.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(bridge.serve(gate.clone(), cancel.clone()));

    let mut stream = TcpStream::connect(address).await.unwrap();
    let keys = handshake(&mut stream).await;

    let capability = recv(&mut stream, &keys).await;
    assert_eq!(capability["MessageType"], "GetCapability");
    let channels = capability["MessageData"]["channels"].as_array().unwrap();
    assert!(channels.iter().any(|c| c["name"] == MEMORY_CHANNEL));

    send(
        &mut stream,
        &keys,
        json!({
            "MessageType": "Action",
            "SequenceNumber": 1,
            "MessageData": {
                "Action": "GatewayCommand",
                "Command": {
                    "Command": "AddDevice",
                    "TypeName": MEMORY_CHANNEL,
                    "Arguments": ["op-in", "op-out"],
                },
            },
        }),
    )
    .await;
    let response = recv(&mut stream, &keys).await;
    assert_eq!(response["SequenceNumber"], 1);
    assert!(response.get("Error").is_none(), "{response}");

    send(
        &mut stream,
        &keys,
        json!({
            "MessageType": "Action",
            "SequenceNumber": 2,
            "MessageData": { "Action": "GetAgents" },
        }),
    )
    .await;
    let response = recv(&mut stream, &keys).await;
    assert_eq!(response["SequenceNumber"], 2);
    assert_eq!(
        response["MessageData"]["Gateway"]["Devices"]
            .as_array()
            .unwrap()
            .len(),
        1
    );

    drop(stream);
    cancel.cancel();
    server.await.unwrap();
    gate.shutdown().await;
}

#[tokio::test]
async fn undecryptable_frames_are_dropped() {
    init_tracing();
    let mesh = Mesh::new();
    let gate = mesh.gateway();
    let bridge = ApiBridge::bind("127.0.0.1:0").await.unwrap();
    let address = bridge.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(bridge.serve(gate.clone(), cancel.clone()));

    let mut stream = TcpStream::connect(address).await.unwrap();
    let keys = handshake(&mut stream).await;
    recv(&mut stream, &keys).await;

    write_framed(&mut stream, b"not encrypted at all, not even close")
        .await
        .unwrap();
    send(
        &mut stream,
        &keys,
        json!({ "MessageType": "Action", "SequenceNumber": 5, "MessageData": { "Action": "GetAgents" } }),
    )
    .await;
    let response = recv(&mut stream, &keys).await;
    assert_eq!(response["SequenceNumber"], 5);

    drop(stream);
    cancel.cancel();
    server.await.unwrap();
    gate.shutdown().await;
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let first = ApiBridge::bind("127.0.0.1:0").await.unwrap();
    let taken = first.local_addr().unwrap().to_string();
    let err = ApiBridge::bind(&taken).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Io(_)));
}
