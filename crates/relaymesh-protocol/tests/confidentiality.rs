//! What an intermediate relay can and cannot read off the wire.

mod common;

use common::{init_tracing, link, Mesh};
use relaymesh_protocol::crypto;
use relaymesh_protocol::procedures::n2n::{JoinRequest, N2NProcedure, N2NQuery};
use relaymesh_protocol::procedures::s2g::{S2GMessage, S2GQuery};
use relaymesh_protocol::procedures::{compose_envelope, open_envelope, protocol_of, Protocol};
use relaymesh_protocol::{
    AgentId, DeviceId, GatewayKeys, InitialDevice, NodeRelay, ProtocolError, RouteId,
};
use relaymesh_transport::QualityOfService;

const A: AgentId = AgentId::new(0xc0);

fn reassemble(chunks: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut qos = QualityOfService::new();
    chunks
        .iter()
        .filter_map(|c| qos.push_received(c).unwrap())
        .collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[tokio::test]
async fn join_request_opens_only_at_the_gateway() {
    init_tracing();
    let mesh = Mesh::new();
    // Nobody reads "up": the test inspects what the node sent.
    let config = mesh
        .node_config(A)
        .initial_device(InitialDevice::channel(mesh.memory, link("down", "up")));
    let a = NodeRelay::start(config, mesh.registry.clone()).await.unwrap();

    let packets = reassemble(mesh.hub.take("up"));
    assert_eq!(packets.len(), 1);
    let envelope = &packets[0];
    assert!(!contains(envelope, a.public_key().as_bytes()));

    // Any relay holding the broadcast key sees an N2N join from A ...
    let plain = open_envelope(envelope, &mesh.keys.broadcast_key).unwrap();
    assert_eq!(protocol_of(&plain).unwrap(), Protocol::N2N);
    let query = N2NQuery::parse(&plain).unwrap();
    assert_eq!(query.procedure, N2NProcedure::InitializeRoute);
    assert_eq!(query.sender.agent(), A);
    assert!(!contains(query.query, a.public_key().as_bytes()));

    // ... but only the Gateway's key opens the request itself.
    let (other_private, other_public) = crypto::generate_encryption_keys();
    let err = JoinRequest::open(query.query, &other_public, &other_private).unwrap_err();
    assert!(matches!(err, ProtocolError::Integrity(_)));

    let gateway_private = mesh.keys.signature.to_encryption_key();
    let gateway_public = mesh.keys.public_signature.to_encryption_key().unwrap();
    let request = JoinRequest::open(query.query, &gateway_public, &gateway_private).unwrap();
    assert_eq!(request.public_key, *a.public_key());
    assert_eq!(request.type_hash, mesh.memory);

    // A relay of another deployment cannot even read the tag.
    let stranger = GatewayKeys::generate();
    assert!(open_envelope(envelope, &stranger.broadcast_key).is_err());

    a.shutdown().await;
}

#[tokio::test]
async fn s2g_content_is_hidden_from_relays() {
    init_tracing();
    let mesh = Mesh::new();
    let config = mesh
        .node_config(A)
        .initial_device(InitialDevice::channel(mesh.memory, link("down", "up")));
    let a = NodeRelay::start(config, mesh.registry.clone()).await.unwrap();
    mesh.hub.take("up");

    let secret = b"operator eyes only".to_vec();
    a.send_to_gateway(S2GMessage::Notification {
        blob: secret.clone(),
    })
    .await
    .unwrap();

    let packets = reassemble(mesh.hub.take("up"));
    assert_eq!(packets.len(), 1);
    let plain = open_envelope(&packets[0], &mesh.keys.broadcast_key).unwrap();
    assert_eq!(protocol_of(&plain).unwrap(), Protocol::S2G);
    assert!(!contains(&plain, &secret));

    let (other_private, other_public) = crypto::generate_encryption_keys();
    assert!(S2GQuery::open(&plain, &other_public, &other_private).is_err());

    let gateway_private = mesh.keys.signature.to_encryption_key();
    let gateway_public = mesh.keys.public_signature.to_encryption_key().unwrap();
    let query = S2GQuery::open(&plain, &gateway_public, &gateway_private).unwrap();
    assert_eq!(query.sender.agent(), A);
    assert_eq!(query.message, S2GMessage::Notification { blob: secret });

    a.shutdown().await;
}

#[tokio::test]
async fn wrapped_join_request_needs_the_gateway_key() {
    init_tracing();
    let mesh = Mesh::new();
    let config = mesh
        .node_config(A)
        .initial_device(InitialDevice::channel(mesh.memory, link("down", "up")));
    let a = NodeRelay::start(config, mesh.registry.clone()).await.unwrap();
    let packets = reassemble(mesh.hub.take("up"));
    let plain = open_envelope(&packets[0], &mesh.keys.broadcast_key).unwrap();
    let join = N2NQuery::parse(&plain).unwrap();
    let sealed_request = join.query.to_vec();

    // What an intermediate relay sends upstream for a child joining through it.
    let parent = RouteId::new(AgentId::new(0xc1), DeviceId::new(1));
    let wrapper = S2GQuery::new(
        parent,
        0,
        S2GMessage::InitializeRoute {
            child: join.sender,
            child_side_device: DeviceId::new(2),
            blob: sealed_request.clone(),
        },
    )
    .compose(&mesh.keys.public_signature.to_encryption_key().unwrap())
    .unwrap();
    let envelope = compose_envelope(&wrapper, &mesh.keys.broadcast_key).unwrap();

    // The broadcast key opens the tag layer and nothing below it.
    let opened = open_envelope(&envelope, &mesh.keys.broadcast_key).unwrap();
    assert_eq!(protocol_of(&opened).unwrap(), Protocol::S2G);
    let err = crypto::decrypt_anonymously(&opened[1..], &mesh.keys.broadcast_key).unwrap_err();
    assert!(matches!(err, ProtocolError::Integrity(_)));
    let err = crypto::decrypt_anonymously(&sealed_request, &mesh.keys.broadcast_key).unwrap_err();
    assert!(matches!(err, ProtocolError::Integrity(_)));

    let gateway_private = mesh.keys.signature.to_encryption_key();
    let gateway_public = mesh.keys.public_signature.to_encryption_key().unwrap();
    let query = S2GQuery::open(&opened, &gateway_public, &gateway_private).unwrap();
    let S2GMessage::InitializeRoute { blob, .. } = query.message else {
        panic!("expected an InitializeRoute wrapper");
    };
    let request = JoinRequest::open(&blob, &gateway_public, &gateway_private).unwrap();
    assert_eq!(request.public_key, *a.public_key());

    a.shutdown().await;
}
