//! Registry-built memory channels exchanging fragmented packets.

use std::time::Duration;

use relaymesh_transport::{
    ByteWriter, Device, InterfaceRegistry, MemoryHub, QualityOfService, TransportError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

fn channel_args(inbound: &str, outbound: &str, max: u32) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_str(inbound).write_str(outbound).write_u32(max);
    w.into_vec()
}

#[tokio::test]
async fn registry_channels_carry_fragmented_packets() {
    init_tracing();
    let hub = MemoryHub::new();
    let mut registry = InterfaceRegistry::new();
    let hash = hub.register(&mut registry);

    let Device::Channel(left) = registry.build_device(hash, &channel_args("l", "r", 20)).unwrap()
    else {
        panic!("expected a channel");
    };
    let Device::Channel(right) = registry.build_device(hash, &channel_args("r", "l", 0)).unwrap()
    else {
        panic!("expected a channel");
    };

    let payload: Vec<u8> = (0..200u8).collect();
    let mut out_qos = QualityOfService::new();
    let mut splitter = out_qos.splitter(payload.clone());
    while splitter.has_more() {
        let chunk = splitter.next_chunk(None);
        let sent = left.send(&chunk).await.unwrap();
        splitter.update(sent).unwrap();
    }

    let mut in_qos = QualityOfService::new();
    let received = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            for chunk in right.receive().await.unwrap() {
                if let Some(p) = in_qos.push_received(&chunk).unwrap() {
                    return p;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("packet should arrive");
    assert_eq!(received, payload);
}

#[tokio::test]
async fn transport_smaller_than_header_makes_no_progress() {
    let hub = MemoryHub::new();
    let mut registry = InterfaceRegistry::new();
    let hash = hub.register(&mut registry);
    let Device::Channel(tiny) = registry.build_device(hash, &channel_args("x", "y", 4)).unwrap()
    else {
        panic!("expected a channel");
    };

    let mut qos = QualityOfService::new();
    let mut splitter = qos.splitter(b"payload".to_vec());
    let sent = tiny.send(&splitter.next_chunk(None)).await.unwrap();
    assert!(matches!(splitter.update(sent), Err(TransportError::Send(_))));
}
