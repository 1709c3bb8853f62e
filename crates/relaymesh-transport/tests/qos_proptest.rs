//! Property tests for chunk fragmentation and reassembly.

use proptest::prelude::*;
use relaymesh_transport::qos::{fragment, HEADER_SIZE};
use relaymesh_transport::QualityOfService;

fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2048)
}

proptest! {
    #[test]
    fn any_arrival_order_reassembles(
        data in arb_payload(),
        limit in 1usize..300,
        seed in any::<u64>(),
    ) {
        let mut chunks = fragment(7, &data, limit);

        // deterministic shuffle driven by the seed
        let mut state = seed | 1;
        for i in (1..chunks.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = (state % (i as u64 + 1)) as usize;
            chunks.swap(i, j);
        }

        let mut qos = QualityOfService::new();
        let mut out = None;
        for chunk in &chunks {
            if let Some(p) = qos.push_received(chunk).unwrap() {
                prop_assert!(out.is_none(), "packet completed twice");
                out = Some(p);
            }
        }
        prop_assert_eq!(out.unwrap(), data);
        prop_assert_eq!(qos.pending(), 0);
    }

    #[test]
    fn chunks_respect_limit(data in arb_payload(), limit in 1usize..300) {
        let chunks = fragment(0, &data, limit);
        let expected = if data.is_empty() { 1 } else { data.len().div_ceil(limit) };
        prop_assert_eq!(chunks.len(), expected);
        for chunk in &chunks {
            prop_assert!(chunk.len() <= HEADER_SIZE + limit);
        }
    }

    #[test]
    fn interleaved_packets_do_not_mix(
        a in prop::collection::vec(any::<u8>(), 1..500),
        b in prop::collection::vec(any::<u8>(), 1..500),
        limit in 1usize..64,
    ) {
        let ca = fragment(1, &a, limit);
        let cb = fragment(2, &b, limit);
        let mut qos = QualityOfService::new();
        let mut done = Vec::new();
        let longest = ca.len().max(cb.len());
        for i in 0..longest {
            for chunks in [&ca, &cb] {
                if let Some(chunk) = chunks.get(i) {
                    if let Some(p) = qos.push_received(chunk).unwrap() {
                        done.push(p);
                    }
                }
            }
        }
        prop_assert_eq!(done.len(), 2);
        prop_assert!(done.contains(&a));
        prop_assert!(done.contains(&b));
    }
}
