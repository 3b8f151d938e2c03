//! Randomized register/open/release interleavings against a counting model.

use std::collections::HashMap;

use proptest::prelude::*;
use scopewire_buffer::{BufferMeta, BufferRegistry, MappedBuffer, RegistryConfig, ShmRegion};

const CLIENTS: usize = 3;
const PAYLOAD: &[u8] = b"frame-0001";

#[derive(Debug, Clone)]
enum Op {
    /// Server hands the buffer to a client.
    Register(usize),
    /// Client maps the buffer it was handed.
    Open(usize),
    /// Client confirms with release-pending.
    Confirm(usize),
    /// Client drops its mapping.
    Close(usize),
    /// Client connection is lost.
    Disconnect(usize),
    /// Producer takes or drops an extra handle.
    Share,
    Unshare,
    /// Producer drops its original handle.
    ProducerRelease,
}

fn op() -> impl Strategy<Value = Op> {
    let client = 0..CLIENTS;
    prop_oneof![
        client.clone().prop_map(Op::Register),
        client.clone().prop_map(Op::Open),
        client.clone().prop_map(Op::Confirm),
        client.clone().prop_map(Op::Close),
        client.prop_map(Op::Disconnect),
        Just(Op::Share),
        Just(Op::Unshare),
        Just(Op::ProducerRelease),
    ]
}

fn owner(client: usize) -> String {
    format!("peer-{client}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn buffer_lives_exactly_while_referenced(ops in prop::collection::vec(op(), 1..40)) {
        let registry = BufferRegistry::new(RegistryConfig {
            prefix: format!("sw-prop-{}", std::process::id()),
            ..RegistryConfig::default()
        });
        let mut original = Some(registry.create(BufferMeta::bytes(PAYLOAD.len())).unwrap());
        let name = original.as_ref().unwrap().name().to_string();
        original.as_mut().unwrap().write_at(0, PAYLOAD).unwrap();

        let mut shares = Vec::new();
        let mut pending: HashMap<usize, usize> = HashMap::new();
        let mut mappings: HashMap<usize, Vec<MappedBuffer>> = HashMap::new();
        let mut alive = true;

        for op in ops {
            match op {
                Op::Register(c) if alive => {
                    registry.register_for_transfer(&name, &owner(c)).unwrap();
                    *pending.entry(c).or_default() += 1;
                }
                Op::Open(c) if alive && pending.get(&c).copied().unwrap_or(0) > 0 => {
                    let mapping = MappedBuffer::open(&name).unwrap();
                    mappings.entry(c).or_default().push(mapping);
                }
                Op::Confirm(c) if pending.get(&c).copied().unwrap_or(0) > 0 => {
                    registry.release_pending(&name, &owner(c)).unwrap();
                    *pending.entry(c).or_default() -= 1;
                }
                Op::Confirm(c) => {
                    prop_assert!(registry.release_pending(&name, &owner(c)).is_err());
                }
                Op::Close(c) => {
                    if let Some(list) = mappings.get_mut(&c) {
                        list.pop();
                    }
                }
                Op::Disconnect(c) => {
                    let expected = pending.remove(&c).unwrap_or(0);
                    prop_assert_eq!(registry.reclaim_owner(&owner(c)), expected);
                }
                Op::Share => {
                    if let Some(buffer) = original.as_ref().filter(|_| alive) {
                        shares.push(buffer.share().unwrap());
                    }
                }
                Op::Unshare => {
                    if let Some(share) = shares.pop() {
                        share.release().unwrap();
                    }
                }
                Op::ProducerRelease => {
                    if let Some(buffer) = original.take() {
                        buffer.release().unwrap();
                    }
                }
                _ => {}
            }

            let refs = usize::from(original.is_some()) + shares.len();
            let handoffs: usize = pending.values().sum();
            let should_live = refs + handoffs > 0;
            if alive && !should_live {
                alive = false;
            }
            // Once torn down it stays torn down; while referenced it exists.
            prop_assert_eq!(registry.contains(&name), alive);
            prop_assert_eq!(ShmRegion::exists(&name), alive);
            if alive {
                let counts = registry.counts(&name).unwrap();
                prop_assert_eq!(counts.refcount, refs);
                prop_assert_eq!(counts.pending, handoffs);
            }
            // Every mapping a client still holds reads intact data.
            for mapping in mappings.values().flatten() {
                prop_assert_eq!(mapping.data(), PAYLOAD);
            }
        }

        drop(shares);
        drop(original);
        let leftover: usize = pending.values().sum();
        if leftover > 0 {
            for c in 0..CLIENTS {
                registry.reclaim_owner(&owner(c));
            }
        }
        prop_assert!(!ShmRegion::exists(&name));
        prop_assert!(registry.is_empty());
    }
}
