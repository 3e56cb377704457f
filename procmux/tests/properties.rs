//! Property tests for framing, buffer growth, and job numbering.

use std::os::unix::net::UnixStream;
use std::time::Duration;

use procmux::bridge::kvvec::{self, KvVec, Ownership};
use procmux::bridge::{KEY_SEP, MSG_DELIM, PAIR_SEP};
use procmux::{ByteCache, WorkerChannel, WorkerId};
use proptest::prelude::*;

/// Payloads that cannot contain a NUL, so never the frame delimiter.
fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(1u8..=255, 0..64)
}

fn pairs_of(kvv: &KvVec<'_>) -> Vec<(Vec<u8>, Vec<u8>)> {
    kvv.iter()
        .map(|kv| (kv.key().to_vec(), kv.value().to_vec()))
        .collect()
}

#[derive(Debug, Clone)]
enum GrowOp {
    Grow(usize),
    Double,
}

fn grow_op() -> impl Strategy<Value = GrowOp> {
    prop_oneof![(0usize..5000).prop_map(GrowOp::Grow), Just(GrowOp::Double)]
}

proptest! {
    #[test]
    fn frames_come_out_in_order_for_any_chunking(
        payloads in prop::collection::vec(payload(), 0..20),
        chunk in 1usize..40,
    ) {
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend_from_slice(p);
            stream.extend_from_slice(MSG_DELIM);
        }

        let mut cache = ByteCache::new(8, 1 << 20);
        let mut frames = Vec::new();
        for piece in stream.chunks(chunk) {
            while cache.available() < piece.len() {
                cache.double().unwrap();
            }
            cache.extend_from_slice(piece).unwrap();
            while let Some(frame) = cache.extract_frame(MSG_DELIM) {
                frames.push(frame.to_vec());
            }
        }

        prop_assert_eq!(frames, payloads);
        prop_assert!(cache.is_empty());
    }

    #[test]
    fn capacity_never_exceeds_ceiling(
        initial in 0usize..2048,
        max in 1usize..16384,
        ops in prop::collection::vec(grow_op(), 1..30),
    ) {
        let mut cache = ByteCache::new(initial, max);
        prop_assert!(cache.capacity() <= max);

        for op in ops {
            let before = cache.capacity();
            let result = match op {
                GrowOp::Grow(n) => cache.grow(n).map(|()| cache.capacity()),
                GrowOp::Double => cache.double(),
            };
            prop_assert!(cache.capacity() <= max);
            match result {
                Ok(capacity) => {
                    prop_assert_eq!(capacity, cache.capacity());
                    prop_assert!(capacity >= before);
                }
                Err(e) => {
                    prop_assert_eq!(e.kind(), "capacity_exceeded");
                    prop_assert_eq!(cache.capacity(), before);
                }
            }
        }
    }

    #[test]
    fn encoded_pairs_decode_unchanged(
        pairs in prop::collection::vec(
            ("[a-z_]{1,12}", prop::collection::vec(1u8..=255, 0..32)),
            1..10,
        ),
    ) {
        let kvv: KvVec<'_> = pairs
            .iter()
            .map(|(k, v)| kvvec::KeyValue::new(k.as_bytes(), v.as_slice()))
            .collect();
        let encoded = kvvec::encode(&kvv, KEY_SEP, PAIR_SEP).unwrap();

        for ownership in [Ownership::Borrow, Ownership::Copy] {
            let decoded = kvvec::decode(&encoded, KEY_SEP, PAIR_SEP, ownership).unwrap();
            prop_assert_eq!(pairs_of(&decoded), pairs_of(&kvv));
        }
    }

    #[test]
    fn job_ids_count_every_attempt(
        commands in prop::collection::vec(prop::collection::vec(0u8..=127, 1..24), 1..16),
    ) {
        let (parent, _worker) = UnixStream::pair().unwrap();
        let mut channel = WorkerChannel::new(WorkerId::new(9), parent, ByteCache::default());
        channel.mark_active();

        for (expected, command) in commands.iter().enumerate() {
            let expected = expected as u64;
            match channel.send_job(command, Duration::from_secs(1)) {
                Ok(job_id) => prop_assert_eq!(job_id, expected),
                // Commands containing NUL cannot be framed.
                Err(_) => prop_assert!(command.contains(&0)),
            }
            prop_assert_eq!(channel.next_job_id(), expected + 1);
        }

        let sent = commands.iter().filter(|c| !c.contains(&0)).count() as u64;
        prop_assert_eq!(channel.stats().jobs_sent, sent);
    }
}
