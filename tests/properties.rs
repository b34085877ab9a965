use dcmprobe::keys::{apply_xor, recover_key, shortest_period, xor_bytes, KeyOptions};
use dcmprobe::mesh::{MeshSample, Vertex};
use dcmprobe::stats::{entropy, join_segments, segment};
use proptest::prelude::*;

fn vertex() -> impl Strategy<Value = Vertex> {
    (-500i32..500, -500i32..500, -500i32..500)
        .prop_map(|(x, y, z)| Vertex::new(x as f32 / 8.0, y as f32 / 8.0, z as f32 / 8.0))
}

proptest! {
    #[test]
    fn entropy_is_bounded(data in prop::collection::vec(any::<u8>(), 1..2048)) {
        let h = entropy(&data);
        prop_assert!((0.0..=8.0).contains(&h));
    }

    #[test]
    fn constant_bytes_have_zero_entropy(b in any::<u8>(), len in 1usize..512) {
        prop_assert_eq!(entropy(&vec![b; len]), 0.0);
    }

    #[test]
    fn xor_difference_is_self_inverse(
        pair in prop::collection::vec((any::<u8>(), any::<u8>()), 0..512)
    ) {
        let (p, r): (Vec<u8>, Vec<u8>) = pair.into_iter().unzip();
        let x = xor_bytes(&p, &r);
        prop_assert_eq!(apply_xor(&p, &x), r.clone());
        prop_assert_eq!(apply_xor(&r, &x), p);
    }

    #[test]
    fn segments_rejoin_to_the_payload(
        data in prop::collection::vec(0u8..16, 0..1024),
        marker in 0u8..16,
    ) {
        prop_assert_eq!(join_segments(&segment(&data, marker), marker), data);
    }

    #[test]
    fn canonicalization_is_idempotent(
        tris in prop::collection::vec([vertex(), vertex(), vertex()], 1..64),
        reuse in prop::collection::vec((any::<prop::sample::Index>(), any::<prop::sample::Index>()), 0..64),
    ) {
        // Repeat some triangles so shared vertices actually occur.
        let mut stream = tris.clone();
        for (t, s) in reuse {
            let mut tri = *t.get(&tris);
            tri[0] = s.get(&tris)[1];
            stream.push(tri);
        }
        let once = MeshSample::canonicalize(stream.iter().copied(), 6);
        let twice = once.recanonicalize(6);
        prop_assert_eq!(&twice, &once);
        prop_assert!(once.is_consistent());
        prop_assert_eq!(once.faces.len(), stream.len());
    }

    #[test]
    fn repeating_key_period_never_exceeds_key_length(
        key in prop::collection::vec(any::<u8>(), 1..24),
        repeats in 2usize..12,
    ) {
        let x: Vec<u8> = key.iter().copied().cycle().take(key.len() * repeats).collect();
        let period = shortest_period(&x, 256).unwrap();
        prop_assert!(period <= key.len());
        prop_assert_eq!(key.len() % period, 0);
        prop_assert!(x.iter().enumerate().all(|(i, &b)| b == x[i % period]));
    }

    #[test]
    fn confirmed_hypothesis_always_replays_exactly(
        reference in prop::collection::vec(any::<u8>(), 24..384),
        key in prop::collection::vec(any::<u8>(), 1..16),
        corrupt in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut payload = apply_xor(&reference, &key);
        let at = corrupt.index(payload.len());
        payload[at] ^= flip;

        let report = recover_key(&payload, &reference, None, &KeyOptions::default());
        if report.is_confirmed() {
            prop_assert_eq!(report.hypothesis.decode(&payload), Some(reference.clone()));
        }
        for attempt in &report.attempts {
            if attempt.verdict.is_confirmed() {
                prop_assert_eq!(Some(attempt.kind), report.hypothesis.kind());
            }
        }
    }
}
