use latent_exchange::*;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn sequence(max_len: usize, dim: usize) -> impl Strategy<Value = Vec<Vec<f32>>> {
    proptest::collection::vec(proptest::collection::vec(-3.0f32..3.0, dim), 1..max_len)
}

fn cache_inputs() -> impl Strategy<Value = (Vec<Vec<f32>>, Vec<Vec<f32>>, Vec<Vec<f32>>)> {
    (1usize..6).prop_flat_map(|dim| {
        sequence(60, dim).prop_flat_map(move |keys| {
            let n = keys.len();
            (
                Just(keys),
                proptest::collection::vec(proptest::collection::vec(-3.0f32..3.0, dim), n),
                sequence(4, dim),
            )
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_compression_roundtrip(
        (keys, values, queries) in cache_inputs(),
        threshold in 0.05f32..1.0,
    ) {
        let config = CompressionConfig { attention_threshold: threshold, ..Default::default() };
        let out = kv_cache::compress(&keys, &values, &queries, &config).unwrap();
        let n = keys.len();
        let kept = out.compressed.len();

        prop_assert!(kept >= config.min_tokens.min(n));
        prop_assert!(kept <= config.max_tokens.min(n));
        prop_assert!(out.compressed.selected_indices().windows(2).all(|w| w[0] < w[1]));

        let full = kv_cache::decompress(&out.compressed, n).unwrap();
        let selected: BTreeSet<usize> = out.compressed.selected_indices().iter().copied().collect();
        for i in 0..n {
            if selected.contains(&i) {
                prop_assert_eq!(&full.keys[i], &keys[i]);
                prop_assert_eq!(&full.values[i], &values[i]);
            } else {
                prop_assert!(full.keys[i].iter().all(|x| *x == 0.0));
                prop_assert!(full.values[i].iter().all(|x| *x == 0.0));
            }
        }
    }

    #[test]
    fn prop_compression_monotone_in_threshold(
        (keys, values, queries) in cache_inputs(),
        a in 0.05f32..1.0,
        b in 0.05f32..1.0,
    ) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let low = kv_cache::compress(&keys, &values, &queries,
            &CompressionConfig { attention_threshold: lo, min_tokens: 1, ..Default::default() }).unwrap();
        let high = kv_cache::compress(&keys, &values, &queries,
            &CompressionConfig { attention_threshold: hi, min_tokens: 1, ..Default::default() }).unwrap();

        prop_assert!(low.stats.compressed_tokens <= high.stats.compressed_tokens);
        prop_assert!(low.stats.cumulative_attention <= high.stats.cumulative_attention + 1e-6);
        let high_set: BTreeSet<usize> = high.compressed.selected_indices().iter().copied().collect();
        prop_assert!(low.compressed.selected_indices().iter().all(|i| high_set.contains(i)));
    }

    #[test]
    fn prop_matrix_roundtrip_bit_identical(
        source_dim in 1usize..24,
        target_dim in 1usize..24,
        act in 0u8..4,
        vector_seed in proptest::collection::vec(-2.0f32..2.0, 24),
    ) {
        let aligner = WMatrixAligner::new(AlignmentConfig { seed: Some(3), ..Default::default() });
        let activation = Activation::from_u8(act).unwrap();
        let id = aligner.create("src", "dst", source_dim, target_dim, Some(activation)).unwrap().matrix_id;

        let payload = aligner.serialize_with(&id, &EncodeOptions::compressed(1)).unwrap();
        let restored = aligner.deserialize(&payload).unwrap();

        let v = &vector_seed[..source_dim];
        let a = aligner.align(v, id).unwrap();
        let b = aligner.align(v, restored).unwrap();
        prop_assert_eq!(
            a.aligned_vector.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            b.aligned_vector.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
        );
        prop_assert_eq!(a.transformation_path, b.transformation_path);
    }

    #[test]
    fn prop_alignment_is_deterministic(
        vector in proptest::collection::vec(-5.0f32..5.0, 16),
    ) {
        let aligner = WMatrixAligner::new(AlignmentConfig { seed: Some(11), ..Default::default() });
        let id = aligner.create("a", "b", 16, 40, None).unwrap().matrix_id;
        let first = aligner.align(&vector, id.clone()).unwrap().aligned_vector;
        let second = aligner.align(&vector, id).unwrap().aligned_vector;
        prop_assert_eq!(first, second);
    }
}
