//! Randomized property tests for the expansion rule and table lookups,
//! using proptest for input generation.

use corriente_core::{Sig, TableData, expansion_len};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// The stream count of a parameter set is the maximum fan length.
    #[test]
    fn expansion_is_max_fan_length(lens in prop::collection::vec(1usize..9, 1..6)) {
        let sigs: Vec<Sig> = lens
            .iter()
            .map(|&n| Sig::List(vec![0.0; n]))
            .collect();
        let refs: Vec<&Sig> = sigs.iter().collect();
        prop_assert_eq!(expansion_len(&refs).unwrap(), *lens.iter().max().unwrap());
    }

    /// Shorter lists wrap; they never zero-pad and never error.
    #[test]
    fn list_values_wrap_modulo_length(
        values in prop::collection::vec(-100.0f64..100.0, 1..8),
        voice in 0usize..64,
    ) {
        let sig = Sig::List(values.clone());
        prop_assert_eq!(sig.scalar_at(voice).unwrap(), values[voice % values.len()]);
    }

    /// A scalar argument is the same for every voice.
    #[test]
    fn scalar_constant_across_voices(value in -1e6f64..1e6, voice in 0usize..64) {
        prop_assert_eq!(Sig::Num(value).scalar_at(voice).unwrap(), value);
    }

    /// Wrapping table reads are periodic in the table length.
    #[test]
    fn wrap_lookup_is_periodic(pos in 0.0f64..500.0, periods in 1u32..8) {
        let data = TableData::new(
            vec![(0..64).map(|i| (i as f32 / 64.0).sin()).collect()],
            1.0,
        )
        .unwrap();
        let shifted = pos + f64::from(periods) * 64.0;
        let a = data.lookup_wrap(0, pos);
        let b = data.lookup_wrap(0, shifted);
        prop_assert!((a - b).abs() < 1e-4, "a={a} b={b}");
    }

    /// Clamping table reads never exceed the table's value range.
    #[test]
    fn clamp_lookup_stays_in_range(pos in -1e4f64..1e4) {
        let data = TableData::new(vec![vec![-1.0, 0.5, 1.0, 0.25]], 1.0).unwrap();
        let v = data.lookup_clamp(0, pos);
        prop_assert!((-1.0..=1.0).contains(&v));
    }
}
