//! Property tests for correction outputs and streaming statistics.

use ndarray::{Array2, Array4};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use sparc_preprocess::{compute_background, BackgroundMethod, ImageVolume, MethodParams, RunningStats};

fn plane() -> impl Strategy<Value = Array2<f64>> {
    (2usize..12, 2usize..12).prop_flat_map(|(rows, cols)| {
        prop::collection::vec(0.0f64..4000.0, rows * cols)
            .prop_map(move |values| Array2::from_shape_vec((rows, cols), values).unwrap_or_default())
    })
}

fn method_params() -> impl Strategy<Value = MethodParams> {
    prop_oneof![
        (0i64..6).prop_map(|r| MethodParams::from_values(BackgroundMethod::Basic, &object(json!({"rolling_ball_radius": r})))),
        (0i64..7).prop_map(|o| MethodParams::from_values(BackgroundMethod::Polynomial, &object(json!({"order": o})))),
        (0i64..5).prop_map(|r| MethodParams::from_values(BackgroundMethod::Morphological, &object(json!({"opening_radius": r})))),
        (1i64..12, -50.0f64..50.0, prop::bool::ANY).prop_map(|(b, offset, mean)| {
            let method = if mean { "mean" } else { "gaussian" };
            MethodParams::from_values(
                BackgroundMethod::Adaptive,
                &object(json!({"block_size": b, "offset": offset, "method": method})),
            )
        }),
    ]
}

fn object(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap_or_default()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-7 * (1.0 + a.abs().max(b.abs()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn corrected_is_never_negative(image in plane(), params in method_params()) {
        let out = params.correct_plane(image.view());
        prop_assert_eq!(out.corrected.dim(), image.dim());
        for v in out.corrected.iter() {
            prop_assert!(*v >= 0.0, "negative corrected value {} for {:?}", v, params);
        }
    }

    #[test]
    fn merge_is_order_independent(
        a in prop::collection::vec(-1e3f64..1e3, 0..40),
        b in prop::collection::vec(-1e3f64..1e3, 0..40),
        c in prop::collection::vec(-1e3f64..1e3, 1..40),
    ) {
        let (sa, sb, sc) = (
            RunningStats::from_values(&a),
            RunningStats::from_values(&b),
            RunningStats::from_values(&c),
        );
        let left = sa.merge(sb).merge(sc).finish();
        let right = sa.merge(sb.merge(sc)).finish();
        let all: Vec<f64> = a.iter().chain(&b).chain(&c).copied().collect();
        let whole = RunningStats::from_values(&all).finish();

        prop_assert!(close(left.mean, right.mean) && close(left.mean, whole.mean));
        prop_assert!(close(left.std, right.std) && close(left.std, whole.std));
        prop_assert_eq!(left.min, whole.min);
        prop_assert_eq!(left.max, whole.max);
    }

    #[test]
    fn selected_channels_define_output_axis(selection in prop::collection::vec(0usize..3, 1..5)) {
        let volume = ImageVolume::from(Array4::from_shape_fn((3, 1, 8, 8), |(c, _, y, x)| (c * 50 + y + x) as u16));
        let out = compute_background(&volume, "basic", &object(json!({"rolling_ball_radius": 0})), Some(&selection)).unwrap();
        prop_assert_eq!(out.corrected.dim().0, selection.len());
        prop_assert_eq!(out.background.dim().0, selection.len());
        prop_assert_eq!(out.qc_metrics.per_channel.len(), selection.len());
    }
}
