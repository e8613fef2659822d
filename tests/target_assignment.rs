use ndarray::Array4;

use siamrpn::{
    BoxXyxy, CorrelationHead, GtInstance, HeadComponents, HeadConfig, SiamRpnError,
    SiameseRpnHead, TestConfig, TrainConfig,
};

const GRID: (usize, usize) = (25, 25);
const NUM_BASE: usize = 5;
const NUM_ANCHORS: usize = 25 * 25 * NUM_BASE;

fn make_head(seed: u64) -> SiameseRpnHead {
    let components = HeadComponents::with_level_heads(
        vec![CorrelationHead::passthrough()],
        vec![CorrelationHead::passthrough()],
        seed,
    );
    let config = HeadConfig {
        weighted_sum: false,
        train: TrainConfig {
            seed,
            ..TrainConfig::default()
        },
        test: TestConfig::default(),
    };
    SiameseRpnHead::new(components, config).unwrap()
}

fn positive_gt() -> GtInstance {
    // 64x64 box centered on the search region: matches the square base anchor
    // of the center cell exactly.
    GtInstance {
        bbox: BoxXyxy::new(95.0, 95.0, 159.0, 159.0),
        is_positive: true,
    }
}

#[test]
fn positive_pair_weight_masses_split_evenly() {
    let mut head = make_head(3);
    let targets = head.get_targets(&[positive_gt()], GRID).unwrap();

    let mut pos_mass = 0.0f32;
    let mut neg_mass = 0.0f32;
    let mut num_pos = 0usize;
    let mut num_ignored = 0usize;
    for i in 0..NUM_ANCHORS {
        let label = targets.labels[[0, i]];
        let weight = targets.label_weights[[0, i]];
        match label {
            1 => {
                pos_mass += weight;
                num_pos += 1;
            }
            0 => neg_mass += weight,
            _ => {
                num_ignored += 1;
                assert_eq!(weight, 0.0, "ignored anchor {i} carries weight");
                for k in 0..4 {
                    assert_eq!(targets.bbox_weights[[0, i, k]], 0.0);
                }
            }
        }
    }
    assert!(num_pos > 0);
    assert!(num_ignored > 0);
    assert!((pos_mass - 0.5).abs() < 1e-5, "positive mass {pos_mass}");
    assert!((neg_mass - 0.5).abs() < 1e-5, "negative mass {neg_mass}");

    // Box weights: all four components equal per anchor, total mass 1.
    let mut box_mass = 0.0f32;
    for i in 0..NUM_ANCHORS {
        let w0 = targets.bbox_weights[[0, i, 0]];
        for k in 1..4 {
            assert_eq!(targets.bbox_weights[[0, i, k]], w0);
        }
        box_mass += w0;
    }
    assert!((box_mass - 1.0).abs() < 1e-4);
}

#[test]
fn exactly_matching_anchor_has_zero_box_target() {
    let mut head = make_head(3);
    let targets = head.get_targets(&[positive_gt()], GRID).unwrap();

    // Center cell (12, 12), ratio-1 base anchor (index 2): identical to the
    // ground truth once translated, so its encoded offsets are all zero.
    let idx = (12 * 25 + 12) * NUM_BASE + 2;
    assert_eq!(targets.labels[[0, idx]], 1);
    for k in 0..4 {
        assert!(targets.bbox_targets[[0, idx, k]].abs() < 1e-5);
    }
}

#[test]
fn positive_pair_without_positives_keeps_only_negative_mass() {
    let mut head = make_head(3);
    // A tiny corner box overlaps nothing above the negative threshold.
    let gt = GtInstance {
        bbox: BoxXyxy::new(0.0, 0.0, 4.0, 4.0),
        is_positive: true,
    };
    let targets = head.get_targets(&[gt], GRID).unwrap();

    let mut neg_mass = 0.0f32;
    for i in 0..NUM_ANCHORS {
        assert_ne!(targets.labels[[0, i]], 1);
        let w = targets.label_weights[[0, i]];
        assert!(w.is_finite());
        if targets.labels[[0, i]] == 0 {
            neg_mass += w;
        }
        for k in 0..4 {
            assert_eq!(targets.bbox_weights[[0, i, k]], 0.0);
        }
    }
    assert!((neg_mass - 0.5).abs() < 1e-5);
}

#[test]
fn negative_pair_labels_forced_uniform_zero() {
    let mut head = make_head(9);
    let gt = GtInstance {
        bbox: BoxXyxy::new(40.0, 50.0, 60.0, 70.0), // center (50, 60)
        is_positive: false,
    };
    let targets = head.get_targets(&[gt], GRID).unwrap();

    // Every label ends up 0 (the entire grid is treated as negative).
    for i in 0..NUM_ANCHORS {
        assert_eq!(targets.labels[[0, i]], 0);
    }

    // Weights mark the actual sampled anchors: 16 of them, each 1/32, and
    // all inside the clamped 7x7 cell window around the projected center
    // (cells x in [0, 7), y in [2, 9) for this ground truth).
    let mut sampled = 0usize;
    let mut mass = 0.0f32;
    for i in 0..NUM_ANCHORS {
        let w = targets.label_weights[[0, i]];
        if w > 0.0 {
            sampled += 1;
            mass += w;
            let cell = i / NUM_BASE;
            let (y, x) = (cell / 25, cell % 25);
            assert!(x < 7, "sampled anchor outside window: x = {x}");
            assert!((2..9).contains(&y), "sampled anchor outside window: y = {y}");
            assert!((w - 1.0 / 32.0).abs() < 1e-6);
        }
    }
    assert_eq!(sampled, 16);
    assert!((mass - 0.5).abs() < 1e-5);

    // Negative pairs never supervise the regressor.
    assert!(targets.bbox_weights.iter().all(|&w| w == 0.0));
    assert!(targets.bbox_targets.iter().all(|&t| t == 0.0));
}

#[test]
fn negative_pair_center_off_grid_yields_empty_sample() {
    let mut head = make_head(9);
    let gt = GtInstance {
        bbox: BoxXyxy::new(250.0, 250.0, 260.0, 260.0), // projects past the grid edge
        is_positive: false,
    };
    let targets = head.get_targets(&[gt], GRID).unwrap();
    assert!(targets.label_weights.iter().all(|&w| w == 0.0));
    for i in 0..NUM_ANCHORS {
        assert_eq!(targets.labels[[0, i]], 0);
    }
}

#[test]
fn negative_pair_center_clamps_at_low_edge() {
    let mut head = make_head(9);
    let gt = GtInstance {
        bbox: BoxXyxy::new(-5.0, -5.0, 5.0, 5.0), // center (0, 0)
        is_positive: false,
    };
    let targets = head.get_targets(&[gt], GRID).unwrap();
    // The clamped window is a single cell; all its base anchors are sampled.
    let sampled: Vec<usize> = (0..NUM_ANCHORS)
        .filter(|&i| targets.label_weights[[0, i]] > 0.0)
        .collect();
    assert_eq!(sampled.len(), NUM_BASE);
    for &i in &sampled {
        assert_eq!(i / NUM_BASE, 0, "sample outside the corner cell");
    }
    let mass: f32 = sampled.iter().map(|&i| targets.label_weights[[0, i]]).sum();
    assert!((mass - 0.5).abs() < 1e-5);
}

#[test]
fn negative_pair_sampling_is_seed_deterministic() {
    let gt = GtInstance {
        bbox: BoxXyxy::new(100.0, 100.0, 140.0, 140.0),
        is_positive: false,
    };
    let mut a = make_head(42);
    let mut b = make_head(42);
    let ta = a.get_targets(&[gt], GRID).unwrap();
    let tb = b.get_targets(&[gt], GRID).unwrap();
    assert_eq!(ta.label_weights, tb.label_weights);
}

#[test]
fn batch_assembly_divides_weights_by_batch_size() {
    let mut head = make_head(5);
    let neg = GtInstance {
        bbox: BoxXyxy::new(100.0, 100.0, 140.0, 140.0),
        is_positive: false,
    };
    let targets = head.get_targets(&[positive_gt(), neg], GRID).unwrap();

    let pos_mass: f32 = (0..NUM_ANCHORS)
        .filter(|&i| targets.labels[[0, i]] == 1)
        .map(|i| targets.label_weights[[0, i]])
        .sum();
    assert!((pos_mass - 0.25).abs() < 1e-5);

    let neg_sample_mass: f32 = (0..NUM_ANCHORS)
        .map(|i| targets.label_weights[[1, i]])
        .sum();
    assert!((neg_sample_mass - 0.25).abs() < 1e-5);

    let box_mass: f32 = targets.bbox_weights.iter().sum::<f32>() / 4.0;
    assert!((box_mass - 0.5).abs() < 1e-4);
}

#[test]
fn get_targets_rejects_empty_batch() {
    let mut head = make_head(0);
    let err = head.get_targets(&[], GRID).unwrap_err();
    assert_eq!(err, SiamRpnError::InvalidInput("empty ground-truth batch"));
}

#[test]
fn targets_align_with_flattened_classification_map() {
    let mut head = make_head(3);
    let targets = head.get_targets(&[positive_gt()], GRID).unwrap();

    let zeros_cls = Array4::<f32>::zeros((1, 2 * NUM_BASE, 25, 25));
    let zeros_reg = Array4::<f32>::zeros((1, 4 * NUM_BASE, 25, 25));
    let base = head.loss(&zeros_cls, &zeros_reg, &targets).unwrap();

    // Drive the foreground logit of the known positive anchor (cell (12, 12),
    // base anchor 2) to certainty. Its cross-entropy term drops from ln 2 to
    // ~0, so the total falls by exactly that anchor's weight times ln 2 --
    // which only happens when map flattening and target ordering agree.
    let idx = (12 * 25 + 12) * NUM_BASE + 2;
    let weight = targets.label_weights[[0, idx]];
    assert!(weight > 0.0);

    let mut crafted = zeros_cls.clone();
    crafted[[0, NUM_BASE + 2, 12, 12]] = 60.0; // fg channel block, anchor 2
    let shifted = head.loss(&crafted, &zeros_reg, &targets).unwrap();

    let expected_drop = weight * std::f32::consts::LN_2;
    assert!(
        ((base.cls - shifted.cls) - expected_drop).abs() < 1e-5,
        "drop {} vs expected {expected_drop}",
        base.cls - shifted.cls
    );
}

#[test]
fn loss_rejects_mismatched_map_size() {
    let mut head = make_head(3);
    let targets = head.get_targets(&[positive_gt()], GRID).unwrap();
    let cls = Array4::<f32>::zeros((1, 2 * NUM_BASE, 17, 17));
    let reg = Array4::<f32>::zeros((1, 4 * NUM_BASE, 17, 17));
    let err = head.loss(&cls, &reg, &targets).unwrap_err();
    assert!(matches!(err, SiamRpnError::ShapeMismatch { .. }));
}
