use approx::assert_relative_eq;
use coaddit::core::{add_to_coadd, copy_good_pixels, divide_by_weight_map, MaskPlaneRegistry};
use coaddit::core::VarianceNormalization;
use coaddit::types::{BoundingBox, MaskPixel, PlaneSet, WeightMap};
use ndarray::Array2;
use proptest::prelude::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn bad_mask() -> MaskPixel {
    MaskPlaneRegistry::default()
        .plane_bit_mask(&["BAD"])
        .expect("BAD is a default plane")
}

/// Constant masked image with the given origin and shape
fn constant_image(bbox: BoundingBox, value: f32, variance: f32) -> PlaneSet {
    let mut image = PlaneSet::new_masked(bbox);
    image.fill(value, 0, variance);
    image
}

fn mean_stdev(values: &[f32]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

#[test]
fn test_constant_source_with_bad_region() {
    init_logging();

    let bbox = BoundingBox::new(0, 0, 10, 20).unwrap();
    let mut coadd = PlaneSet::new_masked(bbox);
    let mut weight_map = WeightMap::new(bbox);

    // rows 0..3 are NaN and flagged BAD
    let mut source = constant_image(bbox, 10.0, 1.0);
    source
        .fill_region(&BoundingBox::new(0, 0, 10, 3).unwrap(), f32::NAN, bad_mask(), f32::NAN)
        .expect("region inside source");

    let overlap = add_to_coadd(&mut coadd, &mut weight_map, &source, bad_mask(), 1.0)
        .expect("Failed to add source");
    assert_eq!(overlap, bbox);

    divide_by_weight_map(&mut coadd, &weight_map, VarianceNormalization::Weight)
        .expect("Failed to divide by weight map");

    let good: Vec<f32> = coadd
        .value()
        .iter()
        .zip(weight_map.weights().iter())
        .filter(|(_, &w)| w > 0.0)
        .map(|(&v, _)| v)
        .collect();
    assert_eq!(good.len(), 10 * 17);
    let (mean, stdev) = mean_stdev(&good);
    assert_relative_eq!(mean, 10.0);
    assert_eq!(stdev, 0.0);

    // the bad rows were never touched
    assert_eq!(coadd.value_at(4, 1), Some(0.0));
    assert_eq!(coadd.mask_at(4, 1), Some(0));
    assert_eq!(weight_map.weight_at(4, 1), Some(0.0));
}

#[test]
fn test_two_identical_sources() {
    let bbox = BoundingBox::new(0, 0, 10, 20).unwrap();
    let mut coadd = PlaneSet::new_masked(bbox);
    let mut weight_map = WeightMap::new(bbox);
    let source = constant_image(bbox, 10.0, 1.0);

    for _ in 0..2 {
        add_to_coadd(&mut coadd, &mut weight_map, &source, bad_mask(), 1.0)
            .expect("Failed to add source");
    }
    assert!(weight_map.weights().iter().all(|&w| w == 2.0));

    divide_by_weight_map(&mut coadd, &weight_map, VarianceNormalization::Weight)
        .expect("Failed to divide by weight map");
    let values: Vec<f32> = coadd.value().iter().copied().collect();
    let (mean, stdev) = mean_stdev(&values);
    assert_relative_eq!(mean, 10.0);
    assert_eq!(stdev, 0.0);
}

#[test]
fn test_disjoint_source_changes_nothing() {
    let bbox = BoundingBox::new(0, 0, 10, 20).unwrap();
    let mut coadd = constant_image(bbox, 3.0, 0.5);
    let mut weight_map = WeightMap::from_array(bbox, Array2::from_elem(bbox.shape(), 1.5))
        .expect("weight map shape");
    let before = (coadd.clone(), weight_map.clone());

    let source = constant_image(BoundingBox::new(10, 0, 5, 5).unwrap(), 10.0, 1.0);
    let overlap = add_to_coadd(&mut coadd, &mut weight_map, &source, bad_mask(), 1.0)
        .expect("disjoint add is not an error");

    assert!(overlap.is_empty());
    assert_eq!(coadd.value(), before.0.value());
    assert_eq!(coadd.mask(), before.0.mask());
    assert_eq!(coadd.variance(), before.0.variance());
    assert_eq!(weight_map.weights(), before.1.weights());
}

#[test]
fn test_all_bad_source_changes_nothing() {
    let bbox = BoundingBox::new(0, 0, 6, 4).unwrap();
    let mut coadd = PlaneSet::new_masked(bbox);
    let mut weight_map = WeightMap::new(bbox);

    let mut source = PlaneSet::new_masked(bbox);
    source.fill(10.0, bad_mask() | 0x2, 1.0);

    let overlap = add_to_coadd(&mut coadd, &mut weight_map, &source, bad_mask(), 3.0)
        .expect("Failed to add source");
    assert_eq!(overlap, bbox);
    assert!(coadd.value().iter().all(|&v| v == 0.0));
    assert!(coadd.mask().expect("masked").iter().all(|&m| m == 0));
    assert!(coadd.variance().expect("masked").iter().all(|&v| v == 0.0));
    assert!(weight_map.weights().iter().all(|&w| w == 0.0));
}

#[test]
fn test_variance_scales_with_weight_squared() {
    let bbox = BoundingBox::new(0, 0, 4, 4).unwrap();
    let mut coadd = PlaneSet::new_masked(bbox);
    let mut weight_map = WeightMap::new(bbox);

    let source = constant_image(bbox, 1.0, 1.0);
    add_to_coadd(&mut coadd, &mut weight_map, &source, bad_mask(), 2.0).expect("add weight 2");
    add_to_coadd(&mut coadd, &mut weight_map, &source, bad_mask(), 0.5).expect("add weight 0.5");

    // 2² · 1 + 0.5² · 1
    assert_relative_eq!(coadd.variance_at(1, 1).expect("inside") as f64, 4.25);
    assert_relative_eq!(weight_map.weight_at(1, 1).expect("inside") as f64, 2.5);

    // weighted mean of independent measurements: Σw²σ² / (Σw)²
    let mut normalized = coadd.clone();
    divide_by_weight_map(&mut normalized, &weight_map, VarianceNormalization::WeightSquared)
        .expect("Failed to divide");
    assert_relative_eq!(
        normalized.variance_at(2, 2).expect("inside") as f64,
        4.25 / 6.25,
        max_relative = 1e-6
    );
}

#[test]
fn test_plain_images_skip_nan() {
    let bbox = BoundingBox::new(-2, 5, 3, 2).unwrap();
    let mut coadd = PlaneSet::new_image(bbox);
    let mut weight_map = WeightMap::new(bbox);
    let source = PlaneSet::from_image(
        bbox,
        Array2::from_shape_vec((2, 3), vec![1.0, f32::NAN, 3.0, 4.0, 5.0, f32::NAN])
            .expect("shape"),
    )
    .expect("Failed to wrap image");

    add_to_coadd(&mut coadd, &mut weight_map, &source, 0, 2.0).expect("Failed to add image");

    assert_eq!(coadd.value_at(-2, 5), Some(2.0));
    assert_eq!(coadd.value_at(-1, 5), Some(0.0));
    assert_eq!(weight_map.weight_at(-1, 5), Some(0.0));
    assert_eq!(weight_map.weight_at(-1, 6), Some(2.0));
    assert_eq!(weight_map.weight_at(0, 6), Some(0.0));
}

#[test]
fn test_copy_good_pixels_counts_overlap_only() {
    let mut dest = PlaneSet::new_masked(BoundingBox::new(0, 0, 10, 10).unwrap());
    let mut src = constant_image(BoundingBox::new(5, 5, 10, 10).unwrap(), 7.0, 2.0);
    src.fill_region(&BoundingBox::new(5, 5, 5, 1).unwrap(), 0.0, bad_mask(), 0.0)
        .expect("region inside source");

    let copied = copy_good_pixels(&mut dest, &src, bad_mask()).expect("Failed to copy");
    assert_eq!(copied, 20);
    assert_eq!(dest.value_at(9, 9), Some(7.0));
    assert_eq!(dest.value_at(5, 5), Some(0.0));
}

proptest! {
    #[test]
    fn accumulation_is_order_independent(
        weights in prop::collection::vec(0.1f32..10.0, 5),
        order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let bbox = BoundingBox::new(0, 0, 8, 6).unwrap();
        let sources: Vec<PlaneSet> = (0..5)
            .map(|i| {
                let mut image = constant_image(
                    BoundingBox::new(i as i32 - 2, (i % 3) as i32 - 1, 7, 5).unwrap(),
                    1.0 + i as f32,
                    0.5 + i as f32,
                );
                image
                    .fill_region(&BoundingBox::new(i as i32, 1, 1, 1).unwrap(), 99.0, 0x1, 99.0)
                    .expect("region inside source");
                image
            })
            .collect();

        let accumulate = |indices: &[usize]| {
            let mut coadd = PlaneSet::new_masked(bbox);
            let mut weight_map = WeightMap::new(bbox);
            for &i in indices {
                add_to_coadd(&mut coadd, &mut weight_map, &sources[i], 0x1, weights[i])
                    .expect("Failed to add source");
            }
            (coadd, weight_map)
        };

        let (expected, expected_weights) = accumulate(&[0, 1, 2, 3, 4]);
        let (actual, actual_weights) = accumulate(&order);

        for (a, b) in expected.value().iter().zip(actual.value().iter()) {
            prop_assert!((a - b).abs() <= 1e-4 * a.abs().max(1.0));
        }
        for (a, b) in expected
            .variance()
            .expect("masked")
            .iter()
            .zip(actual.variance().expect("masked").iter())
        {
            prop_assert!((a - b).abs() <= 1e-4 * a.abs().max(1.0));
        }
        for (a, b) in expected_weights.weights().iter().zip(actual_weights.weights().iter()) {
            prop_assert!((a - b).abs() <= 1e-4 * a.abs().max(1.0));
        }
        prop_assert_eq!(expected.mask(), actual.mask());
    }

    #[test]
    fn weight_map_never_decreases(weights in prop::collection::vec(0.0f32..5.0, 1..8)) {
        let bbox = BoundingBox::new(0, 0, 5, 5).unwrap();
        let mut coadd = PlaneSet::new_masked(bbox);
        let mut weight_map = WeightMap::new(bbox);
        let source = constant_image(BoundingBox::new(1, 1, 3, 3).unwrap(), 2.0, 1.0);

        for w in weights {
            let before = weight_map.weights().clone();
            add_to_coadd(&mut coadd, &mut weight_map, &source, 0x1, w)
                .expect("Failed to add source");
            for (old, new) in before.iter().zip(weight_map.weights().iter()) {
                prop_assert!(new >= old);
            }
        }
    }
}
