use ndarray::{ArrayView2, ArrayViewMut2, Zip};
use serde::{Deserialize, Serialize};

use crate::types::{CoaddError, CoaddResult, ImagePixel, MaskPixel, PlaneSet, WeightMap, WeightPixel};

/// How the variance plane is normalized by the weight map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarianceNormalization {
    /// variance /= weight
    Weight,
    /// variance /= weight², the weighted-mean error propagation form
    WeightSquared,
}

impl Default for VarianceNormalization {
    fn default() -> Self {
        VarianceNormalization::Weight
    }
}

/// Set `edge_mask` in every coadd mask pixel whose weight is zero
///
/// Pixels with non-zero weight are left alone. Applying this twice is harmless.
///
/// # Returns
/// * Number of zero-weight pixels
pub fn set_coadd_edge_bits(
    coadd_mask: ArrayViewMut2<'_, MaskPixel>,
    weight_map: ArrayView2<'_, WeightPixel>,
    edge_mask: MaskPixel,
) -> CoaddResult<usize> {
    if coadd_mask.dim() != weight_map.dim() {
        return Err(CoaddError::InvalidParameter(format!(
            "coadd mask and weight map dimensions differ: {:?} != {:?}",
            coadd_mask.dim(),
            weight_map.dim()
        )));
    }

    let num_edge = weight_map.iter().filter(|&&w| w == 0.0).count();
    let mark = |mask: &mut MaskPixel, &weight: &WeightPixel| {
        if weight == 0.0 {
            *mask |= edge_mask;
        }
    };
    let zip = Zip::from(coadd_mask).and(weight_map);

    #[cfg(feature = "parallel")]
    {
        if weight_map.len() >= super::PARALLEL_PIXEL_THRESHOLD {
            zip.par_for_each(mark);
        } else {
            zip.for_each(mark);
        }
    }
    #[cfg(not(feature = "parallel"))]
    zip.for_each(mark);

    log::debug!("Flagged {} edge pixels", num_edge);
    Ok(num_edge)
}

/// Divide a plane set by a weight map, in place, wherever the weight is positive
///
/// Zero-weight pixels keep their accumulated (undivided) values, so the result
/// never contains a NaN or infinity introduced by the division.
pub fn divide_by_weight_map(
    planes: &mut PlaneSet,
    weight_map: &WeightMap,
    normalization: VarianceNormalization,
) -> CoaddResult<()> {
    if planes.bbox().shape() != weight_map.bbox().shape() {
        return Err(CoaddError::InvalidParameter(format!(
            "plane set and weight map dimensions differ: {:?} != {:?}",
            planes.bbox().shape(),
            weight_map.bbox().shape()
        )));
    }

    let weights = weight_map.weights().view();
    match planes.masked.as_mut() {
        Some(masked) => {
            let divide = |value: &mut ImagePixel, variance: &mut ImagePixel, &weight: &WeightPixel| {
                if weight > 0.0 {
                    *value /= weight;
                    *variance /= match normalization {
                        VarianceNormalization::Weight => weight,
                        VarianceNormalization::WeightSquared => weight * weight,
                    };
                }
            };
            let zip = Zip::from(&mut planes.value)
                .and(&mut masked.variance)
                .and(weights);

            #[cfg(feature = "parallel")]
            {
                if weights.len() >= super::PARALLEL_PIXEL_THRESHOLD {
                    zip.par_for_each(divide);
                } else {
                    zip.for_each(divide);
                }
            }
            #[cfg(not(feature = "parallel"))]
            zip.for_each(divide);
        }
        None => {
            Zip::from(&mut planes.value).and(weights).for_each(|value, &weight| {
                if weight > 0.0 {
                    *value /= weight;
                }
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use ndarray::{array, Array2};

    #[test]
    fn test_edge_bits_only_on_zero_weight() {
        let mut mask: Array2<MaskPixel> = array![[0x1, 0x0], [0x2, 0x0]];
        let weights: Array2<WeightPixel> = array![[0.0, 1.0], [2.5, 0.0]];

        let count = set_coadd_edge_bits(mask.view_mut(), weights.view(), 0x10).unwrap();

        assert_eq!(count, 2);
        assert_eq!(mask, array![[0x11, 0x0], [0x2, 0x10]]);

        // idempotent
        set_coadd_edge_bits(mask.view_mut(), weights.view(), 0x10).unwrap();
        assert_eq!(mask, array![[0x11, 0x0], [0x2, 0x10]]);
    }

    #[test]
    fn test_edge_bits_dimension_mismatch() {
        let mut mask = Array2::<MaskPixel>::zeros((2, 3));
        let weights = Array2::<WeightPixel>::zeros((3, 2));
        assert!(set_coadd_edge_bits(mask.view_mut(), weights.view(), 0x10).is_err());
    }

    #[test]
    fn test_divide_skips_zero_weight() {
        let bbox = BoundingBox::new(0, 0, 2, 1).unwrap();
        let mut planes = PlaneSet::new_masked(bbox);
        planes.fill(8.0, 0, 4.0);
        let weight_map = WeightMap::from_array(bbox, array![[2.0, 0.0]]).unwrap();

        divide_by_weight_map(&mut planes, &weight_map, VarianceNormalization::Weight).unwrap();
        assert_eq!(planes.value_at(0, 0), Some(4.0));
        assert_eq!(planes.variance_at(0, 0), Some(2.0));
        assert_eq!(planes.value_at(1, 0), Some(8.0));
        assert_eq!(planes.variance_at(1, 0), Some(4.0));
    }

    #[test]
    fn test_divide_weight_squared() {
        let bbox = BoundingBox::new(0, 0, 1, 1).unwrap();
        let mut planes = PlaneSet::new_masked(bbox);
        planes.fill(8.0, 0, 4.0);
        let weight_map = WeightMap::from_array(bbox, array![[2.0]]).unwrap();

        divide_by_weight_map(&mut planes, &weight_map, VarianceNormalization::WeightSquared)
            .unwrap();
        assert_eq!(planes.value_at(0, 0), Some(4.0));
        assert_eq!(planes.variance_at(0, 0), Some(1.0));
    }
}
