use ndarray::{s, Zip};

use crate::types::{
    BoundingBox, CoaddError, CoaddResult, ImagePixel, MaskPixel, PlaneSet, WeightMap, WeightPixel,
};

/// Add `image`, scaled by `weight`, to `coadd` and `weight_map`
///
/// Only the overlap of the two bounding boxes is touched. For every good source
/// pixel in the overlap:
///
/// ```text
/// coadd.value    += value    * weight
/// coadd.variance += variance * weight²
/// coadd.mask     |= mask
/// weight_map     += weight
/// ```
///
/// A masked source pixel is good when `mask & bad_pixel_mask == 0`; a plain
/// source pixel is good when its value is not NaN. Bad pixels leave all four
/// destination planes untouched.
///
/// # Arguments
/// * `coadd` - accumulator, modified in place
/// * `weight_map` - per-pixel weight sums; must share the coadd's bounding box
/// * `image` - contribution; must be the same plane kind (masked or plain) as the coadd
/// * `bad_pixel_mask` - mask bits that exclude a source pixel; ignored for plain images
/// * `weight` - non-negative, finite weight of this contribution
///
/// # Returns
/// * Overlap of the coadd and the image in parent coordinates (empty if they do not overlap)
///
/// Every check runs before any pixel is written, so a rejected call leaves the
/// coadd and weight map unchanged.
pub fn add_to_coadd(
    coadd: &mut PlaneSet,
    weight_map: &mut WeightMap,
    image: &PlaneSet,
    bad_pixel_mask: MaskPixel,
    weight: WeightPixel,
) -> CoaddResult<BoundingBox> {
    if coadd.bbox() != weight_map.bbox() {
        return Err(CoaddError::InvalidParameter(format!(
            "coadd and weight map parent bboxes differ: {} != {}",
            coadd.bbox(),
            weight_map.bbox()
        )));
    }
    if coadd.has_mask() != image.has_mask() {
        return Err(CoaddError::InvalidParameter(format!(
            "coadd (masked={}) and image (masked={}) are different plane kinds",
            coadd.has_mask(),
            image.has_mask()
        )));
    }
    if !weight.is_finite() || weight < 0.0 {
        return Err(CoaddError::InvalidParameter(format!(
            "weight must be finite and non-negative, got {}",
            weight
        )));
    }

    let overlap = coadd.bbox().clip(&image.bbox());
    if overlap.is_empty() {
        log::debug!(
            "Image {} does not overlap coadd {}",
            image.bbox(),
            coadd.bbox()
        );
        return Ok(overlap);
    }

    let (coadd_rows, coadd_cols) = coadd.bbox().local_slice(&overlap)?;
    let (image_rows, image_cols) = image.bbox().local_slice(&overlap)?;

    #[cfg(feature = "parallel")]
    let parallel = overlap.area() >= super::PARALLEL_PIXEL_THRESHOLD;

    let coadd_value = coadd
        .value
        .slice_mut(s![coadd_rows.clone(), coadd_cols.clone()]);
    let weights = weight_map
        .weights
        .slice_mut(s![coadd_rows.clone(), coadd_cols.clone()]);
    let image_value = image
        .value
        .slice(s![image_rows.clone(), image_cols.clone()]);

    match (coadd.masked.as_mut(), image.masked.as_ref()) {
        (Some(coadd_planes), Some(image_planes)) => {
            let coadd_mask = coadd_planes
                .mask
                .slice_mut(s![coadd_rows.clone(), coadd_cols.clone()]);
            let coadd_variance = coadd_planes
                .variance
                .slice_mut(s![coadd_rows, coadd_cols]);
            let image_mask = image_planes
                .mask
                .slice(s![image_rows.clone(), image_cols.clone()]);
            let image_variance = image_planes.variance.slice(s![image_rows, image_cols]);

            let weight_sq = weight * weight;
            let accumulate = |value: &mut ImagePixel,
                              variance: &mut ImagePixel,
                              total_weight: &mut WeightPixel,
                              &src_value: &ImagePixel,
                              &src_variance: &ImagePixel,
                              &src_mask: &MaskPixel| {
                if src_mask & bad_pixel_mask == 0 {
                    *value += src_value * weight;
                    *variance += src_variance * weight_sq;
                    *total_weight += weight;
                }
            };
            let merge_mask = |mask: &mut MaskPixel, &src_mask: &MaskPixel| {
                if src_mask & bad_pixel_mask == 0 {
                    *mask |= src_mask;
                }
            };

            let pixels = Zip::from(coadd_value)
                .and(coadd_variance)
                .and(weights)
                .and(image_value)
                .and(image_variance)
                .and(image_mask);
            let masks = Zip::from(coadd_mask).and(image_mask);

            #[cfg(feature = "parallel")]
            {
                if parallel {
                    pixels.par_for_each(accumulate);
                    masks.par_for_each(merge_mask);
                } else {
                    pixels.for_each(accumulate);
                    masks.for_each(merge_mask);
                }
            }
            #[cfg(not(feature = "parallel"))]
            {
                pixels.for_each(accumulate);
                masks.for_each(merge_mask);
            }
        }
        (None, None) => {
            let accumulate =
                |value: &mut ImagePixel, total_weight: &mut WeightPixel, &src_value: &ImagePixel| {
                    if !src_value.is_nan() {
                        *value += src_value * weight;
                        *total_weight += weight;
                    }
                };
            let pixels = Zip::from(coadd_value).and(weights).and(image_value);

            #[cfg(feature = "parallel")]
            {
                if parallel {
                    pixels.par_for_each(accumulate);
                } else {
                    pixels.for_each(accumulate);
                }
            }
            #[cfg(not(feature = "parallel"))]
            pixels.for_each(accumulate);
        }
        _ => {
            return Err(CoaddError::InvalidParameter(
                "coadd and image are different plane kinds".to_string(),
            ))
        }
    }

    log::debug!("Accumulated overlap {} with weight {:.4}", overlap, weight);
    Ok(overlap)
}
