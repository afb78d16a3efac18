use ndarray::{s, Array2, ArrayView2, ArrayViewMut2, Zip};
use num_traits::Float;

use crate::types::{BoundingBox, CoaddError, CoaddResult, MaskPixel, PlaneSet};

/// Overwrite `dest` with the good pixels of `src` over their overlap
///
/// A masked source pixel is good when `mask & bad_pixel_mask == 0`, in which case
/// its value, mask and variance all replace the destination's. A plain source
/// pixel is good when it is not NaN; `bad_pixel_mask` is then ignored.
/// There is no weighting and no accumulation.
///
/// # Returns
/// * Number of good pixels copied
pub fn copy_good_pixels(
    dest: &mut PlaneSet,
    src: &PlaneSet,
    bad_pixel_mask: MaskPixel,
) -> CoaddResult<usize> {
    if dest.has_mask() != src.has_mask() {
        return Err(CoaddError::InvalidParameter(format!(
            "dest (masked={}) and src (masked={}) are different plane kinds",
            dest.has_mask(),
            src.has_mask()
        )));
    }

    let overlap = dest.bbox().clip(&src.bbox());
    if overlap.is_empty() {
        return Ok(0);
    }
    let (dest_rows, dest_cols) = dest.bbox().local_slice(&overlap)?;
    let (src_rows, src_cols) = src.bbox().local_slice(&overlap)?;

    let dest_value = dest
        .value
        .slice_mut(s![dest_rows.clone(), dest_cols.clone()]);
    let src_value = src.value.slice(s![src_rows.clone(), src_cols.clone()]);

    let num_good = match (dest.masked.as_mut(), src.masked.as_ref()) {
        (Some(dest_planes), Some(src_planes)) => {
            let dest_mask = dest_planes
                .mask
                .slice_mut(s![dest_rows.clone(), dest_cols.clone()]);
            let dest_variance = dest_planes.variance.slice_mut(s![dest_rows, dest_cols]);
            let src_mask = src_planes
                .mask
                .slice(s![src_rows.clone(), src_cols.clone()]);
            let src_variance = src_planes.variance.slice(s![src_rows, src_cols]);

            let mut num_good = 0;
            Zip::from(dest_value)
                .and(dest_mask)
                .and(dest_variance)
                .and(src_value)
                .and(src_mask)
                .and(src_variance)
                .for_each(|value, mask, variance, &src_value, &src_mask, &src_variance| {
                    if src_mask & bad_pixel_mask == 0 {
                        *value = src_value;
                        *mask = src_mask;
                        *variance = src_variance;
                        num_good += 1;
                    }
                });
            num_good
        }
        (None, None) => copy_known_values(dest_value, src_value),
        _ => {
            return Err(CoaddError::InvalidParameter(
                "dest and src are different plane kinds".to_string(),
            ))
        }
    };

    log::debug!(
        "Copied {} of {} pixels in overlap {}",
        num_good,
        overlap.area(),
        overlap
    );
    Ok(num_good)
}

/// Copy every non-NaN `src` pixel into `dest`; both views must have the same shape
pub fn copy_known_values<T: Float>(dest: ArrayViewMut2<'_, T>, src: ArrayView2<'_, T>) -> usize {
    let mut num_good = 0;
    Zip::from(dest).and(src).for_each(|dest, &src| {
        if !src.is_nan() {
            *dest = src;
            num_good += 1;
        }
    });
    num_good
}

/// Copy the good pixels of a plain image held outside a `PlaneSet`, e.g. an `f64` template
pub fn copy_good_image_pixels<T: Float>(
    dest: &mut Array2<T>,
    dest_bbox: &BoundingBox,
    src: &Array2<T>,
    src_bbox: &BoundingBox,
) -> CoaddResult<usize> {
    if dest.dim() != dest_bbox.shape() || src.dim() != src_bbox.shape() {
        return Err(CoaddError::InvalidParameter(format!(
            "image shapes {:?}/{:?} do not match bboxes {}/{}",
            dest.dim(),
            src.dim(),
            dest_bbox,
            src_bbox
        )));
    }
    let overlap = dest_bbox.clip(src_bbox);
    if overlap.is_empty() {
        return Ok(0);
    }
    let (dest_rows, dest_cols) = dest_bbox.local_slice(&overlap)?;
    let (src_rows, src_cols) = src_bbox.local_slice(&overlap)?;
    Ok(copy_known_values(
        dest.slice_mut(s![dest_rows, dest_cols]),
        src.slice(s![src_rows, src_cols]),
    ))
}
