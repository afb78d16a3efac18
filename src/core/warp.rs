use ndarray::{Array2, Zip};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::transform::SkyTransform;
use crate::types::{
    BoundingBox, CoaddError, CoaddResult, Exposure, ImagePixel, MaskPixel, PlaneSet, Point2D,
};

/// Default log target of a `Warper`
pub const DEFAULT_LOG_TARGET: &str = "coaddit::warp";

/// Source positions closer than this to a pixel centre are snapped onto it
const POSITION_TOLERANCE: f64 = 1.0e-6;

/// Which resampling kernel a `Warper` builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarpingKernelKind {
    NearestNeighbor,
    Bilinear,
}

impl Default for WarpingKernelKind {
    fn default() -> Self {
        WarpingKernelKind::Bilinear
    }
}

impl WarpingKernelKind {
    pub fn build(self, interp_length: usize) -> Box<dyn ResamplingKernel> {
        match self {
            WarpingKernelKind::NearestNeighbor => Box::new(NearestNeighborKernel::new(interp_length)),
            WarpingKernelKind::Bilinear => Box::new(BilinearKernel::new(interp_length)),
        }
    }
}

/// Warp configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarpConfig {
    pub warping_kernel: WarpingKernelKind,
    /// Evaluate the transforms exactly every `interp_length` pixels along a row and
    /// interpolate linearly in between; 0 or 1 evaluates every pixel
    pub interp_length: usize,
    /// Grow the destination box by this many pixels on every side (may be negative)
    pub border: i32,
    /// Clip the destination box to this box
    pub max_bbox: Option<BoundingBox>,
    pub log_target: String,
}

impl Default for WarpConfig {
    fn default() -> Self {
        Self {
            warping_kernel: WarpingKernelKind::default(),
            interp_length: 10,
            border: 0,
            max_bbox: None,
            log_target: DEFAULT_LOG_TARGET.to_string(),
        }
    }
}

/// One resampled pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: ImagePixel,
    pub mask: MaskPixel,
    pub variance: ImagePixel,
}

/// Pixel resampler
pub trait ResamplingKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Transform interpolation length along a row (see `WarpConfig::interp_length`)
    fn interp_length(&self) -> usize;

    /// Sample `src` at a parent-frame position; `None` if the kernel footprint
    /// is not entirely inside the source box
    fn sample(&self, src: &PlaneSet, position: Point2D) -> Option<Sample>;

    /// Fill every pixel of `dest` by sampling `src`
    ///
    /// # Arguments
    /// * `dest` - destination planes; their box defines the pixels to fill
    /// * `dest_transform` - transform of the destination pixel grid
    /// * `src` - source planes, same plane kind as `dest`
    /// * `src_transform` - transform of the source pixel grid
    /// * `edge_mask` - bit set on destination pixels without a source sample
    ///
    /// # Returns
    /// * Number of destination pixels with a source sample
    fn warp(
        &self,
        dest: &mut PlaneSet,
        dest_transform: &dyn SkyTransform,
        src: &PlaneSet,
        src_transform: &dyn SkyTransform,
        edge_mask: MaskPixel,
    ) -> CoaddResult<usize> {
        if dest.has_mask() != src.has_mask() {
            return Err(CoaddError::InvalidParameter(format!(
                "dest (masked={}) and src (masked={}) are different plane kinds",
                dest.has_mask(),
                src.has_mask()
            )));
        }
        let positions = source_positions(
            dest.bbox(),
            dest_transform,
            src_transform,
            self.interp_length(),
        )?;

        let num_good = match dest.masked.as_mut() {
            Some(planes) => {
                let sampled = AtomicUsize::new(0);
                let resample = |value: &mut ImagePixel,
                                mask: &mut MaskPixel,
                                variance: &mut ImagePixel,
                                position: &Point2D| {
                    match self.sample(src, *position) {
                        Some(sample) => {
                            *value = sample.value;
                            *mask = sample.mask;
                            *variance = sample.variance;
                            sampled.fetch_add(1, Ordering::Relaxed);
                        }
                        None => {
                            *value = ImagePixel::NAN;
                            *mask = edge_mask;
                            *variance = ImagePixel::NAN;
                        }
                    }
                };
                let zip = Zip::from(&mut dest.value)
                    .and(&mut planes.mask)
                    .and(&mut planes.variance)
                    .and(&positions);

                #[cfg(feature = "parallel")]
                {
                    if positions.len() >= super::PARALLEL_PIXEL_THRESHOLD {
                        zip.par_for_each(resample);
                    } else {
                        zip.for_each(resample);
                    }
                }
                #[cfg(not(feature = "parallel"))]
                zip.for_each(resample);

                sampled.into_inner()
            }
            None => {
                let mut num_good = 0;
                Zip::from(&mut dest.value)
                    .and(&positions)
                    .for_each(|value, position| match self.sample(src, *position) {
                        Some(sample) => {
                            *value = sample.value;
                            num_good += 1;
                        }
                        None => *value = ImagePixel::NAN,
                    });
                num_good
            }
        };

        log::debug!(
            "{} kernel sampled {} of {} pixels",
            self.name(),
            num_good,
            positions.len()
        );
        Ok(num_good)
    }
}

/// Copies the source pixel nearest to the mapped position
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighborKernel {
    interp_length: usize,
}

impl NearestNeighborKernel {
    pub fn new(interp_length: usize) -> Self {
        Self { interp_length }
    }
}

impl ResamplingKernel for NearestNeighborKernel {
    fn name(&self) -> &'static str {
        "nearest"
    }

    fn interp_length(&self) -> usize {
        self.interp_length
    }

    fn sample(&self, src: &PlaneSet, position: Point2D) -> Option<Sample> {
        if !position.x.is_finite() || !position.y.is_finite() {
            return None;
        }
        let x = (position.x + 0.5).floor() as i32;
        let y = (position.y + 0.5).floor() as i32;
        Some(Sample {
            value: src.value_at(x, y)?,
            mask: src.mask_at(x, y).unwrap_or(0),
            variance: src.variance_at(x, y).unwrap_or(0.0),
        })
    }
}

/// Bilinear interpolation over the four surrounding source pixels
///
/// Values are interpolated with the bilinear weights, variances with their
/// squares, and the mask is the OR of every neighbour with non-zero weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct BilinearKernel {
    interp_length: usize,
}

impl BilinearKernel {
    pub fn new(interp_length: usize) -> Self {
        Self { interp_length }
    }
}

impl ResamplingKernel for BilinearKernel {
    fn name(&self) -> &'static str {
        "bilinear"
    }

    fn interp_length(&self) -> usize {
        self.interp_length
    }

    fn sample(&self, src: &PlaneSet, position: Point2D) -> Option<Sample> {
        if !position.x.is_finite() || !position.y.is_finite() {
            return None;
        }
        let px = snap(position.x);
        let py = snap(position.y);
        let x0 = px.floor();
        let y0 = py.floor();
        let dx = px - x0;
        let dy = py - y0;

        let mut value = 0.0f64;
        let mut variance = 0.0f64;
        let mut mask: MaskPixel = 0;
        for (oy, wy) in [(0, 1.0 - dy), (1, dy)] {
            for (ox, wx) in [(0, 1.0 - dx), (1, dx)] {
                let weight = wx * wy;
                if weight == 0.0 {
                    continue;
                }
                let x = x0 as i32 + ox;
                let y = y0 as i32 + oy;
                value += weight * src.value_at(x, y)? as f64;
                variance += weight * weight * src.variance_at(x, y).unwrap_or(0.0) as f64;
                mask |= src.mask_at(x, y).unwrap_or(0);
            }
        }

        Some(Sample {
            value: value as ImagePixel,
            mask,
            variance: variance as ImagePixel,
        })
    }
}

fn snap(coord: f64) -> f64 {
    let nearest = coord.round();
    if (coord - nearest).abs() < POSITION_TOLERANCE {
        nearest
    } else {
        coord
    }
}

/// Map a destination pixel to the source frame
fn map_to_source(
    x: f64,
    y: f64,
    dest_transform: &dyn SkyTransform,
    src_transform: &dyn SkyTransform,
) -> CoaddResult<Point2D> {
    let sky = dest_transform.pixel_to_sky(Point2D::new(x, y))?;
    src_transform.sky_to_pixel(sky)
}

/// Source-frame positions along one destination row; NaN where a transform fails
fn row_positions(
    dest_bbox: BoundingBox,
    row: usize,
    dest_transform: &dyn SkyTransform,
    src_transform: &dyn SkyTransform,
    step: usize,
) -> Vec<Point2D> {
    let nan = Point2D::new(f64::NAN, f64::NAN);
    let width = dest_bbox.width();
    let y = (dest_bbox.min_y() + row as i32) as f64;
    let exact = |col: usize| {
        let x = (dest_bbox.min_x() + col as i32) as f64;
        map_to_source(x, y, dest_transform, src_transform).unwrap_or(nan)
    };

    let mut positions = vec![nan; width];
    if width == 0 {
        return positions;
    }
    let mut col0 = 0;
    let mut start = exact(0);
    positions[0] = start;
    while col0 + 1 < width {
        let col1 = (col0 + step).min(width - 1);
        let end = exact(col1);
        positions[col1] = end;
        for col in col0 + 1..col1 {
            let t = (col - col0) as f64 / (col1 - col0) as f64;
            positions[col] = if start.x.is_nan() || end.x.is_nan() {
                exact(col)
            } else {
                Point2D::new(
                    start.x + (end.x - start.x) * t,
                    start.y + (end.y - start.y) * t,
                )
            };
        }
        col0 = col1;
        start = end;
    }
    positions
}

/// Source-frame position of every destination pixel
fn source_positions(
    dest_bbox: BoundingBox,
    dest_transform: &dyn SkyTransform,
    src_transform: &dyn SkyTransform,
    interp_length: usize,
) -> CoaddResult<Array2<Point2D>> {
    let step = interp_length.max(1);
    let height = dest_bbox.height();
    let map_row = |row: usize| row_positions(dest_bbox, row, dest_transform, src_transform, step);

    #[cfg(feature = "parallel")]
    let rows: Vec<Vec<Point2D>> = if dest_bbox.area() >= super::PARALLEL_PIXEL_THRESHOLD {
        (0..height).into_par_iter().map(map_row).collect()
    } else {
        (0..height).map(map_row).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let rows: Vec<Vec<Point2D>> = (0..height).map(map_row).collect();

    Array2::from_shape_vec(dest_bbox.shape(), rows.into_iter().flatten().collect())
        .map_err(|e| CoaddError::Processing(format!("position grid: {}", e)))
}

/// Warps exposures onto a destination pixel grid
///
/// Works out the destination box that covers a source exposure and drives a
/// `ResamplingKernel` over it. Destination pixels are mapped back to the
/// source (destination pixel → sky → source pixel) and sampled there; pixels
/// with no valid source sample get the EDGE bit, a NaN value and a NaN
/// variance so that accumulation skips them.
#[derive(Debug)]
pub struct Warper {
    config: WarpConfig,
    kernel: Box<dyn ResamplingKernel>,
    edge_mask: MaskPixel,
}

impl Warper {
    /// Create a warper; `edge_mask` is the bit set on pixels without a source sample
    pub fn new(config: WarpConfig, edge_mask: MaskPixel) -> CoaddResult<Self> {
        if config.log_target.is_empty() {
            return Err(CoaddError::InvalidParameter(
                "log_target must not be empty".to_string(),
            ));
        }
        let kernel = config.warping_kernel.build(config.interp_length);
        Ok(Self { config, kernel, edge_mask })
    }

    /// Replace the kernel built from the config
    pub fn with_kernel(mut self, kernel: Box<dyn ResamplingKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    /// Smallest destination box containing the mapped source exposure
    ///
    /// The four outer pixel corners of the source box are mapped into the
    /// destination frame and the resulting float box is expanded to whole
    /// pixels, then grown by `border` and clipped to `max_bbox`.
    pub fn overlapping_bbox(
        &self,
        dest_transform: &dyn SkyTransform,
        exposure: &Exposure,
    ) -> CoaddResult<BoundingBox> {
        let src_transform = exposure.transform.as_deref().ok_or_else(|| {
            CoaddError::InvalidParameter("exposure has no transform".to_string())
        })?;
        let src_bbox = exposure.bbox();
        if src_bbox.is_empty() {
            return Ok(BoundingBox::empty());
        }

        let min_x = src_bbox.min_x() as f64 - 0.5;
        let min_y = src_bbox.min_y() as f64 - 0.5;
        let max_x = src_bbox.max_x() as f64 + 0.5;
        let max_y = src_bbox.max_y() as f64 + 0.5;

        let mut lo = Point2D::new(f64::INFINITY, f64::INFINITY);
        let mut hi = Point2D::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in [(min_x, min_y), (max_x, min_y), (min_x, max_y), (max_x, max_y)] {
            let sky = src_transform.pixel_to_sky(Point2D::new(x, y))?;
            let dest = dest_transform.sky_to_pixel(sky)?;
            lo.x = lo.x.min(dest.x);
            lo.y = lo.y.min(dest.y);
            hi.x = hi.x.max(dest.x);
            hi.y = hi.y.max(dest.y);
        }

        let bbox = BoundingBox::from_min_max(
            snap(lo.x + 0.5).floor() as i32,
            snap(lo.y + 0.5).floor() as i32,
            snap(hi.x - 0.5).ceil() as i32,
            snap(hi.y - 0.5).ceil() as i32,
        )
        .grow(self.config.border);

        Ok(match &self.config.max_bbox {
            Some(max_bbox) => bbox.clip(max_bbox),
            None => bbox,
        })
    }

    /// Resample an exposure onto the destination grid
    ///
    /// The result covers `overlapping_bbox`, has the same plane kind as the
    /// input, carries `dest_transform`, and keeps the input's calibration and
    /// filter.
    pub fn warp_exposure(
        &self,
        dest_transform: Arc<dyn SkyTransform>,
        exposure: &Exposure,
    ) -> CoaddResult<Exposure> {
        let src_transform = exposure.transform.as_deref().ok_or_else(|| {
            CoaddError::InvalidParameter("exposure has no transform".to_string())
        })?;
        let dest_bbox = self.overlapping_bbox(dest_transform.as_ref(), exposure)?;

        let mut image = if exposure.image.has_mask() {
            PlaneSet::new_masked(dest_bbox)
        } else {
            PlaneSet::new_image(dest_bbox)
        };
        let num_good = self.kernel.warp(
            &mut image,
            dest_transform.as_ref(),
            &exposure.image,
            src_transform,
            self.edge_mask,
        )?;

        log::info!(
            target: self.config.log_target.as_str(),
            "🔀 Warped {} onto {} with {} kernel: {} of {} pixels sampled",
            exposure.bbox(),
            dest_bbox,
            self.kernel.name(),
            num_good,
            dest_bbox.area()
        );

        Ok(Exposure {
            image,
            transform: Some(dest_transform),
            calib: exposure.calib,
            filter: exposure.filter.clone(),
        })
    }
}
