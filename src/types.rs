use ndarray::{s, Array2, ArrayViewMut2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::core::transform::SkyTransform;

/// Mask pixel: one bit per mask plane
pub type MaskPixel = u16;

/// Image and variance pixel type
pub type ImagePixel = f32;

/// Weight map pixel type
pub type WeightPixel = f32;

/// Number of mask planes a `MaskPixel` can carry
pub const MAX_MASK_PLANES: usize = MaskPixel::BITS as usize;

/// Integer pixel bounding box in the parent frame
///
/// The origin `(x0, y0)` is the parent-frame position of the first pixel;
/// `max_x`/`max_y` are inclusive. A box with zero width or height is empty,
/// and all empty boxes compare equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    x0: i32,
    y0: i32,
    width: usize,
    height: usize,
}

impl BoundingBox {
    /// Create a box from its origin and extent
    ///
    /// Fails if the inclusive maximum on either axis does not fit in `i32`.
    pub fn new(x0: i32, y0: i32, width: usize, height: usize) -> CoaddResult<Self> {
        if width == 0 || height == 0 {
            return Ok(Self::empty());
        }
        extent_max(x0, width)
            .zip(extent_max(y0, height))
            .map(|_| Self { x0, y0, width, height })
            .ok_or_else(|| {
                CoaddError::InvalidParameter(format!(
                    "box at ({}, {}) with extent {}x{} overflows the pixel grid",
                    x0, y0, width, height
                ))
            })
    }

    /// The empty box
    pub fn empty() -> Self {
        Self { x0: 0, y0: 0, width: 0, height: 0 }
    }

    /// Create a box spanning two inclusive corners; empty if max < min on either axis
    pub fn from_min_max(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        if max_x < min_x || max_y < min_y {
            return Self::empty();
        }
        let width = (max_x as i64 - min_x as i64 + 1) as usize;
        let height = (max_y as i64 - min_y as i64 + 1) as usize;
        Self {
            x0: min_x,
            y0: min_y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn min_x(&self) -> i32 {
        self.x0
    }

    pub fn min_y(&self) -> i32 {
        self.y0
    }

    /// Inclusive maximum x
    pub fn max_x(&self) -> i32 {
        (self.x0 as i64 + self.width as i64 - 1) as i32
    }

    /// Inclusive maximum y
    pub fn max_y(&self) -> i32 {
        (self.y0 as i64 + self.height as i64 - 1) as i32
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// Array shape `(rows, cols)` of a plane covering this box
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Intersection of two boxes; empty if either is empty or they are disjoint
    pub fn clip(&self, other: &BoundingBox) -> BoundingBox {
        if self.is_empty() || other.is_empty() {
            return Self::empty();
        }
        Self::from_min_max(
            self.min_x().max(other.min_x()),
            self.min_y().max(other.min_y()),
            self.max_x().min(other.max_x()),
            self.max_y().min(other.max_y()),
        )
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        !self.is_empty()
            && x >= self.min_x()
            && x <= self.max_x()
            && y >= self.min_y()
            && y <= self.max_y()
    }

    /// True if `other` lies entirely inside this box (the empty box is inside everything)
    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        other.is_empty()
            || (self.contains(other.min_x(), other.min_y())
                && self.contains(other.max_x(), other.max_y()))
    }

    /// Grow the box to include a pixel
    pub fn include_point(&mut self, x: i32, y: i32) {
        if self.is_empty() {
            *self = Self::from_min_max(x, y, x, y);
            return;
        }
        *self = Self::from_min_max(
            self.min_x().min(x),
            self.min_y().min(y),
            self.max_x().max(x),
            self.max_y().max(y),
        );
    }

    /// Grow by `border` pixels on every side; a negative border shrinks and may empty the box
    ///
    /// Edges saturate at the `i32` range.
    pub fn grow(&self, border: i32) -> BoundingBox {
        if self.is_empty() {
            return Self::empty();
        }
        Self::from_min_max(
            self.min_x().saturating_sub(border),
            self.min_y().saturating_sub(border),
            self.max_x().saturating_add(border),
            self.max_y().saturating_add(border),
        )
    }

    /// Row and column index ranges of `sub` within a plane covering this box
    pub fn local_slice(&self, sub: &BoundingBox) -> CoaddResult<(Range<usize>, Range<usize>)> {
        if !self.contains_box(sub) {
            return Err(CoaddError::InvalidParameter(format!(
                "box {} is not contained in {}",
                sub, self
            )));
        }
        if sub.is_empty() {
            return Ok((0..0, 0..0));
        }
        let row0 = (sub.min_y() as i64 - self.min_y() as i64) as usize;
        let col0 = (sub.min_x() as i64 - self.min_x() as i64) as usize;
        Ok((row0..row0 + sub.height, col0..col0 + sub.width))
    }
}

/// Inclusive maximum of a non-empty extent starting at `start`, if it fits in `i32`
fn extent_max(start: i32, extent: usize) -> Option<i32> {
    i32::try_from(extent - 1)
        .ok()
        .and_then(|span| start.checked_add(span))
}

impl PartialEq for BoundingBox {
    fn eq(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return self.is_empty() && other.is_empty();
        }
        self.x0 == other.x0
            && self.y0 == other.y0
            && self.width == other.width
            && self.height == other.height
    }
}

impl Eq for BoundingBox {}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(empty)");
        }
        write!(
            f,
            "(minimum=({}, {}), maximum=({}, {}))",
            self.min_x(),
            self.min_y(),
            self.max_x(),
            self.max_y()
        )
    }
}

/// Floating-point pixel position in the parent frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Sky position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    pub ra: f64,
    pub dec: f64,
}

impl SkyCoord {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }
}

/// Mask and variance planes that travel with a masked image
#[derive(Debug, Clone)]
pub struct MaskedPlanes {
    pub(crate) mask: Array2<MaskPixel>,
    pub(crate) variance: Array2<ImagePixel>,
}

/// An image plane, optionally with mask and variance planes, located in the parent frame
///
/// Whether a plane set carries mask/variance is fixed when it is created.
/// All planes always share the shape of the bounding box.
#[derive(Debug, Clone)]
pub struct PlaneSet {
    pub(crate) bbox: BoundingBox,
    pub(crate) value: Array2<ImagePixel>,
    pub(crate) masked: Option<MaskedPlanes>,
}

impl PlaneSet {
    /// Zero-filled image without mask or variance
    pub fn new_image(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            value: Array2::zeros(bbox.shape()),
            masked: None,
        }
    }

    /// Zero-filled image with clear mask and zero variance
    pub fn new_masked(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            value: Array2::zeros(bbox.shape()),
            masked: Some(MaskedPlanes {
                mask: Array2::zeros(bbox.shape()),
                variance: Array2::zeros(bbox.shape()),
            }),
        }
    }

    /// Wrap an existing value plane
    pub fn from_image(bbox: BoundingBox, value: Array2<ImagePixel>) -> CoaddResult<Self> {
        check_shape("value", value.dim(), &bbox)?;
        Ok(Self { bbox, value, masked: None })
    }

    /// Wrap existing value, mask and variance planes
    pub fn from_planes(
        bbox: BoundingBox,
        value: Array2<ImagePixel>,
        mask: Array2<MaskPixel>,
        variance: Array2<ImagePixel>,
    ) -> CoaddResult<Self> {
        check_shape("value", value.dim(), &bbox)?;
        check_shape("mask", mask.dim(), &bbox)?;
        check_shape("variance", variance.dim(), &bbox)?;
        Ok(Self {
            bbox,
            value,
            masked: Some(MaskedPlanes { mask, variance }),
        })
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn has_mask(&self) -> bool {
        self.masked.is_some()
    }

    pub fn value(&self) -> &Array2<ImagePixel> {
        &self.value
    }

    pub fn value_mut(&mut self) -> ArrayViewMut2<'_, ImagePixel> {
        self.value.view_mut()
    }

    pub fn mask(&self) -> Option<&Array2<MaskPixel>> {
        self.masked.as_ref().map(|m| &m.mask)
    }

    pub fn mask_mut(&mut self) -> Option<ArrayViewMut2<'_, MaskPixel>> {
        self.masked.as_mut().map(|m| m.mask.view_mut())
    }

    pub fn variance(&self) -> Option<&Array2<ImagePixel>> {
        self.masked.as_ref().map(|m| &m.variance)
    }

    pub fn variance_mut(&mut self) -> Option<ArrayViewMut2<'_, ImagePixel>> {
        self.masked.as_mut().map(|m| m.variance.view_mut())
    }

    /// Set every pixel; mask and variance are ignored for plain images
    pub fn fill(&mut self, value: ImagePixel, mask: MaskPixel, variance: ImagePixel) {
        self.value.fill(value);
        if let Some(planes) = self.masked.as_mut() {
            planes.mask.fill(mask);
            planes.variance.fill(variance);
        }
    }

    /// Set every pixel inside `region` (parent frame)
    pub fn fill_region(
        &mut self,
        region: &BoundingBox,
        value: ImagePixel,
        mask: MaskPixel,
        variance: ImagePixel,
    ) -> CoaddResult<()> {
        let (rows, cols) = self.bbox.local_slice(region)?;
        self.value
            .slice_mut(s![rows.clone(), cols.clone()])
            .fill(value);
        if let Some(planes) = self.masked.as_mut() {
            planes.mask.slice_mut(s![rows.clone(), cols.clone()]).fill(mask);
            planes.variance.slice_mut(s![rows, cols]).fill(variance);
        }
        Ok(())
    }

    /// Multiply values by `factor` and variances by `factor²`
    pub fn scale(&mut self, factor: f64) {
        let factor = factor as ImagePixel;
        self.value.mapv_inplace(|v| v * factor);
        if let Some(planes) = self.masked.as_mut() {
            let factor_sq = factor * factor;
            planes.variance.mapv_inplace(|v| v * factor_sq);
        }
    }

    fn local_index(&self, x: i32, y: i32) -> Option<[usize; 2]> {
        if !self.bbox.contains(x, y) {
            return None;
        }
        Some([
            (y - self.bbox.min_y()) as usize,
            (x - self.bbox.min_x()) as usize,
        ])
    }

    /// Value at a parent-frame pixel
    pub fn value_at(&self, x: i32, y: i32) -> Option<ImagePixel> {
        self.local_index(x, y).map(|idx| self.value[idx])
    }

    /// Mask at a parent-frame pixel; `None` outside the box or for plain images
    pub fn mask_at(&self, x: i32, y: i32) -> Option<MaskPixel> {
        let idx = self.local_index(x, y)?;
        self.masked.as_ref().map(|m| m.mask[idx])
    }

    /// Variance at a parent-frame pixel; `None` outside the box or for plain images
    pub fn variance_at(&self, x: i32, y: i32) -> Option<ImagePixel> {
        let idx = self.local_index(x, y)?;
        self.masked.as_ref().map(|m| m.variance[idx])
    }
}

fn check_shape(plane: &str, dim: (usize, usize), bbox: &BoundingBox) -> CoaddResult<()> {
    if dim != bbox.shape() {
        return Err(CoaddError::InvalidParameter(format!(
            "{} plane shape {:?} does not match bbox {} (expected {:?})",
            plane,
            dim,
            bbox,
            bbox.shape()
        )));
    }
    Ok(())
}

/// Per-pixel sum of the weights of all accepted contributions
#[derive(Debug, Clone)]
pub struct WeightMap {
    pub(crate) bbox: BoundingBox,
    pub(crate) weights: Array2<WeightPixel>,
}

impl WeightMap {
    /// Zero-filled weight map
    pub fn new(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            weights: Array2::zeros(bbox.shape()),
        }
    }

    pub fn from_array(bbox: BoundingBox, weights: Array2<WeightPixel>) -> CoaddResult<Self> {
        check_shape("weight", weights.dim(), &bbox)?;
        Ok(Self { bbox, weights })
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn weights(&self) -> &Array2<WeightPixel> {
        &self.weights
    }

    pub fn weight_at(&self, x: i32, y: i32) -> Option<WeightPixel> {
        if !self.bbox.contains(x, y) {
            return None;
        }
        Some(self.weights[[
            (y - self.bbox.min_y()) as usize,
            (x - self.bbox.min_x()) as usize,
        ]])
    }
}

/// Band/filter identity of an exposure
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    name: String,
}

impl Filter {
    pub const UNKNOWN_NAME: &'static str = "_unknown_";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN_NAME)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unknown(&self) -> bool {
        self.name == Self::UNKNOWN_NAME
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Photometric calibration: flux of a magnitude-zero source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub flux_mag0: f64,
    pub flux_mag0_sigma: f64,
}

impl Calibration {
    pub fn new(flux_mag0: f64, flux_mag0_sigma: f64) -> CoaddResult<Self> {
        if !flux_mag0.is_finite() || flux_mag0 <= 0.0 {
            return Err(CoaddError::Calibration(format!(
                "flux_mag0 must be positive and finite, got {}",
                flux_mag0
            )));
        }
        Ok(Self { flux_mag0, flux_mag0_sigma })
    }

    /// Calibration whose flux of 1.0 corresponds to `zero_point` magnitudes
    pub fn from_zero_point(zero_point: f64) -> CoaddResult<Self> {
        let calib = Self::new(10f64.powf(0.4 * zero_point), 0.0)?;
        let round_trip = calib.magnitude(1.0);
        if (round_trip - zero_point).abs() > 1.0e-4 {
            return Err(CoaddError::Calibration(format!(
                "magnitude(1.0) = {:.4} != {:.4} = zero point",
                round_trip, zero_point
            )));
        }
        Ok(calib)
    }

    /// Flux of a source of the given magnitude
    pub fn flux(&self, magnitude: f64) -> f64 {
        self.flux_mag0 * 10f64.powf(-0.4 * magnitude)
    }

    /// Magnitude of a source of the given flux
    pub fn magnitude(&self, flux: f64) -> f64 {
        -2.5 * (flux / self.flux_mag0).log10()
    }

    /// Magnitude whose flux is 1.0
    pub fn zero_point(&self) -> f64 {
        2.5 * self.flux_mag0.log10()
    }
}

/// A plane set with its coordinate transform, calibration and filter
#[derive(Debug, Clone)]
pub struct Exposure {
    pub image: PlaneSet,
    pub transform: Option<Arc<dyn SkyTransform>>,
    pub calib: Option<Calibration>,
    pub filter: Filter,
}

impl Exposure {
    pub fn new(image: PlaneSet) -> Self {
        Self {
            image,
            transform: None,
            calib: None,
            filter: Filter::unknown(),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn SkyTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_calib(mut self, calib: Calibration) -> Self {
        self.calib = Some(calib);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn bbox(&self) -> BoundingBox {
        self.image.bbox()
    }

    /// Zero-filled exposure with the same box, plane kind and transform as `other`
    pub fn blank_like(other: &Exposure) -> Self {
        let image = if other.image.has_mask() {
            PlaneSet::new_masked(other.bbox())
        } else {
            PlaneSet::new_image(other.bbox())
        };
        Self {
            image,
            transform: other.transform.clone(),
            calib: None,
            filter: Filter::unknown(),
        }
    }
}

/// Error types for coadd processing
#[derive(Debug, thiserror::Error)]
pub enum CoaddError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Degenerate statistic: {0}")]
    DegenerateStatistic(String),

    #[error("Unknown mask plane: {0}")]
    UnknownMaskPlane(String),

    #[error("No free mask plane bits (capacity {0})")]
    MaskPlaneOverflow(usize),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl CoaddError {
    /// Errors that concern a single exposure and leave the coadd usable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoaddError::DegenerateStatistic(_)
                | CoaddError::Calibration(_)
                | CoaddError::Transform(_)
        )
    }
}

/// Result type for coadd operations
pub type CoaddResult<T> = Result<T, CoaddError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_overlapping() {
        let a = BoundingBox::new(0, 0, 10, 20).unwrap();
        let b = BoundingBox::new(5, -3, 10, 10).unwrap();
        let clipped = a.clip(&b);
        assert_eq!(clipped, BoundingBox::new(5, 0, 5, 7).unwrap());
    }

    #[test]
    fn test_clip_disjoint_is_empty() {
        let a = BoundingBox::new(0, 0, 10, 10).unwrap();
        let b = BoundingBox::new(10, 0, 5, 5).unwrap();
        assert!(a.clip(&b).is_empty());
        assert!(a.clip(&BoundingBox::empty()).is_empty());
        assert_eq!(a.clip(&b), BoundingBox::new(3, 3, 0, 7).unwrap());
    }

    #[test]
    fn test_grow_and_shrink() {
        let a = BoundingBox::new(2, 3, 4, 4).unwrap();
        assert_eq!(a.grow(1), BoundingBox::new(1, 2, 6, 6).unwrap());
        assert_eq!(a.grow(-1), BoundingBox::new(3, 4, 2, 2).unwrap());
        assert!(a.grow(-2).is_empty());
    }

    #[test]
    fn test_box_past_i32_max_is_rejected() {
        assert!(matches!(
            BoundingBox::new(i32::MAX - 1, 0, 5, 5),
            Err(CoaddError::InvalidParameter(_))
        ));
        assert!(BoundingBox::new(0, i32::MAX - 1, 5, 5).is_err());
        assert!(BoundingBox::new(0, 0, usize::MAX, 1).is_err());
        assert!(BoundingBox::new(1, 0, i32::MAX as usize + 1, 1).is_err());

        // the last representable column is fine
        let edge = BoundingBox::new(i32::MAX - 4, 0, 5, 5).unwrap();
        assert_eq!(edge.max_x(), i32::MAX);
        assert!(edge.contains(i32::MAX, 4));
        assert_eq!(BoundingBox::new(i32::MIN, 0, i32::MAX as usize, 1).unwrap().max_x(), -2);
        let widest = BoundingBox::new(0, 0, i32::MAX as usize + 1, 1).unwrap();
        assert_eq!(widest.max_x(), i32::MAX);

        // growing saturates instead of wrapping
        let grown = edge.grow(3);
        assert_eq!(grown.max_x(), i32::MAX);
        assert_eq!(grown.min_x(), i32::MAX - 7);
    }

    #[test]
    fn test_fill_sets_all_planes() {
        let bbox = BoundingBox::new(-2, 5, 3, 2).unwrap();
        let mut masked = PlaneSet::new_masked(bbox);
        masked.fill(1.5, 0x4, 0.25);
        assert!(masked.value().iter().all(|&v| v == 1.5));
        assert!(masked.mask().unwrap().iter().all(|&m| m == 0x4));
        assert!(masked.variance().unwrap().iter().all(|&v| v == 0.25));

        let mut plain = PlaneSet::new_image(bbox);
        plain.fill(-1.0, 0x4, 0.25);
        assert!(plain.value().iter().all(|&v| v == -1.0));
        assert!(plain.mask().is_none());
    }

    #[test]
    fn test_include_point() {
        let mut bbox = BoundingBox::empty();
        bbox.include_point(3, 4);
        bbox.include_point(-1, 6);
        assert_eq!(bbox, BoundingBox::from_min_max(-1, 4, 3, 6));
    }

    #[test]
    fn test_local_slice() {
        let parent = BoundingBox::new(10, 20, 5, 5).unwrap();
        let (rows, cols) = parent.local_slice(&BoundingBox::new(11, 22, 2, 3).unwrap()).unwrap();
        assert_eq!(rows, 2..5);
        assert_eq!(cols, 1..3);
        assert!(parent.local_slice(&BoundingBox::new(0, 0, 2, 2).unwrap()).is_err());
    }

    #[test]
    fn test_plane_shape_mismatch_rejected() {
        let bbox = BoundingBox::new(0, 0, 4, 3).unwrap();
        let err = PlaneSet::from_planes(
            bbox,
            Array2::zeros((3, 4)),
            Array2::zeros((3, 4)),
            Array2::zeros((4, 3)),
        );
        assert!(matches!(err, Err(CoaddError::InvalidParameter(_))));
    }

    #[test]
    fn test_scale_squares_variance() {
        let mut planes = PlaneSet::new_masked(BoundingBox::new(0, 0, 2, 2).unwrap());
        planes.fill(3.0, 0, 2.0);
        planes.scale(0.5);
        assert_eq!(planes.value_at(1, 1), Some(1.5));
        assert_eq!(planes.variance_at(1, 1), Some(0.5));
    }

    #[test]
    fn test_calibration_zero_point_round_trip() {
        let calib = Calibration::from_zero_point(27.0).unwrap();
        assert!((calib.magnitude(1.0) - 27.0).abs() < 1e-9);
        assert!((calib.flux(27.0) - 1.0).abs() < 1e-9);
        assert!((calib.zero_point() - 27.0).abs() < 1e-9);
    }
}
