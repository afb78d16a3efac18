use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::add_to_coadd::add_to_coadd;
use crate::core::edge_bits::{divide_by_weight_map, set_coadd_edge_bits, VarianceNormalization};
use crate::core::mask_planes::{MaskPlaneRegistry, EDGE_PLANE};
use crate::core::statistics::{clipped_mean, StatisticsControl};
use crate::core::transform::SkyTransform;
use crate::core::zeropoint::ZeropointScaler;
use crate::types::{
    BoundingBox, Calibration, CoaddError, CoaddResult, Exposure, Filter, MaskPixel, PlaneSet,
    WeightMap,
};

/// Default log target of a `Coadd`
pub const DEFAULT_LOG_TARGET: &str = "coaddit::coadd";

/// Coadd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoaddConfig {
    /// Mask planes that, if set, exclude the pixel from the coadd
    pub bad_mask_planes: Vec<String>,
    /// Photometric zero point of the coadd (mag)
    pub coadd_zero_point: f64,
    /// Scale a copy of each exposure to the coadd zero point before adding it
    pub normalize_on_add: bool,
    /// How the variance plane is divided by the weight map
    pub variance_normalization: VarianceNormalization,
    /// Target for this coadd's log messages
    pub log_target: String,
}

impl Default for CoaddConfig {
    fn default() -> Self {
        Self {
            bad_mask_planes: vec!["EDGE".to_string(), "SAT".to_string()],
            coadd_zero_point: 27.0,
            normalize_on_add: false,
            variance_normalization: VarianceNormalization::Weight,
            log_target: DEFAULT_LOG_TARGET.to_string(),
        }
    }
}

impl CoaddConfig {
    pub fn validate(&self) -> CoaddResult<()> {
        if !self.coadd_zero_point.is_finite() {
            return Err(CoaddError::InvalidParameter(format!(
                "coadd_zero_point must be finite, got {}",
                self.coadd_zero_point
            )));
        }
        if self.log_target.is_empty() {
            return Err(CoaddError::InvalidParameter(
                "log_target must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Computes the weight with which an exposure is added to a coadd
pub trait WeightStrategy: Send + Sync + fmt::Debug {
    /// Weight for `image`; `bad_pixel_mask` marks pixels to ignore
    fn compute_weight(
        &self,
        image: &PlaneSet,
        bad_pixel_mask: MaskPixel,
        weight_factor: f64,
    ) -> CoaddResult<f64>;
}

/// weight = weight_factor / (3σ, 2-iteration clipped mean of the variance plane)
#[derive(Debug, Clone, Copy, Default)]
pub struct ClippedVarianceWeight;

impl WeightStrategy for ClippedVarianceWeight {
    fn compute_weight(
        &self,
        image: &PlaneSet,
        bad_pixel_mask: MaskPixel,
        weight_factor: f64,
    ) -> CoaddResult<f64> {
        let variance = image.variance().ok_or_else(|| {
            CoaddError::InvalidParameter("clipped variance weight needs a variance plane".to_string())
        })?;
        let control = StatisticsControl::with_and_mask(bad_pixel_mask);
        let stats = clipped_mean(variance.view(), image.mask().map(|m| m.view()), &control)?;
        if stats.mean <= 0.0 {
            return Err(CoaddError::DegenerateStatistic(format!(
                "clipped mean variance is {}",
                stats.mean
            )));
        }
        Ok(weight_factor / stats.mean)
    }
}

/// weight = weight_factor
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformWeight;

impl WeightStrategy for UniformWeight {
    fn compute_weight(
        &self,
        _image: &PlaneSet,
        _bad_pixel_mask: MaskPixel,
        weight_factor: f64,
    ) -> CoaddResult<f64> {
        Ok(weight_factor)
    }
}

/// Record of one exposure added to a coadd
#[derive(Debug, Clone, Serialize)]
pub struct ContributionRecord {
    pub filter: Filter,
    pub weight: f64,
    /// Photometric scale applied before adding (1.0 unless normalizing on add)
    pub scale: f64,
    pub overlap: BoundingBox,
    pub added_at: DateTime<Utc>,
}

/// Outcome of adding a list of exposures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub num_added: usize,
    /// Exposures that did not overlap the coadd
    pub num_empty: usize,
    /// Exposures skipped because of a per-exposure error
    pub num_failed: usize,
}

/// Coadd by weighted addition
///
/// Owns the accumulated masked image and its weight map. Each exposure is added
/// with a weight from the configured `WeightStrategy` (by default the inverse
/// clipped mean variance); `materialize` produces the normalized coadd.
#[derive(Debug)]
pub struct Coadd {
    bbox: BoundingBox,
    transform: Option<Arc<dyn SkyTransform>>,
    bad_pixel_mask: MaskPixel,
    edge_mask: MaskPixel,
    coadd: PlaneSet,
    weight_map: WeightMap,
    calib: Calibration,
    filters: HashMap<String, Filter>,
    contributions: Vec<ContributionRecord>,
    weight_strategy: Box<dyn WeightStrategy>,
    scaler: Option<ZeropointScaler>,
    variance_normalization: VarianceNormalization,
    log_target: String,
}

impl Coadd {
    /// Create an empty coadd
    ///
    /// # Arguments
    /// * `bbox` - bounding box of the coadd in the parent frame
    /// * `transform` - coordinate transform of the coadd pixel grid
    /// * `bad_mask_planes` - names of the mask planes that exclude a pixel; should include "EDGE"
    /// * `calib` - photometric calibration of the coadd
    /// * `registry` - mask plane names to bits
    pub fn new<S: AsRef<str>>(
        bbox: BoundingBox,
        transform: Option<Arc<dyn SkyTransform>>,
        bad_mask_planes: &[S],
        calib: Calibration,
        registry: &MaskPlaneRegistry,
    ) -> CoaddResult<Self> {
        let coadd = Self::allocate(bbox, transform, bad_mask_planes, calib, registry)?;
        coadd.log_initialized();
        Ok(coadd)
    }

    fn allocate<S: AsRef<str>>(
        bbox: BoundingBox,
        transform: Option<Arc<dyn SkyTransform>>,
        bad_mask_planes: &[S],
        calib: Calibration,
        registry: &MaskPlaneRegistry,
    ) -> CoaddResult<Self> {
        if bbox.is_empty() {
            return Err(CoaddError::InvalidParameter(
                "coadd bounding box is empty".to_string(),
            ));
        }
        let bad_pixel_mask = registry.plane_bit_mask(bad_mask_planes)?;
        let edge_mask = registry.plane_bit_mask(&[EDGE_PLANE])?;

        Ok(Self {
            bbox,
            transform,
            bad_pixel_mask,
            edge_mask,
            coadd: PlaneSet::new_masked(bbox),
            weight_map: WeightMap::new(bbox),
            calib,
            filters: HashMap::new(),
            contributions: Vec::new(),
            weight_strategy: Box::new(ClippedVarianceWeight),
            scaler: None,
            variance_normalization: VarianceNormalization::default(),
            log_target: DEFAULT_LOG_TARGET.to_string(),
        })
    }

    /// Create an empty coadd from a config
    pub fn from_config(
        bbox: BoundingBox,
        transform: Option<Arc<dyn SkyTransform>>,
        config: &CoaddConfig,
        registry: &MaskPlaneRegistry,
    ) -> CoaddResult<Self> {
        config.validate()?;
        let calib = Calibration::from_zero_point(config.coadd_zero_point)?;
        let mut coadd = Self::allocate(bbox, transform, &config.bad_mask_planes, calib, registry)?;
        if config.normalize_on_add {
            coadd.scaler = Some(ZeropointScaler::new(config.coadd_zero_point)?);
        }
        coadd.variance_normalization = config.variance_normalization;
        coadd.log_target = config.log_target.clone();
        coadd.log_initialized();
        Ok(coadd)
    }

    fn log_initialized(&self) {
        log::info!(
            target: self.log_target.as_str(),
            "🧱 Initializing coadd {} ({}x{} pixels), bad pixel mask 0x{:04x}",
            self.bbox,
            self.bbox.width(),
            self.bbox.height(),
            self.bad_pixel_mask
        );
    }

    /// Replace the weighting scheme
    pub fn with_weight_strategy(mut self, strategy: Box<dyn WeightStrategy>) -> Self {
        self.weight_strategy = strategy;
        self
    }

    /// Replace the log target
    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }

    /// Add an exposure to the coadd
    ///
    /// The exposure must be warped onto the coadd's pixel grid, background
    /// subtracted, and photometrically matched to the coadd (or the coadd must
    /// be configured to normalize on add). The weight is validated before
    /// anything is accumulated, so an error leaves the coadd unchanged.
    ///
    /// # Arguments
    /// * `exposure` - masked exposure to add
    /// * `weight_factor` - extra weight for this exposure (1.0 for none)
    ///
    /// # Returns
    /// * Overlap of the exposure and the coadd in parent coordinates
    /// * Weight with which the exposure was added
    pub fn add_exposure(
        &mut self,
        exposure: &Exposure,
        weight_factor: f64,
    ) -> CoaddResult<(BoundingBox, f64)> {
        if !weight_factor.is_finite() || weight_factor < 0.0 {
            return Err(CoaddError::InvalidParameter(format!(
                "weight factor must be finite and non-negative, got {}",
                weight_factor
            )));
        }
        if !exposure.image.has_mask() {
            return Err(CoaddError::InvalidParameter(
                "coadd exposures need mask and variance planes".to_string(),
            ));
        }

        // normalize a copy so the caller's exposure is never altered
        let normalized;
        let (image, scale) = match &self.scaler {
            Some(scaler) => {
                let mut copy = exposure.clone();
                let scale = scaler.scale_exposure(&mut copy)?;
                normalized = copy;
                (&normalized.image, scale)
            }
            None => (&exposure.image, 1.0),
        };

        let weight = self
            .weight_strategy
            .compute_weight(image, self.bad_pixel_mask, weight_factor)?;
        if !weight.is_finite() || weight < 0.0 || !(weight as f32).is_finite() {
            return Err(CoaddError::DegenerateStatistic(format!(
                "weight {} is not a finite non-negative number",
                weight
            )));
        }

        let overlap = add_to_coadd(
            &mut self.coadd,
            &mut self.weight_map,
            image,
            self.bad_pixel_mask,
            weight as f32,
        )?;

        self.filters
            .entry(exposure.filter.name().to_string())
            .or_insert_with(|| exposure.filter.clone());
        self.contributions.push(ContributionRecord {
            filter: exposure.filter.clone(),
            weight,
            scale,
            overlap,
            added_at: Utc::now(),
        });

        log::info!(
            target: self.log_target.as_str(),
            "Added exposure to coadd; scaled by {:.3e}; weight={:.3e}; overlap {}",
            scale,
            weight,
            overlap
        );
        Ok((overlap, weight))
    }

    /// Add a list of exposures, each with weight factor 1.0
    ///
    /// Exposures that fail with a recoverable error (degenerate statistic,
    /// missing calibration, transform failure) are logged and skipped; any other
    /// error aborts the batch.
    pub fn add_exposures<'a, I>(&mut self, exposures: I) -> CoaddResult<BatchSummary>
    where
        I: IntoIterator<Item = &'a Exposure>,
    {
        let mut summary = BatchSummary::default();
        for (index, exposure) in exposures.into_iter().enumerate() {
            match self.add_exposure(exposure, 1.0) {
                Ok((overlap, _)) if overlap.is_empty() => {
                    log::info!(
                        target: self.log_target.as_str(),
                        "Exposure {} does not overlap the coadd",
                        index
                    );
                    summary.num_empty += 1;
                }
                Ok(_) => summary.num_added += 1,
                Err(e) if e.is_recoverable() => {
                    log::warn!(
                        target: self.log_target.as_str(),
                        "⚠️ Skipping exposure {}: {}",
                        index,
                        e
                    );
                    summary.num_failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            target: self.log_target.as_str(),
            "✅ Batch complete: {} added, {} without overlap, {} failed",
            summary.num_added,
            summary.num_empty,
            summary.num_failed
        );
        Ok(summary)
    }

    /// The coadd of everything added so far
    ///
    /// Pixels no exposure contributed to get the EDGE bit and keep their
    /// undivided value; all others are divided by the weight map. If every
    /// exposure had the same filter the coadd gets that filter, otherwise it
    /// is unknown. The controller itself is not modified.
    pub fn materialize(&self) -> CoaddResult<Exposure> {
        let mut image = self.coadd.clone();
        let num_edge = match image.mask_mut() {
            Some(mask) => set_coadd_edge_bits(mask, self.weight_map.weights().view(), self.edge_mask)?,
            None => 0,
        };
        divide_by_weight_map(&mut image, &self.weight_map, self.variance_normalization)?;

        let filter = if self.filters.len() == 1 {
            self.filters.values().next().cloned().unwrap_or_default()
        } else {
            Filter::unknown()
        };

        log::debug!(
            target: self.log_target.as_str(),
            "Materialized coadd with {} edge pixels, filter {}",
            num_edge,
            filter
        );

        Ok(Exposure {
            image,
            transform: self.transform.clone(),
            calib: Some(self.calib),
            filter,
        })
    }

    /// Weight map: per pixel, the sum of the weights of all contributions
    pub fn get_weight_map(&self) -> &WeightMap {
        &self.weight_map
    }

    pub fn get_bad_pixel_mask(&self) -> MaskPixel {
        self.bad_pixel_mask
    }

    /// Bit set on pixels no exposure contributed to
    pub fn get_edge_mask(&self) -> MaskPixel {
        self.edge_mask
    }

    pub fn get_bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn get_transform(&self) -> Option<&Arc<dyn SkyTransform>> {
        self.transform.as_ref()
    }

    /// All distinct filters seen so far, in no particular order
    pub fn get_filters(&self) -> Vec<&Filter> {
        self.filters.values().collect()
    }

    pub fn get_calib(&self) -> &Calibration {
        &self.calib
    }

    pub fn get_coadd_zero_point(&self) -> f64 {
        self.calib.zero_point()
    }

    pub fn get_contributions(&self) -> &[ContributionRecord] {
        &self.contributions
    }
}
