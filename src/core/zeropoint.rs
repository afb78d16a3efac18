use crate::types::{Calibration, CoaddError, CoaddResult, Exposure};

/// Scales exposures to a common photometric zero point
///
/// After scaling, a source of magnitude `zero_point` has a total flux of 1.0.
#[derive(Debug, Clone)]
pub struct ZeropointScaler {
    zero_point: f64,
    calib: Calibration,
}

impl ZeropointScaler {
    /// Create a scaler for the desired zero point (mag)
    pub fn new(zero_point: f64) -> CoaddResult<Self> {
        let calib = Calibration::from_zero_point(zero_point)?;
        Ok(Self { zero_point, calib })
    }

    pub fn zero_point(&self) -> f64 {
        self.zero_point
    }

    /// Calibration of a scaled exposure
    pub fn calib(&self) -> &Calibration {
        &self.calib
    }

    /// Scale factor that brings an exposure with `calib` to the desired zero point
    ///
    /// new pixel value = old pixel value × scale
    pub fn compute_scale(&self, calib: &Calibration) -> CoaddResult<f64> {
        let flux_at_zero_point = calib.flux(self.zero_point);
        if !flux_at_zero_point.is_finite() || flux_at_zero_point <= 0.0 {
            return Err(CoaddError::Calibration(format!(
                "flux at zero point {} is {}; cannot scale",
                self.zero_point, flux_at_zero_point
            )));
        }
        Ok(1.0 / flux_at_zero_point)
    }

    /// Scale an exposure to the desired zero point, in place
    ///
    /// Values are multiplied by the scale, variances by its square, and the
    /// exposure's calibration is replaced by the desired one (keeping the
    /// flux_mag0 uncertainty, rescaled). Calling this again on the same
    /// exposure is a no-op apart from floating-point rounding, since its
    /// calibration then already matches.
    ///
    /// # Returns
    /// * The scale factor applied
    pub fn scale_exposure(&self, exposure: &mut Exposure) -> CoaddResult<f64> {
        let exposure_calib = exposure.calib.ok_or_else(|| {
            CoaddError::Calibration("exposure has no calibration".to_string())
        })?;
        let scale = self.compute_scale(&exposure_calib)?;

        exposure.image.scale(scale);
        exposure.calib = Some(Calibration {
            flux_mag0: self.calib.flux_mag0,
            flux_mag0_sigma: exposure_calib.flux_mag0_sigma * scale,
        });

        log::debug!(
            "Scaled exposure from zero point {:.4} to {:.4} by {:.4e}",
            exposure_calib.zero_point(),
            self.zero_point,
            scale
        );
        Ok(scale)
    }
}
