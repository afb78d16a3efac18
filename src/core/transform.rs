use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{CoaddError, CoaddResult, Point2D, SkyCoord};

/// Bidirectional mapping between parent-frame pixel positions and the sky
///
/// The coadd core only evaluates a transform at individual points.
pub trait SkyTransform: Send + Sync + fmt::Debug {
    fn pixel_to_sky(&self, pixel: Point2D) -> CoaddResult<SkyCoord>;

    fn sky_to_pixel(&self, sky: SkyCoord) -> CoaddResult<Point2D>;
}

/// Linear transform: sky = crval + CD · (pixel − crpix), sky in degrees
///
/// Adequate for small fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    crpix: Point2D,
    crval: SkyCoord,
    cd: [[f64; 2]; 2],
    inverse_cd: [[f64; 2]; 2],
}

impl AffineTransform {
    /// Create a transform; the CD matrix must be invertible
    pub fn new(crpix: Point2D, crval: SkyCoord, cd: [[f64; 2]; 2]) -> CoaddResult<Self> {
        let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
        if !det.is_finite() || det.abs() < f64::EPSILON * 1e-6 {
            return Err(CoaddError::InvalidParameter(format!(
                "CD matrix {:?} is not invertible",
                cd
            )));
        }
        let inverse_cd = [
            [cd[1][1] / det, -cd[0][1] / det],
            [-cd[1][0] / det, cd[0][0] / det],
        ];
        Ok(Self { crpix, crval, cd, inverse_cd })
    }

    /// North-up, east-right transform with square pixels of `deg_per_pixel`
    pub fn from_scale(crpix: Point2D, crval: SkyCoord, deg_per_pixel: f64) -> CoaddResult<Self> {
        Self::new(crpix, crval, [[deg_per_pixel, 0.0], [0.0, deg_per_pixel]])
    }

    /// Same transform with the reference pixel moved by `(dx, dy)`
    pub fn shifted(&self, dx: f64, dy: f64) -> Self {
        Self {
            crpix: Point2D::new(self.crpix.x + dx, self.crpix.y + dy),
            ..self.clone()
        }
    }

    pub fn crpix(&self) -> Point2D {
        self.crpix
    }

    pub fn crval(&self) -> SkyCoord {
        self.crval
    }

    pub fn cd(&self) -> [[f64; 2]; 2] {
        self.cd
    }
}

impl SkyTransform for AffineTransform {
    fn pixel_to_sky(&self, pixel: Point2D) -> CoaddResult<SkyCoord> {
        let dx = pixel.x - self.crpix.x;
        let dy = pixel.y - self.crpix.y;
        let ra = self.crval.ra + self.cd[0][0] * dx + self.cd[0][1] * dy;
        let dec = self.crval.dec + self.cd[1][0] * dx + self.cd[1][1] * dy;
        if !ra.is_finite() || !dec.is_finite() {
            return Err(CoaddError::Transform(format!(
                "pixel ({}, {}) has no sky position",
                pixel.x, pixel.y
            )));
        }
        Ok(SkyCoord::new(ra, dec))
    }

    fn sky_to_pixel(&self, sky: SkyCoord) -> CoaddResult<Point2D> {
        let dra = sky.ra - self.crval.ra;
        let ddec = sky.dec - self.crval.dec;
        let x = self.crpix.x + self.inverse_cd[0][0] * dra + self.inverse_cd[0][1] * ddec;
        let y = self.crpix.y + self.inverse_cd[1][0] * dra + self.inverse_cd[1][1] * ddec;
        if !x.is_finite() || !y.is_finite() {
            return Err(CoaddError::Transform(format!(
                "sky position ({}, {}) has no pixel position",
                sky.ra, sky.dec
            )));
        }
        Ok(Point2D::new(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_round_trip() {
        let transform = AffineTransform::new(
            Point2D::new(50.0, 40.0),
            SkyCoord::new(150.0, 2.0),
            [[-2.0e-4, 1.0e-5], [2.0e-5, 2.0e-4]],
        )
        .unwrap();

        let pixel = Point2D::new(12.25, 87.5);
        let sky = transform.pixel_to_sky(pixel).unwrap();
        let back = transform.sky_to_pixel(sky).unwrap();
        assert_abs_diff_eq!(back.x, pixel.x, epsilon = 1e-8);
        assert_abs_diff_eq!(back.y, pixel.y, epsilon = 1e-8);
    }

    #[test]
    fn test_singular_cd_rejected() {
        let result = AffineTransform::new(
            Point2D::new(0.0, 0.0),
            SkyCoord::new(0.0, 0.0),
            [[1.0, 2.0], [2.0, 4.0]],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_shift_moves_pixels() {
        let base = AffineTransform::from_scale(
            Point2D::new(0.0, 0.0),
            SkyCoord::new(10.0, 10.0),
            1.0e-4,
        )
        .unwrap();
        let shifted = base.shifted(3.0, -2.0);
        assert_eq!(shifted.crpix(), Point2D::new(3.0, -2.0));
        assert_eq!(shifted.crval(), base.crval());
        assert_eq!(shifted.cd(), [[1.0e-4, 0.0], [0.0, 1.0e-4]]);
        let sky = base.pixel_to_sky(Point2D::new(5.0, 5.0)).unwrap();
        let pixel = shifted.sky_to_pixel(sky).unwrap();
        assert_abs_diff_eq!(pixel.x, 8.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pixel.y, 3.0, epsilon = 1e-9);
    }
}
