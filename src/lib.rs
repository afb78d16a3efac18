//! coaddit: weighted coaddition of astronomical exposures
//!
//! Stacks many overlapping, already-warped exposures into one deeper image.
//! Each exposure is added with a weight derived from its noise level, bad
//! pixels are excluded by mask, and a per-pixel weight map is kept so that the
//! final image is a weighted mean. Pixels no exposure covered are flagged EDGE.

pub mod types;
pub mod core;

// Re-export main types and functions for easier access
pub use self::types::{
    BoundingBox, Calibration, CoaddError, CoaddResult, Exposure, Filter, ImagePixel, MaskPixel,
    PlaneSet, Point2D, SkyCoord, WeightMap, WeightPixel,
};

pub use self::core::{
    add_to_coadd, copy_good_pixels, set_coadd_edge_bits, AffineTransform, Coadd, CoaddConfig,
    MaskPlaneRegistry, SkyTransform, VarianceNormalization, WarpConfig, Warper, ZeropointScaler,
};

#[cfg(feature = "python")]
mod python {
    use ndarray::Array2;
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::exceptions::{PyRuntimeError, PyValueError};
    use pyo3::prelude::*;

    use crate::core::{Coadd, CoaddConfig, MaskPlaneRegistry};
    use crate::types::{BoundingBox, CoaddError, Exposure, Filter, PlaneSet};

    fn to_py_err(e: CoaddError) -> PyErr {
        match e {
            CoaddError::InvalidParameter(_) | CoaddError::UnknownMaskPlane(_) => {
                PyValueError::new_err(e.to_string())
            }
            _ => PyRuntimeError::new_err(e.to_string()),
        }
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<PyCoadd>()?;
        Ok(())
    }

    /// Python wrapper for Coadd
    #[pyclass(name = "Coadd")]
    struct PyCoadd {
        inner: Coadd,
    }

    #[pymethods]
    impl PyCoadd {
        #[new]
        #[pyo3(signature = (x0, y0, width, height, bad_mask_planes = None, coadd_zero_point = 27.0))]
        fn new(
            x0: i32,
            y0: i32,
            width: usize,
            height: usize,
            bad_mask_planes: Option<Vec<String>>,
            coadd_zero_point: f64,
        ) -> PyResult<Self> {
            let mut config = CoaddConfig {
                coadd_zero_point,
                ..CoaddConfig::default()
            };
            if let Some(planes) = bad_mask_planes {
                config.bad_mask_planes = planes;
            }
            let inner = Coadd::from_config(
                BoundingBox::new(x0, y0, width, height).map_err(to_py_err)?,
                None,
                &config,
                &MaskPlaneRegistry::default(),
            )
            .map_err(to_py_err)?;
            Ok(PyCoadd { inner })
        }

        /// Add an exposure given as value/mask/variance arrays with origin (x0, y0)
        #[pyo3(signature = (value, mask, variance, x0 = 0, y0 = 0, filter = None, weight_factor = 1.0))]
        #[allow(clippy::too_many_arguments)]
        fn add_exposure(
            &mut self,
            value: PyReadonlyArray2<f32>,
            mask: PyReadonlyArray2<u16>,
            variance: PyReadonlyArray2<f32>,
            x0: i32,
            y0: i32,
            filter: Option<String>,
            weight_factor: f64,
        ) -> PyResult<((i32, i32, usize, usize), f64)> {
            let value = value.as_array().to_owned();
            let (height, width) = value.dim();
            let image = PlaneSet::from_planes(
                BoundingBox::new(x0, y0, width, height).map_err(to_py_err)?,
                value,
                mask.as_array().to_owned(),
                variance.as_array().to_owned(),
            )
            .map_err(to_py_err)?;
            let exposure = Exposure::new(image)
                .with_filter(filter.map(Filter::new).unwrap_or_default());

            let (overlap, weight) = self
                .inner
                .add_exposure(&exposure, weight_factor)
                .map_err(to_py_err)?;
            Ok((
                (overlap.min_x(), overlap.min_y(), overlap.width(), overlap.height()),
                weight,
            ))
        }

        fn weight_map<'py>(&self, py: Python<'py>) -> &'py PyArray2<f32> {
            self.inner.get_weight_map().weights().clone().into_pyarray(py)
        }

        /// Materialized coadd as (value, mask, variance) arrays
        fn coadd<'py>(
            &self,
            py: Python<'py>,
        ) -> PyResult<(&'py PyArray2<f32>, &'py PyArray2<u16>, &'py PyArray2<f32>)> {
            let exposure = self.inner.materialize().map_err(to_py_err)?;
            let shape = exposure.bbox().shape();
            let mask = exposure
                .image
                .mask()
                .cloned()
                .unwrap_or_else(|| Array2::zeros(shape));
            let variance = exposure
                .image
                .variance()
                .cloned()
                .unwrap_or_else(|| Array2::zeros(shape));
            Ok((
                exposure.image.value().clone().into_pyarray(py),
                mask.into_pyarray(py),
                variance.into_pyarray(py),
            ))
        }

        #[getter]
        fn bad_pixel_mask(&self) -> u16 {
            self.inner.get_bad_pixel_mask()
        }

        fn filters(&self) -> Vec<String> {
            self.inner
                .get_filters()
                .into_iter()
                .map(|f| f.name().to_string())
                .collect()
        }

        fn __repr__(&self) -> String {
            format!(
                "Coadd(bbox={}, contributions={})",
                self.inner.get_bbox(),
                self.inner.get_contributions().len()
            )
        }
    }
}
