//! Core coadd processing modules

pub mod add_to_coadd;
pub mod coadd;
pub mod copy_good_pixels;
pub mod edge_bits;
pub mod mask_planes;
pub mod statistics;
pub mod transform;
pub mod warp;
pub mod zeropoint;

/// Images with at least this many pixels are processed with rayon
#[cfg(feature = "parallel")]
pub(crate) const PARALLEL_PIXEL_THRESHOLD: usize = 1 << 20;

// Re-export main types
pub use add_to_coadd::add_to_coadd;
pub use coadd::{
    BatchSummary, ClippedVarianceWeight, Coadd, CoaddConfig, ContributionRecord, UniformWeight,
    WeightStrategy,
};
pub use copy_good_pixels::{copy_good_image_pixels, copy_good_pixels, copy_known_values};
pub use edge_bits::{divide_by_weight_map, set_coadd_edge_bits, VarianceNormalization};
pub use mask_planes::{MaskPlaneRegistry, DEFAULT_MASK_PLANES, EDGE_PLANE};
pub use statistics::{clipped_mean, ClippedStats, StatisticsControl};
pub use transform::{AffineTransform, SkyTransform};
pub use warp::{
    BilinearKernel, NearestNeighborKernel, ResamplingKernel, Sample, WarpConfig, Warper,
    WarpingKernelKind,
};
pub use zeropoint::ZeropointScaler;
