use serde::{Deserialize, Serialize};

use crate::types::{CoaddError, CoaddResult, MaskPixel, MAX_MASK_PLANES};

/// Standard mask planes, registered in this order by `MaskPlaneRegistry::default()`
pub const DEFAULT_MASK_PLANES: [&str; 10] = [
    "BAD",
    "SAT",
    "INTRP",
    "CR",
    "EDGE",
    "DETECTED",
    "DETECTED_NEGATIVE",
    "SUSPECT",
    "NO_DATA",
    "CLIPPED",
];

/// Name of the plane that flags pixels no input covered
pub const EDGE_PLANE: &str = "EDGE";

/// Mapping from mask plane names to bit positions
///
/// Bit positions are assigned in registration order and never change, so a
/// registry can be cloned and shared by every stage that reads the same masks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskPlaneRegistry {
    planes: Vec<String>,
}

impl Default for MaskPlaneRegistry {
    fn default() -> Self {
        Self {
            planes: DEFAULT_MASK_PLANES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl MaskPlaneRegistry {
    /// Registry with no planes
    pub fn empty() -> Self {
        Self { planes: Vec::new() }
    }

    /// Register a plane and return its bit index; existing names keep their index
    pub fn add_plane(&mut self, name: &str) -> CoaddResult<usize> {
        if let Some(bit) = self.plane_bit(name) {
            return Ok(bit);
        }
        if self.planes.len() >= MAX_MASK_PLANES {
            return Err(CoaddError::MaskPlaneOverflow(MAX_MASK_PLANES));
        }
        self.planes.push(name.to_string());
        log::debug!("Registered mask plane {} as bit {}", name, self.planes.len() - 1);
        Ok(self.planes.len() - 1)
    }

    /// Bit index of a plane
    pub fn plane_bit(&self, name: &str) -> Option<usize> {
        self.planes.iter().position(|p| p == name)
    }

    /// OR of the named planes' bits
    pub fn plane_bit_mask<S: AsRef<str>>(&self, names: &[S]) -> CoaddResult<MaskPixel> {
        names.iter().try_fold(0 as MaskPixel, |mask, name| {
            let name = name.as_ref();
            let bit = self
                .plane_bit(name)
                .ok_or_else(|| CoaddError::UnknownMaskPlane(name.to_string()))?;
            Ok(mask | ((1 as MaskPixel) << bit))
        })
    }

    /// Bit mask of the named planes, optionally inverted over all mask bits
    pub fn make_bit_mask<S: AsRef<str>>(&self, names: &[S], invert: bool) -> CoaddResult<MaskPixel> {
        let mask = self.plane_bit_mask(names)?;
        Ok(if invert { !mask } else { mask })
    }

    /// Names of all registered planes, in bit order
    pub fn plane_names(&self) -> &[String] {
        &self.planes
    }

    /// Names of the planes set in `mask`
    pub fn interpret(&self, mask: MaskPixel) -> Vec<&str> {
        self.planes
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & ((1 as MaskPixel) << bit) != 0)
            .map(|(_, name)| name.as_str())
            .collect()
    }
}
