//! VNI codec
//!
//! A VNI is a 24-bit integer stored as its decimal string in
//! `Network.spec.id` and as the name of the `NetworkID` leaf. Only the
//! canonical decimal form is accepted, so `encode_vni(parse_vni(s)?) == s`.

use thiserror::Error;

/// Lowest VNI handed out by default; lower values are reserved.
pub const DEFAULT_MIN_VNI: u32 = 200;

/// Largest value representable in 24 bits.
pub const MAX_VNI: u32 = (1 << 24) - 1;

/// Errors produced when decoding or validating VNIs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VniError {
    #[error("invalid VNI {0:?}: not a canonical decimal number")]
    Malformed(String),

    #[error("VNI {vni} out of range [{min}, {max}]")]
    OutOfRange { vni: u32, min: u32, max: u32 },

    #[error("invalid VNI range: min {min} must be lower than max {max}")]
    InvalidRange { min: u32, max: u32 },
}

/// Inclusive range of allocatable VNIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VniRange {
    min: u32,
    max: u32,
}

impl Default for VniRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_VNI,
            max: MAX_VNI,
        }
    }
}

impl VniRange {
    /// Builds a range. `min == max` is rejected even though a single-VNI
    /// pool would be well-defined.
    pub fn new(min: u32, max: u32) -> Result<Self, VniError> {
        if min >= max || max > MAX_VNI {
            return Err(VniError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Number of VNIs in the range.
    pub fn size(&self) -> u32 {
        self.max - self.min + 1
    }

    pub fn contains(&self, vni: u32) -> bool {
        (self.min..=self.max).contains(&vni)
    }

    /// Validates that `vni` lies in the range.
    pub fn check(&self, vni: u32) -> Result<u32, VniError> {
        if self.contains(vni) {
            Ok(vni)
        } else {
            Err(VniError::OutOfRange {
                vni,
                min: self.min,
                max: self.max,
            })
        }
    }

    /// VNI at `offset` from the start of the range, wrapping around.
    pub fn nth_wrapping(&self, offset: u32) -> u32 {
        self.min + offset % self.size()
    }
}

/// Encodes a VNI in its canonical decimal form.
pub fn encode_vni(vni: u32) -> String {
    vni.to_string()
}

/// Parses a canonical decimal VNI in `[0, 2^24-1]`.
pub fn parse_vni(s: &str) -> Result<u32, VniError> {
    let canonical = !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'));
    if !canonical {
        return Err(VniError::Malformed(s.to_string()));
    }
    let vni: u32 = s.parse().map_err(|_| VniError::Malformed(s.to_string()))?;
    if vni > MAX_VNI {
        return Err(VniError::OutOfRange {
            vni,
            min: 0,
            max: MAX_VNI,
        });
    }
    Ok(vni)
}
