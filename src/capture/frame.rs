//! Frame data structures for camera content

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A captured camera frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Raw RGBA pixel data
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Capture time in milliseconds on the scan clock
    pub timestamp_ms: u64,
}

impl CapturedFrame {
    /// Create a new captured frame
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp_ms: u64) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms,
        }
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether the buffer length matches the declared RGBA dimensions
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == self.width as usize * self.height as usize * 4
    }

    /// Hex SHA-256 over dimensions and pixels; the session cache key
    pub fn image_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.width.to_le_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.update(&self.data);
        format!("{:x}", hasher.finalize())
    }
}

/// Packaging shape reported by the camera layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackagingKind {
    Can,
    Bottle,
    Carton,
    Wrapper,
    Pouch,
    Box,
    #[default]
    Unknown,
}

impl PackagingKind {
    /// Cylindrical or flexible packs whose label is only partly visible
    pub fn is_container(self) -> bool {
        matches!(
            self,
            PackagingKind::Can
                | PackagingKind::Bottle
                | PackagingKind::Carton
                | PackagingKind::Wrapper
                | PackagingKind::Pouch
        )
    }
}

impl std::str::FromStr for PackagingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "can" => Ok(PackagingKind::Can),
            "bottle" => Ok(PackagingKind::Bottle),
            "carton" => Ok(PackagingKind::Carton),
            "wrapper" => Ok(PackagingKind::Wrapper),
            "pouch" => Ok(PackagingKind::Pouch),
            "box" => Ok(PackagingKind::Box),
            "unknown" | "" => Ok(PackagingKind::Unknown),
            other => Err(format!("unknown packaging kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_hash_is_stable() {
        let a = CapturedFrame::new(vec![1, 2, 3, 255], 1, 1, 0);
        let b = CapturedFrame::new(vec![1, 2, 3, 255], 1, 1, 900);
        assert_eq!(a.image_hash(), b.image_hash());
        assert_eq!(a.image_hash().len(), 64);
    }

    #[test]
    fn test_image_hash_depends_on_pixels_and_shape() {
        let a = CapturedFrame::new(vec![0; 8], 2, 1, 0);
        let b = CapturedFrame::new(vec![0; 8], 1, 2, 0);
        let c = CapturedFrame::new(vec![1, 0, 0, 0, 0, 0, 0, 0], 2, 1, 0);
        assert_ne!(a.image_hash(), b.image_hash());
        assert_ne!(a.image_hash(), c.image_hash());
    }

    #[test]
    fn test_well_formed() {
        assert!(CapturedFrame::new(vec![0; 16], 2, 2, 0).is_well_formed());
        assert!(!CapturedFrame::new(vec![0; 15], 2, 2, 0).is_well_formed());
        assert!(!CapturedFrame::new(vec![], 0, 0, 0).is_well_formed());
    }

    #[test]
    fn test_container_kinds() {
        assert!(PackagingKind::Can.is_container());
        assert!(PackagingKind::Pouch.is_container());
        assert!(!PackagingKind::Box.is_container());
        assert!(!PackagingKind::Unknown.is_container());
    }

    #[test]
    fn test_packaging_from_str() {
        assert_eq!("Bottle".parse::<PackagingKind>(), Ok(PackagingKind::Bottle));
        assert_eq!("".parse::<PackagingKind>(), Ok(PackagingKind::Unknown));
        assert!("crate".parse::<PackagingKind>().is_err());
    }
}
