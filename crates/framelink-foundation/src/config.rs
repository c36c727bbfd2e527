use serde::Deserialize;

use crate::error::TransportError;

/// Layout parameters for one shared-memory segment.
///
/// Every participating process must construct this with identical values;
/// all byte offsets inside the segment are derived from `num_slots` and
/// `slot_size` alone. There is no global configuration state — the struct is
/// built once and passed into the transport explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SegmentConfig {
    /// POSIX shared memory object name. A leading '/' is added if missing.
    pub name: String,
    /// Number of frame slots in the segment.
    pub num_slots: u32,
    /// Size of each slot's data region in bytes, header included.
    pub slot_size: usize,
}

impl SegmentConfig {
    pub fn new(name: impl Into<String>, num_slots: u32, slot_size: usize) -> Self {
        Self {
            name: name.into(),
            num_slots,
            slot_size,
        }
    }

    /// Object name normalized to the POSIX form (leading slash).
    pub fn shm_name(&self) -> String {
        if self.name.starts_with('/') {
            self.name.clone()
        } else {
            format!("/{}", self.name)
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.name.is_empty() {
            return Err(TransportError::InvalidArguments("segment name is empty"));
        }
        if self.num_slots == 0 {
            return Err(TransportError::InvalidArguments("num_slots must be > 0"));
        }
        if self.slot_size == 0 {
            return Err(TransportError::InvalidArguments("slot_size must be > 0"));
        }
        Ok(())
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            name: "/framelink_video".into(),
            num_slots: 3,
            // One 1080p YUYV frame plus the frame header, rounded up.
            slot_size: 4 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_name_gets_leading_slash() {
        let cfg = SegmentConfig::new("camera0", 3, 4096);
        assert_eq!(cfg.shm_name(), "/camera0");
        let cfg = SegmentConfig::new("/camera0", 3, 4096);
        assert_eq!(cfg.shm_name(), "/camera0");
    }

    #[test]
    fn validate_rejects_zero_slots() {
        let cfg = SegmentConfig::new("x", 0, 4096);
        assert!(cfg.validate().is_err());
    }
}
