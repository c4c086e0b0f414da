//! Common configuration types for the SFU signaling components.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while building or splitting a port range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortRangeError {
    #[error("port range is inverted: {min} > {max}")]
    Inverted { min: u16, max: u16 },

    #[error("cannot split a port range into zero parts")]
    ZeroParts,

    #[error("port range of {ports} ports is too small for {parts} parts")]
    TooSmall { ports: u32, parts: usize },
}

/// Inclusive range of UDP/TCP ports available for media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// Lowest port (inclusive).
    pub min: u16,
    /// Highest port (inclusive).
    pub max: u16,
}

impl PortRange {
    /// Build a range, rejecting `min > max`.
    pub fn new(min: u16, max: u16) -> Result<Self, PortRangeError> {
        if min > max {
            return Err(PortRangeError::Inverted { min, max });
        }
        Ok(Self { min, max })
    }

    /// Number of ports in the range.
    #[must_use]
    pub fn len(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }

    /// A valid range always holds at least one port.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// Returns true if `port` falls inside the range.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Returns true if the two ranges share at least one port.
    #[must_use]
    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// Split the range into `parts` equal, contiguous, disjoint slices.
    ///
    /// Slice `i` starts at `min + i * width` where `width = len / parts`.
    /// Ports left over by the integer division stay unused at the top of
    /// the range.
    pub fn split(&self, parts: usize) -> Result<Vec<PortRange>, PortRangeError> {
        if parts == 0 {
            return Err(PortRangeError::ZeroParts);
        }

        let ports = self.len();
        let too_small = PortRangeError::TooSmall { ports, parts };
        let parts_u32 = u32::try_from(parts).map_err(|_| too_small.clone())?;
        let width = ports / parts_u32;
        if width == 0 {
            return Err(too_small);
        }

        (0..parts_u32)
            .map(|index| {
                let start = u32::from(self.min) + index * width;
                let end = start + width - 1;
                let min = u16::try_from(start).map_err(|_| too_small.clone())?;
                let max = u16::try_from(end).map_err(|_| too_small.clone())?;
                Ok(PortRange { min, max })
            })
            .collect()
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text (default).
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter directive, overriding the built-in default when set
    pub log_filter: Option<String>,
    /// Log output format
    pub log_format: LogFormat,
}
