// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memory pressure levels for the local cache tier.
//!
//! Pressure is the local cache's byte usage over its byte budget. The
//! configured threshold marks where aggressive cleanup kicks in. Routine
//! eviction is the same at every level.
//!
//! # Example
//!
//! ```
//! use task_queue_engine::PressureLevel;
//!
//! let threshold = 0.85;
//! assert_eq!(PressureLevel::from_ratio(0.30, threshold), PressureLevel::Normal);
//! assert_eq!(PressureLevel::from_ratio(0.75, threshold), PressureLevel::Elevated);
//! assert_eq!(PressureLevel::from_ratio(0.90, threshold), PressureLevel::Critical);
//! assert!(PressureLevel::Critical.requires_aggressive_cleanup());
//! ```

/// Local cache pressure, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    /// Below 80% of the threshold
    Normal = 0,
    /// Between 80% of the threshold and the threshold; reported only
    Elevated = 1,
    /// At or above the threshold: rebuild keeping the most recent half
    Critical = 2,
}

impl PressureLevel {
    /// Classify a usage ratio (0.0 → 1.0) against the cleanup threshold.
    #[must_use]
    pub fn from_ratio(ratio: f64, threshold: f64) -> Self {
        match ratio {
            r if r >= threshold => Self::Critical,
            r if r >= threshold * 0.8 => Self::Elevated,
            _ => Self::Normal,
        }
    }

    #[must_use]
    pub fn requires_aggressive_cleanup(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_level_thresholds() {
        assert_eq!(PressureLevel::from_ratio(0.0, 0.85), PressureLevel::Normal);
        assert_eq!(PressureLevel::from_ratio(0.67, 0.85), PressureLevel::Normal);
        assert_eq!(PressureLevel::from_ratio(0.68, 0.85), PressureLevel::Elevated);
        assert_eq!(PressureLevel::from_ratio(0.849, 0.85), PressureLevel::Elevated);
        assert_eq!(PressureLevel::from_ratio(0.85, 0.85), PressureLevel::Critical);
        assert_eq!(PressureLevel::from_ratio(1.5, 0.85), PressureLevel::Critical);
    }

    #[test]
    fn test_only_critical_triggers_aggressive_cleanup() {
        assert!(!PressureLevel::Normal.requires_aggressive_cleanup());
        assert!(!PressureLevel::Elevated.requires_aggressive_cleanup());
        assert!(PressureLevel::Critical.requires_aggressive_cleanup());
    }

    #[test]
    fn test_level_ordering() {
        assert!(PressureLevel::Normal < PressureLevel::Elevated);
        assert!(PressureLevel::Elevated < PressureLevel::Critical);
    }
}
