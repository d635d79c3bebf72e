// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier caching: a circuit-guarded remote tier over an in-process tier.

pub mod local;
pub mod pressure;
pub mod tiered;

pub use local::{LocalCache, SweepReport};
pub use pressure::PressureLevel;
pub use tiered::{CacheClass, CacheStats, CacheTtls, KeyCounters, MaintenanceReport, TieredCache};
