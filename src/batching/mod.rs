// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write batching: typed operations, per-key batchers, and the coalescer.

pub mod coalescer;
pub mod hybrid_batcher;
pub mod operation;

pub use coalescer::{BatchExecutor, BatchFailure, CoalescerStats, WriteCoalescer};
pub use hybrid_batcher::{BatchConfig, BatchableItem, FlushBatch, FlushReason, HybridBatcher};
pub use operation::{BatchError, BatchKey, BatchOpType, BatchOperation, BatchPayload};
