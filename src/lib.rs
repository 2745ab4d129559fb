//! Tier Radar - token tier classification and progression tracking
//!
//! This crate aggregates token market data from REST and push feeds, sorts
//! tokens into GambleBox, FastestRunner and HighestGainer tiers, and tracks
//! their progression between tiers across refresh cycles.

pub mod types;
pub mod radar;

// Re-export main types for convenience
pub use types::{ProgressionState, Tier, TokenRecord, TrackedToken};
pub use radar::{RadarBuilder, RadarConfig, RadarHandle, RefreshScheduler};
