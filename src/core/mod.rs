//! Aggregation stages

pub mod reducer;
pub mod stacker;
pub mod zonal;
pub mod trend;
pub mod pipeline;

// Re-export main types
pub use reducer::{GridAccumulator, GridReducer, GroupReduction, ReducerParams, SkippedFile, SourceGroup};
pub use stacker::TemporalStacker;
pub use zonal::{RegionFailure, ZonalEngine, ZonalReport, ZoneAssignment};
pub use trend::{fit_trend, fit_trends, log_offset, TrendBatch, TrendSummary};
pub use pipeline::{Pipeline, PipelineConfig, PipelineOutput, RunSummary, YearGroup};
