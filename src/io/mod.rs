//! Input and output: source grids, persisted grids, boundaries and tables

pub mod source;
pub mod grid_store;
pub mod boundaries;
pub mod table;

pub use source::{GdalGridSource, GridSource, SourceParams};
pub use grid_store::{read_grid, write_grid};
pub use boundaries::{BoundaryFields, RegionCatalog, RegionFilter, RegionSource};
pub use table::{write_trends_csv, RegionPeriodTable};
