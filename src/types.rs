use geo::MultiPolygon;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Marker stored in a grid cell that holds no valid measurement
pub const MISSING: f64 = f64::NAN;

/// Returns true when a cell value is the missing marker (or otherwise non-finite)
#[inline]
pub fn is_missing(value: f64) -> bool {
    !value.is_finite()
}

/// Cell-center coordinates of a regular latitude/longitude grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCoords {
    lat: Vec<f64>,
    lon: Vec<f64>,
}

impl GridCoords {
    /// Build coordinates from explicit center vectors.
    ///
    /// Both vectors must be non-empty, finite and strictly monotonic
    /// (either ascending or descending).
    pub fn new(lat: Vec<f64>, lon: Vec<f64>) -> TraceResult<Self> {
        check_monotonic("lat", &lat)?;
        check_monotonic("lon", &lon)?;
        Ok(Self { lat, lon })
    }

    /// Global grid with `n_lat` x `n_lon` equally sized cells, row 0 in the south.
    pub fn global(n_lat: usize, n_lon: usize) -> TraceResult<Self> {
        if n_lat == 0 || n_lon == 0 {
            return Err(TraceError::InvalidGrid(format!(
                "global grid needs at least one cell per axis, got {}x{}",
                n_lat, n_lon
            )));
        }
        Self::new(cell_centers(-90.0, 90.0, n_lat), cell_centers(-180.0, 180.0, n_lon))
    }

    pub fn lat(&self) -> &[f64] {
        &self.lat
    }

    pub fn lon(&self) -> &[f64] {
        &self.lon
    }

    /// (rows, cols) == (len(lat), len(lon))
    pub fn shape(&self) -> (usize, usize) {
        (self.lat.len(), self.lon.len())
    }
}

fn cell_centers(start: f64, end: f64, n: usize) -> Vec<f64> {
    let step = (end - start) / n as f64;
    (0..n).map(|i| start + step * (i as f64 + 0.5)).collect()
}

fn check_monotonic(axis: &str, values: &[f64]) -> TraceResult<()> {
    if values.is_empty() {
        return Err(TraceError::InvalidGrid(format!("{} axis is empty", axis)));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(TraceError::InvalidGrid(format!("{} axis has non-finite values", axis)));
    }
    let ascending = values.windows(2).all(|w| w[1] > w[0]);
    let descending = values.windows(2).all(|w| w[1] < w[0]);
    if !(ascending || descending) {
        return Err(TraceError::InvalidGrid(format!(
            "{} axis is not strictly monotonic",
            axis
        )));
    }
    Ok(())
}

/// Single-variable scalar field over a fixed lat/lon grid.
///
/// Coordinates are shared behind an `Arc` and never mutated once the grid
/// exists; missing cells hold [`MISSING`].
#[derive(Debug, Clone)]
pub struct ScalarGrid {
    coords: Arc<GridCoords>,
    values: Array2<f64>,
}

impl ScalarGrid {
    pub fn new(coords: Arc<GridCoords>, values: Array2<f64>) -> TraceResult<Self> {
        if values.dim() != coords.shape() {
            return Err(TraceError::InvalidGrid(format!(
                "value array is {:?} but coordinates describe {:?}",
                values.dim(),
                coords.shape()
            )));
        }
        Ok(Self { coords, values })
    }

    // Callers guarantee `values` was shaped from `coords`.
    pub(crate) fn from_parts(coords: Arc<GridCoords>, values: Array2<f64>) -> Self {
        debug_assert_eq!(values.dim(), coords.shape());
        Self { coords, values }
    }

    /// Grid with every cell set to `value`
    pub fn filled(coords: Arc<GridCoords>, value: f64) -> Self {
        let values = Array2::from_elem(coords.shape(), value);
        Self { coords, values }
    }

    /// Grid with every cell missing
    pub fn missing(coords: Arc<GridCoords>) -> Self {
        Self::filled(coords, MISSING)
    }

    pub fn coords(&self) -> &Arc<GridCoords> {
        &self.coords
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn into_values(self) -> Array2<f64> {
        self.values
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| !is_missing(**v)).count()
    }
}

/// Administrative region as delivered by the boundary source
#[derive(Debug, Clone)]
pub struct RegionPolygon {
    /// 3-letter identifier (ISO 3166-1 alpha-3)
    pub id: String,
    pub name: String,
    pub continent: String,
    pub geometry: MultiPolygon<f64>,
}

/// Period label attached to observations and series points
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: Option<u32>,
}

impl Period {
    pub fn year(year: i32) -> Self {
        Self { year, month: None }
    }

    pub fn month(year: i32, month: u32) -> Self {
        Self { year, month: Some(month) }
    }

    /// Position on the regression x-axis (fractional years for months)
    pub fn as_x(&self) -> f64 {
        match self.month {
            Some(m) => self.year as f64 + (m.saturating_sub(1)) as f64 / 12.0,
            None => self.year as f64,
        }
    }

    /// Parse "2005" or "2005-03"
    pub fn parse(label: &str) -> TraceResult<Self> {
        let bad = || TraceError::Table(format!("invalid period label '{}'", label));
        match label.trim().split_once('-') {
            Some((y, m)) => {
                let year = y.parse().map_err(|_| bad())?;
                let month: u32 = m.parse().map_err(|_| bad())?;
                if !(1..=12).contains(&month) {
                    return Err(bad());
                }
                Ok(Self::month(year, month))
            }
            None => Ok(Self::year(label.trim().parse().map_err(|_| bad())?)),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(m) => write!(f, "{}-{:02}", self.year, m),
            None => write!(f, "{}", self.year),
        }
    }
}

/// Which algorithmic path produced an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    /// Mean over the grid cells inside the region
    AreaMean,
    /// Value of the valid cell nearest to the region centroid
    NearestGrid,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::AreaMean => "area_mean",
            Provenance::NearestGrid => "nearest_grid",
        }
    }

    pub fn parse(tag: &str) -> TraceResult<Self> {
        match tag.trim() {
            "area_mean" => Ok(Provenance::AreaMean),
            "nearest_grid" => Ok(Provenance::NearestGrid),
            other => Err(TraceError::Table(format!("unknown provenance tag '{}'", other))),
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One region's scalar for one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionObservation {
    pub region_id: String,
    pub region_name: String,
    pub period: Period,
    pub value: f64,
    pub provenance: Provenance,
    /// Number of grid cells that contributed (1 for nearest_grid)
    pub cell_count: usize,
}

/// Ordered (period, value) pairs for one region
#[derive(Debug, Clone, PartialEq)]
pub struct RegionTimeSeries {
    region_id: String,
    points: Vec<(Period, f64)>,
}

impl RegionTimeSeries {
    /// Sorts by period; two values for the same period are rejected
    pub fn new(region_id: impl Into<String>, mut points: Vec<(Period, f64)>) -> TraceResult<Self> {
        let region_id = region_id.into();
        points.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(w) = points.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(TraceError::DuplicatePeriod {
                region: region_id,
                period: w[0].0.to_string(),
            });
        }
        Ok(Self { region_id, points })
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn points(&self) -> &[(Period, f64)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Fitted log-linear slope for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    pub region_id: String,
    pub slope: f64,
    pub sample_count: usize,
}

/// Error types for the aggregation pipeline
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to read {path}: {reason}")]
    FileRead { path: PathBuf, reason: String },

    #[error("field '{field}' not found in {path}")]
    FieldNotFound { path: PathBuf, field: String },

    #[error("grid mismatch: {0}")]
    GridMismatch(String),

    #[error("no readable source file in group {group}")]
    NoValidSource { group: String },

    #[error("cannot stack an empty set of period grids")]
    EmptyStack,

    #[error("region '{0}' is not present in the boundary source")]
    UnknownRegion(String),

    #[error("no valid grid cell available for region '{region}' in {period}")]
    NoValidData { region: String, period: String },

    #[error("region '{region}' has {count} usable points, at least 2 are needed for a trend")]
    InsufficientData { region: String, count: usize },

    #[error("degenerate regression for region '{region}': all periods identical")]
    DegenerateRegression { region: String },

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("region '{0}' has an empty geometry")]
    EmptyGeometry(String),

    #[error("cell at lat {lat}, lon {lon} lies inside both '{first}' and '{second}'")]
    RegionOverlap {
        lat: f64,
        lon: f64,
        first: String,
        second: String,
    },

    #[error("region '{region}' has more than one value for period {period}")]
    DuplicatePeriod { region: String, period: String },

    #[error("table error: {0}")]
    Table(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("netCDF error: {0}")]
    NetCdf(#[from] netcdf::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TraceError {
    /// File- and region-level failures are logged and skipped; everything
    /// else aborts the stage that raised it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TraceError::FileRead { .. }
                | TraceError::FieldNotFound { .. }
                | TraceError::NoValidSource { .. }
                | TraceError::UnknownRegion(_)
                | TraceError::NoValidData { .. }
                | TraceError::EmptyGeometry(_)
                | TraceError::InsufficientData { .. }
                | TraceError::DegenerateRegression { .. }
        )
    }
}

/// Result type for pipeline operations
pub type TraceResult<T> = Result<T, TraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_coords_are_cell_centers() {
        let coords = GridCoords::global(720, 1440).unwrap();
        assert_eq!(coords.shape(), (720, 1440));
        assert!((coords.lat()[0] + 89.875).abs() < 1e-9);
        assert!((coords.lat()[719] - 89.875).abs() < 1e-9);
        assert!((coords.lon()[0] + 179.875).abs() < 1e-9);
        assert!((coords.lon()[1439] - 179.875).abs() < 1e-9);
    }

    #[test]
    fn test_coords_reject_non_monotonic() {
        let result = GridCoords::new(vec![0.0, 1.0, 1.0], vec![0.0]);
        assert!(matches!(result, Err(TraceError::InvalidGrid(_))));
        assert!(GridCoords::new(vec![2.0, 1.0, 0.0], vec![0.0]).is_ok());
    }

    #[test]
    fn test_grid_shape_must_match_coords() {
        let coords = Arc::new(GridCoords::new(vec![0.0, 1.0], vec![0.0, 1.0, 2.0]).unwrap());
        assert!(ScalarGrid::new(coords.clone(), Array2::zeros((2, 3))).is_ok());
        assert!(ScalarGrid::new(coords, Array2::zeros((3, 2))).is_err());
    }

    #[test]
    fn test_series_sorted_and_duplicates_rejected() {
        let series = RegionTimeSeries::new(
            "NGA",
            vec![(Period::year(2010), 2.0), (Period::year(2005), 1.0)],
        )
        .unwrap();
        assert_eq!(series.points()[0].0, Period::year(2005));

        let dup = RegionTimeSeries::new(
            "NGA",
            vec![(Period::year(2005), 2.0), (Period::year(2005), 1.0)],
        );
        assert!(matches!(dup, Err(TraceError::DuplicatePeriod { .. })));
    }

    #[test]
    fn test_period_labels() {
        assert_eq!(Period::parse("2005").unwrap(), Period::year(2005));
        assert_eq!(Period::parse("2005-03").unwrap(), Period::month(2005, 3));
        assert_eq!(Period::month(2005, 3).to_string(), "2005-03");
        assert!(Period::parse("2005-13").is_err());
        assert!(Period::month(2005, 7).as_x() > 2005.0);
    }
}
