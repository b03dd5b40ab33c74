use crate::types::{GridCoords, ScalarGrid, TraceError, TraceResult, MISSING};
use gdal::Dataset;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Read interface for raw source grids
pub trait GridSource: Send + Sync {
    /// Read the named 2-D field of one file as a grid, fill values masked
    fn read_grid(&self, path: &Path, field: &str) -> TraceResult<ScalarGrid>;
}

/// Source reading parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceParams {
    /// Path of the scalar field inside the container
    pub field_path: String,
    /// Values below this are fill values
    pub fill_threshold: f64,
    /// Bounded number of attempts per file
    pub read_attempts: usize,
}

impl Default for SourceParams {
    fn default() -> Self {
        Self {
            // Tropospheric NO2 column of the OMNO2d product
            field_path: "HDFEOS/GRIDS/ColumnAmountNO2/Data Fields/ColumnAmountNO2Trop".to_string(),
            fill_threshold: -1e20,  // Below any physical column value
            read_attempts: 2,       // One retry
        }
    }
}

/// GDAL-backed reader for HDF-EOS5 / HDF5 / netCDF level-3 grids.
///
/// The field is opened as a GDAL subdataset and placed on the global
/// regular grid matching its shape, row 0 in the south.
pub struct GdalGridSource {
    params: SourceParams,
    coords: Mutex<HashMap<(usize, usize), Arc<GridCoords>>>,
}

impl GdalGridSource {
    pub fn new() -> Self {
        Self::with_params(SourceParams::default())
    }

    pub fn with_params(params: SourceParams) -> Self {
        Self {
            params,
            coords: Mutex::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> &SourceParams {
        &self.params
    }

    /// GDAL dataset name addressing `field` inside `path`
    pub fn subdataset_name(path: &Path, field: &str) -> String {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            // The HDF5 driver exposes group names with spaces as underscores.
            "he5" | "h5" | "hdf5" => format!(
                "HDF5:\"{}\"://{}",
                path.display(),
                field.trim_start_matches('/').replace(' ', "_")
            ),
            "nc" | "nc4" => format!("NETCDF:\"{}\":{}", path.display(), field),
            _ => path.display().to_string(),
        }
    }

    // Grids of the same shape share one coordinate allocation.
    fn global_coords(&self, shape: (usize, usize)) -> TraceResult<Arc<GridCoords>> {
        let mut cache = self
            .coords
            .lock()
            .map_err(|_| TraceError::InvalidGrid("coordinate cache poisoned".to_string()))?;
        if let Some(coords) = cache.get(&shape) {
            return Ok(coords.clone());
        }
        let coords = Arc::new(GridCoords::global(shape.0, shape.1)?);
        cache.insert(shape, coords.clone());
        Ok(coords)
    }

    fn read_once(&self, path: &Path, field: &str) -> TraceResult<ScalarGrid> {
        let name = Self::subdataset_name(path, field);
        let dataset = match Dataset::open(Path::new(&name)) {
            Ok(ds) => ds,
            Err(e) => {
                // Tell a missing field apart from an unreadable file.
                return Err(if Dataset::open(path).is_ok() {
                    TraceError::FieldNotFound {
                        path: path.to_path_buf(),
                        field: field.to_string(),
                    }
                } else {
                    TraceError::FileRead {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    }
                });
            }
        };

        let read_err = |e: gdal::errors::GdalError| TraceError::FileRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let (width, height) = dataset.raster_size();
        log::debug!("{}: {}x{} cells", name, width, height);

        let band = dataset.rasterband(1).map_err(read_err)?;
        let no_data = band.no_data_value();
        let buffer = band
            .read_as::<f64>((0, 0), (width, height), (width, height), None)
            .map_err(read_err)?;

        let threshold = self.params.fill_threshold;
        let data: Vec<f64> = buffer
            .data
            .into_iter()
            .map(|v| {
                if !v.is_finite() || v < threshold || no_data == Some(v) {
                    MISSING
                } else {
                    v
                }
            })
            .collect();

        let values = Array2::from_shape_vec((height, width), data).map_err(|e| {
            TraceError::FileRead {
                path: path.to_path_buf(),
                reason: format!("failed to reshape field data: {}", e),
            }
        })?;
        ScalarGrid::new(self.global_coords((height, width))?, values)
    }
}

impl Default for GdalGridSource {
    fn default() -> Self {
        Self::new()
    }
}

impl GridSource for GdalGridSource {
    fn read_grid(&self, path: &Path, field: &str) -> TraceResult<ScalarGrid> {
        let attempts = self.params.read_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.read_once(path, field) {
                Ok(grid) => return Ok(grid),
                Err(e @ TraceError::FileRead { .. }) => {
                    if attempt < attempts {
                        log::debug!(
                            "Read attempt {} of {} failed for {}: {}",
                            attempt,
                            attempts,
                            path.display(),
                            e
                        );
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| TraceError::FileRead {
            path: path.to_path_buf(),
            reason: "no read attempt made".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_subdataset_names() {
        let field = "HDFEOS/GRIDS/ColumnAmountNO2/Data Fields/ColumnAmountNO2Trop";
        assert_eq!(
            GdalGridSource::subdataset_name(&PathBuf::from("/d/OMI-2005m0101.he5"), field),
            "HDF5:\"/d/OMI-2005m0101.he5\"://HDFEOS/GRIDS/ColumnAmountNO2/Data_Fields/ColumnAmountNO2Trop"
        );
        assert_eq!(
            GdalGridSource::subdataset_name(&PathBuf::from("mean.nc"), "no2"),
            "NETCDF:\"mean.nc\":no2"
        );
    }

    #[test]
    fn test_missing_file_is_file_read_error() {
        let source = GdalGridSource::with_params(SourceParams {
            read_attempts: 3,
            ..Default::default()
        });
        let result = source.read_grid(Path::new("nonexistent_2005m0101.he5"), "no2");
        assert!(matches!(result, Err(TraceError::FileRead { .. })));
    }

    #[test]
    fn test_coordinate_cache_shares_allocation() {
        let source = GdalGridSource::new();
        let a = source.global_coords((720, 1440)).unwrap();
        let b = source.global_coords((720, 1440)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
