//! tracegas: gridded satellite trace-gas aggregation
//!
//! Reduces level-3 daily column grids to monthly and annual means, summarizes
//! each annual mean over region polygons (area mean with a nearest-cell
//! fallback for regions smaller than a cell) and fits per-region log-linear
//! trends across years.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use crate::types::{
    GridCoords, Period, Provenance, RegionObservation, RegionPolygon, RegionTimeSeries,
    ScalarGrid, TraceError, TraceResult, TrendResult, MISSING,
};

pub use crate::io::{GdalGridSource, GridSource, RegionCatalog, RegionFilter, RegionPeriodTable, RegionSource};
pub use crate::core::{
    GridReducer, Pipeline, PipelineConfig, ReducerParams, TemporalStacker, ZonalEngine,
};

#[cfg(feature = "python")]
mod python {
    use crate::core::{fit_trend, GridReducer, ReducerParams, TemporalStacker};
    use crate::types::{GridCoords, Period, RegionTimeSeries, ScalarGrid, TraceError};
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;
    use std::sync::Arc;

    fn to_py_err(e: TraceError) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }

    fn to_grids(
        lat: Vec<f64>,
        lon: Vec<f64>,
        arrays: &[PyReadonlyArray2<f64>],
    ) -> PyResult<Vec<ScalarGrid>> {
        let coords = Arc::new(GridCoords::new(lat, lon).map_err(to_py_err)?);
        arrays
            .iter()
            .map(|a| ScalarGrid::new(coords.clone(), a.as_array().to_owned()).map_err(to_py_err))
            .collect()
    }

    /// Cell-wise mean of same-grid arrays; NaN marks missing cells
    #[pyfunction]
    #[pyo3(signature = (lat, lon, grids, min_valid_count = 1, fill_threshold = -1e20))]
    fn reduce_grids<'py>(
        py: Python<'py>,
        lat: Vec<f64>,
        lon: Vec<f64>,
        grids: Vec<PyReadonlyArray2<'py, f64>>,
        min_valid_count: usize,
        fill_threshold: f64,
    ) -> PyResult<&'py PyArray2<f64>> {
        let grids = to_grids(lat, lon, &grids)?;
        let reducer = GridReducer::with_params(ReducerParams {
            min_valid_count,
            fill_threshold,
            ..Default::default()
        });
        let mean = reducer.reduce(&grids).map_err(to_py_err)?;
        Ok(mean.into_values().into_pyarray(py))
    }

    /// Annual mean of monthly mean arrays
    #[pyfunction]
    fn stack_grids<'py>(
        py: Python<'py>,
        lat: Vec<f64>,
        lon: Vec<f64>,
        grids: Vec<PyReadonlyArray2<'py, f64>>,
    ) -> PyResult<&'py PyArray2<f64>> {
        let grids = to_grids(lat, lon, &grids)?;
        let annual = TemporalStacker::new().stack(&grids).map_err(to_py_err)?;
        Ok(annual.into_values().into_pyarray(py))
    }

    /// Slope of log10(value + 1) per year, or None when undefined
    #[pyfunction]
    #[pyo3(name = "fit_trend")]
    fn fit_trend_py(years: Vec<i32>, values: Vec<f64>) -> PyResult<Option<f64>> {
        if years.len() != values.len() {
            return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
                "{} years but {} values",
                years.len(),
                values.len()
            )));
        }
        let points = years.into_iter().map(Period::year).zip(values).collect();
        let series = RegionTimeSeries::new("python", points).map_err(to_py_err)?;
        match fit_trend(&series) {
            Ok(trend) => Ok(Some(trend.slope)),
            Err(e) if e.is_recoverable() => Ok(None),
            Err(e) => Err(to_py_err(e)),
        }
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(reduce_grids, m)?)?;
        m.add_function(wrap_pyfunction!(stack_grids, m)?)?;
        m.add_function(wrap_pyfunction!(fit_trend_py, m)?)?;
        Ok(())
    }
}
