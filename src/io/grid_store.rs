use crate::types::{GridCoords, ScalarGrid, TraceError, TraceResult, MISSING};
use ndarray::Array2;
use std::path::Path;
use std::sync::Arc;

/// Write `grid` to a new netCDF file, replacing any existing one.
///
/// The file holds `lat` / `lon` dimensions with matching coordinate
/// variables and one f64 data variable whose missing cells are NaN
/// (`_FillValue = NaN`).
pub fn write_grid<P: AsRef<Path>>(path: P, grid: &ScalarGrid, variable: &str) -> TraceResult<()> {
    let path = path.as_ref();
    log::info!("Writing {} grid to {}", variable, path.display());

    let (n_lat, n_lon) = grid.shape();
    let mut file = netcdf::create(path)?;
    file.add_dimension("lat", n_lat)?;
    file.add_dimension("lon", n_lon)?;

    {
        let mut lat = file.add_variable::<f64>("lat", &["lat"])?;
        lat.put_attribute("units", "degrees_north")?;
        lat.put_values(grid.coords().lat(), ..)?;
    }
    {
        let mut lon = file.add_variable::<f64>("lon", &["lon"])?;
        lon.put_attribute("units", "degrees_east")?;
        lon.put_values(grid.coords().lon(), ..)?;
    }

    let mut var = file.add_variable::<f64>(variable, &["lat", "lon"])?;
    var.set_fill_value(MISSING)?;
    let data: Vec<f64> = grid.values().iter().copied().collect();
    var.put_values(&data, ..)?;

    log::debug!("Wrote {}x{} grid, {} valid cells", n_lat, n_lon, grid.valid_count());
    Ok(())
}

/// Read a grid written by [`write_grid`] (or any file with the same layout)
pub fn read_grid<P: AsRef<Path>>(path: P, variable: &str) -> TraceResult<ScalarGrid> {
    let path = path.as_ref();
    log::debug!("Reading {} grid from {}", variable, path.display());

    let read_err = |e: netcdf::Error| TraceError::FileRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let file = netcdf::open(path).map_err(read_err)?;
    let var = file.variable(variable).ok_or_else(|| TraceError::FieldNotFound {
        path: path.to_path_buf(),
        field: variable.to_string(),
    })?;

    let dims = var.dimensions();
    if dims.len() != 2 {
        return Err(TraceError::InvalidGrid(format!(
            "{} in {} has {} dimensions, expected (lat, lon)",
            variable,
            path.display(),
            dims.len()
        )));
    }
    let (lat_name, lon_name) = (dims[0].name(), dims[1].name());
    let shape = (dims[0].len(), dims[1].len());

    let coordinate = |name: &str| -> TraceResult<Vec<f64>> {
        file.variable(name)
            .ok_or_else(|| TraceError::FieldNotFound {
                path: path.to_path_buf(),
                field: name.to_string(),
            })?
            .get_values::<f64, _>(..)
            .map_err(read_err)
    };
    let coords = Arc::new(GridCoords::new(coordinate(&lat_name)?, coordinate(&lon_name)?)?);

    let fill = fill_value(&var);
    let data: Vec<f64> = var
        .get_values::<f64, _>(..)
        .map_err(read_err)?
        .into_iter()
        .map(|v| if fill == Some(v) { MISSING } else { v })
        .collect();

    let values = Array2::from_shape_vec(shape, data)
        .map_err(|e| TraceError::InvalidGrid(format!("failed to reshape {}: {}", variable, e)))?;
    ScalarGrid::new(coords, values)
}

/// Non-NaN `_FillValue` of a variable, if declared
fn fill_value(var: &netcdf::Variable) -> Option<f64> {
    if !var.attributes().any(|attr| attr.name() == "_FillValue") {
        return None;
    }
    let value = match var.attribute_value("_FillValue")?.ok()? {
        netcdf::AttributeValue::Double(v) => v,
        netcdf::AttributeValue::Float(v) => v as f64,
        _ => return None,
    };
    (!value.is_nan()).then_some(value)
}
