use std::path::Path;

use rail_model::*;
use tracing::debug;

use crate::{ConfigurationError, CurvePaths, RailConfig};

const N_PER_KN: f64 = 1000.0;

/// Reads a two-column table with a header row, scaling each column into SI units.
pub fn load_curve(path: &Path, x_scale: f64, y_scale: f64) -> Result<CurveProfile, ConfigurationError> {
    let table_err = |source| ConfigurationError::CurveTable { path: path.to_path_buf(), source };
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path).map_err(table_err)?;
    let mut pairs = Vec::new();
    for rec in rdr.deserialize() {
        let (x, y): (f64, f64) = rec.map_err(table_err)?;
        pairs.push((x * x_scale, y * y_scale));
    }
    let curve = CurveProfile::from_pairs(&pairs)
        .map_err(|source| ConfigurationError::Curve { path: path.to_path_buf(), source })?;
    debug!(path = %path.display(), points = pairs.len(), "loaded curve");
    Ok(curve)
}

pub fn load_curve_set(paths: &CurvePaths) -> Result<CurveSet, ConfigurationError> {
    let speed = 1.0 / KMH_PER_MPS;
    Ok(CurveSet {
        target: load_curve(&paths.target, 1.0, speed)?,
        ceiling: load_curve(&paths.ceiling, 1.0, speed)?,
        traction: load_curve(&paths.traction, speed, N_PER_KN)?,
        brake: load_curve(&paths.brake, speed, N_PER_KN)?,
    })
}

impl RailConfig {
    pub fn load_curves(&self) -> Result<CurveSet, ConfigurationError> {
        load_curve_set(&self.curves)
    }
}
