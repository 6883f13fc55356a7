use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rail_analysis::SessionScore;
use rail_model::*;
use serde::{Deserialize, Serialize};

/// One row of the tabular sample export; also what offline evaluation reads back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    pub tick: u64,
    pub time_s: f64,
    pub position_m: f64,
    pub velocity_mps: f64,
    pub acceleration_mps2: f64,
    pub mode: ControlMode,
    pub level: u8,
    pub wall_elapsed_ms: u64,
}

impl From<&TelemetrySample> for SampleRow {
    fn from(s: &TelemetrySample) -> Self {
        Self {
            tick: s.tick,
            time_s: s.state.time_s,
            position_m: s.state.position_m,
            velocity_mps: s.state.velocity_mps,
            acceleration_mps2: s.state.acceleration_mps2,
            mode: s.state.mode,
            level: s.state.level,
            wall_elapsed_ms: s.wall_elapsed_ms,
        }
    }
}

impl From<SampleRow> for TelemetrySample {
    fn from(r: SampleRow) -> Self {
        TelemetrySample {
            tick: r.tick,
            state: VehicleState {
                time_s: r.time_s,
                position_m: r.position_m,
                velocity_mps: r.velocity_mps,
                acceleration_mps2: r.acceleration_mps2,
                mode: r.mode,
                level: r.level,
            },
            wall_elapsed_ms: r.wall_elapsed_ms,
        }
    }
}

pub fn write_samples_csv<W: Write>(samples: &[TelemetrySample], out: W) -> csv::Result<()> {
    let mut w = csv::Writer::from_writer(out);
    for s in samples {
        w.serialize(SampleRow::from(s))?;
    }
    w.flush()?;
    Ok(())
}

pub fn import_samples_csv(path: &Path) -> Result<Vec<TelemetrySample>> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut samples = Vec::new();
    for (i, rec) in rdr.deserialize().enumerate() {
        let row: SampleRow = rec.with_context(|| format!("{} row {}", path.display(), i + 1))?;
        samples.push(row.into());
    }
    Ok(samples)
}

pub fn score_file_name(score: &SessionScore, fallback: &str) -> String {
    match score.session_id {
        Some(id) => format!("evaluation_{}.json", id.simple()),
        None => format!("evaluation_{fallback}.json"),
    }
}

/// Writes `evaluation_<session>.json` into `dir` and returns its path.
pub fn export_score_json(score: &SessionScore, dir: &Path, fallback: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(score_file_name(score, fallback));
    let f = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(f);
    serde_json::to_writer_pretty(&mut w, score)?;
    writeln!(w)?;
    w.flush()?;
    Ok(path)
}

pub fn import_score_json(path: &Path) -> Result<SessionScore> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}
