//! Session artifacts: speed-curve image, event log, sample table.
//!
//! Every artifact is written to a temporary sibling and renamed into place, so
//! a failed write leaves either nothing or the previous complete file. The
//! three are generated from the same sample slice and never refer to each
//! other, so any subset of them is still usable.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use rail_model::*;
use serde_json::json;
use time::{macros::format_description, OffsetDateTime};
use tracing::{info, warn};

use crate::write_samples_csv;

#[derive(Debug, thiserror::Error)]
pub enum DataIntegrityError {
    #[error("writing {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("encoding {}: {source}", path.display())]
    Csv { path: PathBuf, source: csv::Error },
    #[error("encoding {}: {source}", path.display())]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("rendering {}: {source}", path.display())]
    Image { path: PathBuf, source: image::ImageError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    SpeedCurve,
    EventLog,
    SampleTable,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::SpeedCurve, ArtifactKind::EventLog, ArtifactKind::SampleTable];

    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::SpeedCurve => "png",
            ArtifactKind::EventLog => "log",
            ArtifactKind::SampleTable => "csv",
        }
    }
}

#[derive(Debug, Default)]
pub struct ReportOutcome {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(ArtifactKind, DataIntegrityError)>,
}

impl ReportOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// `YYYYMMDD_HHMMSS`, used to key artifact file names.
pub fn session_stamp(at: OffsetDateTime) -> String {
    let fmt = format_description!("[year][month][day]_[hour][minute][second]");
    at.format(&fmt).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

pub struct ReportGenerator {
    out_dir: PathBuf,
    stamp: String,
}

impl ReportGenerator {
    pub fn new(out_dir: impl Into<PathBuf>, stamp: impl Into<String>) -> Self {
        Self { out_dir: out_dir.into(), stamp: stamp.into() }
    }

    pub fn path_for(&self, kind: ArtifactKind) -> PathBuf {
        self.out_dir.join(format!("simulation_{}.{}", self.stamp, kind.extension()))
    }

    /// Writes all three artifacts. Failures are collected, not propagated:
    /// one artifact failing never removes another.
    pub fn write_all(
        &self,
        log: &SessionLog,
        samples: &[TelemetrySample],
        summary: Option<&ScoreRecord>,
        curves: &CurveSet,
    ) -> ReportOutcome {
        let mut outcome = ReportOutcome::default();
        if let Err(source) = fs::create_dir_all(&self.out_dir) {
            warn!(dir = %self.out_dir.display(), error = %source, "cannot create report directory");
            let err = DataIntegrityError::Io { path: self.out_dir.clone(), source };
            outcome.failed.push((ArtifactKind::SpeedCurve, err));
            for kind in [ArtifactKind::EventLog, ArtifactKind::SampleTable] {
                let path = self.path_for(kind);
                let source = std::io::Error::new(std::io::ErrorKind::NotFound, "report directory unavailable");
                outcome.failed.push((kind, DataIntegrityError::Io { path, source }));
            }
            return outcome;
        }

        for kind in ArtifactKind::ALL {
            let path = self.path_for(kind);
            let res = match kind {
                ArtifactKind::SpeedCurve => self.write_image(&path, samples, curves),
                ArtifactKind::EventLog => write_event_log(&path, log, samples.len(), summary),
                ArtifactKind::SampleTable => write_sample_table(&path, samples),
            };
            match res {
                Ok(()) => {
                    info!(path = %path.display(), "wrote artifact");
                    outcome.written.push(path);
                }
                Err(e) => {
                    warn!(error = %e, "artifact not written");
                    outcome.failed.push((kind, e));
                }
            }
        }
        outcome
    }

    fn write_image(&self, path: &Path, samples: &[TelemetrySample], curves: &CurveSet) -> Result<(), DataIntegrityError> {
        let img = render_speed_curve(samples, curves);
        let tmp = tmp_path(path);
        let res = img
            .save_with_format(&tmp, ImageFormat::Png)
            .map_err(|source| DataIntegrityError::Image { path: path.to_path_buf(), source })
            .and_then(|()| commit(&tmp, path));
        if res.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        res
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn commit(tmp: &Path, path: &Path) -> Result<(), DataIntegrityError> {
    fs::rename(tmp, path).map_err(|source| DataIntegrityError::Io { path: path.to_path_buf(), source })
}

fn write_atomic<F>(path: &Path, body: F) -> Result<(), DataIntegrityError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), DataIntegrityError>,
{
    let tmp = tmp_path(path);
    let io_err = |source| DataIntegrityError::Io { path: path.to_path_buf(), source };
    let res = (|| -> Result<(), DataIntegrityError> {
        let mut w = BufWriter::new(File::create(&tmp).map_err(io_err)?);
        body(&mut w)?;
        w.flush().map_err(io_err)?;
        drop(w);
        commit(&tmp, path)
    })();
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}

/// One JSON object per line: the operation trace, then a closing summary line.
fn write_event_log(
    path: &Path,
    log: &SessionLog,
    sample_count: usize,
    summary: Option<&ScoreRecord>,
) -> Result<(), DataIntegrityError> {
    write_atomic(path, |w| {
        let json_err = |source| DataIntegrityError::Json { path: path.to_path_buf(), source };
        let io_err = |source| DataIntegrityError::Io { path: path.to_path_buf(), source };
        for entry in log.entries() {
            serde_json::to_writer(&mut *w, entry).map_err(json_err)?;
            writeln!(w).map_err(io_err)?;
        }
        let last_t = log.entries().last().map(|e| e.time_s).unwrap_or(0.0);
        let closing = json!({ "time_s": last_t, "event": "report", "samples": sample_count, "score": summary });
        serde_json::to_writer(&mut *w, &closing).map_err(json_err)?;
        writeln!(w).map_err(io_err)
    })
}

fn write_sample_table(path: &Path, samples: &[TelemetrySample]) -> Result<(), DataIntegrityError> {
    write_atomic(path, |w| {
        write_samples_csv(samples, &mut *w).map_err(|source| DataIntegrityError::Csv { path: path.to_path_buf(), source })
    })
}

const WIDTH: u32 = 960;
const HEIGHT: u32 = 480;
const MARGIN: f32 = 40.0;
const CURVE_STEPS: usize = 240;

/// Speed (km/h) against position: ceiling in red, target in green, actual in blue.
pub fn render_speed_curve(samples: &[TelemetrySample], curves: &CurveSet) -> RgbImage {
    let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([255, 255, 255]));

    let (x0, mut x1) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
        (lo.min(s.state.position_m), hi.max(s.state.position_m))
    });
    let x0 = if x0.is_finite() { x0 } else { 0.0 };
    if !(x1 > x0) {
        x1 = x0 + 1.0;
    }

    let along = |i: usize| x0 + (x1 - x0) * i as f64 / CURVE_STEPS as f64;
    let target: Vec<(f64, f64)> = (0..=CURVE_STEPS).map(|i| (along(i), mps_to_kmh(curves.target_speed(along(i))))).collect();
    let ceiling: Vec<(f64, f64)> = (0..=CURVE_STEPS).map(|i| (along(i), mps_to_kmh(curves.ceiling_speed(along(i))))).collect();
    let actual: Vec<(f64, f64)> = samples.iter().map(|s| (s.state.position_m, mps_to_kmh(s.state.velocity_mps))).collect();

    let y_max = target
        .iter()
        .chain(&ceiling)
        .chain(&actual)
        .map(|p| p.1)
        .filter(|v| v.is_finite())
        .fold(1.0_f64, f64::max)
        * 1.1;

    let plot_w = WIDTH as f32 - 2.0 * MARGIN;
    let plot_h = HEIGHT as f32 - 2.0 * MARGIN;
    let to_px = |(x, y): (f64, f64)| -> (f32, f32) {
        let px = MARGIN + ((x - x0) / (x1 - x0)) as f32 * plot_w;
        let py = HEIGHT as f32 - MARGIN - (y / y_max) as f32 * plot_h;
        (px, py)
    };

    let axis = Rgb([60, 60, 60]);
    let origin = (MARGIN, HEIGHT as f32 - MARGIN);
    draw_line_segment_mut(&mut img, origin, (WIDTH as f32 - MARGIN, origin.1), axis);
    draw_line_segment_mut(&mut img, origin, (MARGIN, MARGIN), axis);

    let mut polyline = |pts: &[(f64, f64)], color: Rgb<u8>| {
        for pair in pts.windows(2) {
            draw_line_segment_mut(&mut img, to_px(pair[0]), to_px(pair[1]), color);
        }
    };
    polyline(&ceiling, Rgb([200, 30, 30]));
    polyline(&target, Rgb([30, 150, 30]));
    polyline(&actual, Rgb([20, 60, 200]));
    img
}
