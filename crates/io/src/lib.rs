//! Everything that touches the filesystem: configuration, curve tables,
//! session artifacts and the sample/score files used for offline evaluation.

mod config;
mod curves;
mod report;
mod samples;

pub use config::*;
pub use curves::*;
pub use report::*;
pub use samples::*;
