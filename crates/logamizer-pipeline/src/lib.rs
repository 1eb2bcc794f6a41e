pub mod driver;
pub mod progress;

pub use driver::{
    DriverSettings, ErrorAnalysisReport, IngestReport, PipelineDriver, ReanalyzeReport,
};
pub use progress::{ProgressUpdate, WatchProgress};
