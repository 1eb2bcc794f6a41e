pub mod error;
pub mod event;
pub mod model;

pub use error::LogamizerError;
pub use event::{AccessEvent, ErrorEvent, StatusClass};
pub use model::{
    AnomalyParams, ErrorGroup, ErrorGroupStatus, ErrorOccurrence, EvidenceSample, Finding,
    HourlyAggregate, LogFile, LogFileKind, LogFileStatus, LogFormat, ParseQuality, Severity, Site,
    TopEntry,
};
