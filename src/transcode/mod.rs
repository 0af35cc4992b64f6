//! Batch video re-encoding: metadata probing and caching, encoder supervision, and the
//! selection and conversion loop.

pub mod anomaly;
pub mod cache;
pub mod job;
pub mod monitor;
pub mod orchestrator;
pub mod probe;
pub mod progress;

pub use anomaly::Anomaly;
pub use cache::{BatchOutcome, CacheError, MetadataCache};
pub use job::{CorruptionPolicy, Job};
pub use monitor::{MonitorError, Poll, ProcessMonitor};
pub use orchestrator::{
    Candidate, CodecFilter, CommandBuilder, FileSwapper, Input, JobReport, Orchestrator, OrchestratorSettings,
    Outcome, Response, Selection, SelectionPolicy, State, TickReport, Verdict,
};
pub use probe::{FfprobeProber, ProbeError, ProbeRecord, Prober};
pub use progress::{Extracted, Progress, ProgressExtractor, StallWatch};
