pub mod baseline;
pub mod detector;
pub mod store;

pub use baseline::{compute_baseline, Baseline, BaselineStore};
pub use detector::{AnomalyDetector, DetectorPhase, DetectorSettings};
pub use store::{MetricSample, MetricStore};
