//! HRV metric extraction
//!
//! RR interval batches go in, coherence / RMSSD / mean heart rate snapshots
//! come out. This module knows nothing about sessions or playback.

mod processor;
pub mod spectral;
pub mod time_domain;

pub use processor::HrvProcessor;
pub use spectral::{SpectralAnalyzer, SpectralSummary};
