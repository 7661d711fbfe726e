//! HrvXo core - per-song heart rate variability coherence
//!
//! RR intervals from a chest strap or watch are turned into rolling coherence,
//! RMSSD and heart rate snapshots. A session state machine gates those
//! snapshots by music playback so each song gets its own measurement window:
//! device batches → HRV processor → session state machine → song results.
//!
//! ## Modules
//!
//! - **HRV**: rolling-window time-domain and spectral metrics
//! - **Session**: playback-gated state machine producing per-song results
//! - **Pipeline**: single-writer event loop wiring device, playback and user events

pub mod config;
pub mod error;
pub mod hrv;
pub mod movement;
pub mod pipeline;
pub mod session;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use config::{CoreConfig, HrvConfig, MovementConfig, SessionConfig};
pub use error::CoreError;
pub use hrv::HrvProcessor;
pub use movement::MovementGate;
pub use pipeline::{
    spawn_session_loop, InMemorySink, ResultSink, SessionEvent, SessionHandle, SessionPipeline,
    SessionReport,
};
pub use session::SessionManager;
pub use types::{HrvMetrics, SessionPhase, SessionSnapshot, SongSessionResult, TaggedSong, Track};

/// Library version
pub const HRVXO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "hrvxo-core";
