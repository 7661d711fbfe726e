//! Core types for HrvXo
//!
//! Data that flows from the heart-rate device through the HRV processor and
//! into the session state machine, plus the finalized per-song results it emits.

use serde::{Deserialize, Serialize};

/// A batch of inter-beat intervals as delivered by the device layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RrBatch {
    /// RR intervals in milliseconds, in arrival order
    pub intervals: Vec<i32>,
    /// Wall-clock receipt time (epoch milliseconds)
    pub received_at_ms: i64,
}

impl RrBatch {
    pub fn new(intervals: Vec<i32>, received_at_ms: i64) -> Self {
        Self {
            intervals,
            received_at_ms,
        }
    }
}

/// Snapshot of derived HRV metrics over the current rolling window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HrvMetrics {
    /// Fraction of spectral power in the coherence band (soft bound 0-1)
    pub coherence_score: f64,
    /// Root mean square of successive differences (ms)
    pub rmssd: f64,
    /// Mean heart rate (bpm)
    pub mean_hr: f64,
}

/// Identity of a song, either picked by the user or detected from playback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// External catalog id; absent when the track came from playback metadata only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    /// May be empty
    #[serde(default)]
    pub artist: String,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            title: title.into(),
            artist: artist.into(),
        }
    }

    /// Track built from detected playback metadata, with no external id
    pub fn detected(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            artist: artist.into(),
        }
    }
}

/// Phase of a listening session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    NotStarted,
    ActiveNoSong,
    ActiveWaitingPlayback,
    ActiveSettling,
    ActiveRecording,
    Ended,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::NotStarted => "NOT_STARTED",
            SessionPhase::ActiveNoSong => "ACTIVE_NO_SONG",
            SessionPhase::ActiveWaitingPlayback => "ACTIVE_WAITING_PLAYBACK",
            SessionPhase::ActiveSettling => "ACTIVE_SETTLING",
            SessionPhase::ActiveRecording => "ACTIVE_RECORDING",
            SessionPhase::Ended => "ENDED",
        }
    }

    /// Whether the session is running (neither not started nor ended)
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionPhase::NotStarted | SessionPhase::Ended)
    }

    /// Whether a song is under measurement in this phase
    pub fn is_measuring(&self) -> bool {
        matches!(
            self,
            SessionPhase::ActiveSettling | SessionPhase::ActiveRecording
        )
    }

    /// Whether the session is idle between songs
    pub fn is_awaiting_song(&self) -> bool {
        matches!(
            self,
            SessionPhase::ActiveNoSong | SessionPhase::ActiveWaitingPlayback
        )
    }
}

/// Accumulator for the song currently under measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedSong {
    pub track: Track,
    /// When the song entered settling (epoch milliseconds)
    pub tagged_at_ms: i64,
    pub coherence_readings: Vec<f64>,
    pub rmssd_readings: Vec<f64>,
    pub hr_readings: Vec<f64>,
    /// Sticky for the lifetime of the song
    pub movement_detected: bool,
}

impl TaggedSong {
    pub fn new(track: Track, tagged_at_ms: i64) -> Self {
        Self {
            track,
            tagged_at_ms,
            coherence_readings: Vec::new(),
            rmssd_readings: Vec::new(),
            hr_readings: Vec::new(),
            movement_detected: false,
        }
    }

    pub fn reading_count(&self) -> usize {
        self.coherence_readings.len()
    }

    pub(crate) fn push_reading(&mut self, metrics: &HrvMetrics) {
        self.coherence_readings.push(metrics.coherence_score);
        self.rmssd_readings.push(metrics.rmssd);
        self.hr_readings.push(metrics.mean_hr);
    }
}

/// Finalized measurement for one song
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongSessionResult {
    pub track: Track,
    pub avg_coherence: f64,
    pub avg_rmssd: f64,
    pub mean_hr: f64,
    /// Seconds listened after the settle window
    pub duration_listened_sec: u64,
    /// Whether the recording reached the minimum duration
    pub is_valid: bool,
    pub movement_detected: bool,
}

/// Point-in-time view of the session state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub current_track: Option<Track>,
    pub current_readings: usize,
    pub pending_track: Option<Track>,
    pub settle_countdown_sec: u64,
    pub recording_duration_sec: u64,
    pub result_count: usize,
}
