//! Session state machine
//!
//! Gates HRV measurement windows by playback state. A song is tagged when
//! playback is detected, settles for a fixed window so the reaction to
//! starting playback is excluded, then records readings until the song stops,
//! changes, or the session ends. Every ending runs the finalize rule, which
//! either discards the song (never measured) or appends a [`SongSessionResult`].
//!
//! All operations are infallible. A call that makes no sense in the current
//! phase is a silent no-op, because upstream event sources can race with the
//! user ending the session.

use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::hrv::time_domain::mean;
use crate::types::{
    HrvMetrics, SessionPhase, SessionSnapshot, SongSessionResult, TaggedSong, Track,
};

/// Single-writer controller for one listening session
#[derive(Debug, Clone)]
pub struct SessionManager {
    config: SessionConfig,
    phase: SessionPhase,
    /// Present exactly while the phase is settling or recording
    current_song: Option<TaggedSong>,
    pending_song: Option<Track>,
    results: Vec<SongSessionResult>,
    settle_countdown_sec: u64,
    recording_duration_sec: u64,
    /// Latest timestamp any call has supplied
    last_seen_ms: Option<i64>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            phase: SessionPhase::NotStarted,
            current_song: None,
            pending_song: None,
            results: Vec::new(),
            settle_countdown_sec: 0,
            recording_duration_sec: 0,
            last_seen_ms: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn current_song(&self) -> Option<&TaggedSong> {
        self.current_song.as_ref()
    }

    pub fn pending_song(&self) -> Option<&Track> {
        self.pending_song.as_ref()
    }

    /// Finalized results in the order their songs ended
    pub fn results(&self) -> &[SongSessionResult] {
        &self.results
    }

    pub fn settle_countdown_sec(&self) -> u64 {
        self.settle_countdown_sec
    }

    pub fn recording_duration_sec(&self) -> u64 {
        self.recording_duration_sec
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            current_track: self.current_song.as_ref().map(|s| s.track.clone()),
            current_readings: self
                .current_song
                .as_ref()
                .map_or(0, TaggedSong::reading_count),
            pending_track: self.pending_song.clone(),
            settle_countdown_sec: self.settle_countdown_sec,
            recording_duration_sec: self.recording_duration_sec,
            result_count: self.results.len(),
        }
    }

    /// Begin a session from `NOT_STARTED` or `ENDED`
    pub fn start_session(&mut self) {
        if self.phase.is_active() {
            return;
        }
        self.current_song = None;
        self.pending_song = None;
        self.results.clear();
        self.settle_countdown_sec = 0;
        self.recording_duration_sec = 0;
        self.transition(SessionPhase::ActiveNoSong);
        info!("session started");
    }

    /// Record the user's intended track and wait for it to start playing.
    ///
    /// A song still under measurement is finalized at the latest timestamp
    /// seen so far; use [`select_song_at`](Self::select_song_at) when the
    /// selection time is known.
    pub fn select_song(&mut self, track: Track) {
        let now_ms = self
            .last_seen_ms
            .or_else(|| self.current_song.as_ref().map(|song| song.tagged_at_ms))
            .unwrap_or_default();
        self.select_song_at(track, now_ms);
    }

    /// [`select_song`](Self::select_song) with an explicit selection time
    pub fn select_song_at(&mut self, track: Track, now_ms: i64) {
        if !self.phase.is_active() {
            return;
        }
        self.observe(now_ms);
        if self.current_song.is_some() {
            self.finalize_current(now_ms);
        }
        debug!(title = %track.title, artist = %track.artist, "song selected");
        self.pending_song = Some(track);
        self.settle_countdown_sec = 0;
        self.recording_duration_sec = 0;
        self.transition(SessionPhase::ActiveWaitingPlayback);
    }

    /// Playback started; tag the pending track, or the detected one if none
    pub fn on_playback_detected(&mut self, title: &str, artist: &str, now_ms: i64) {
        if !self.phase.is_active() {
            return;
        }
        let track = self
            .pending_song
            .take()
            .unwrap_or_else(|| Track::detected(title, artist));
        self.tag_song(track, now_ms);
    }

    /// Track metadata changed mid-playback; the pending slot is not consulted
    pub fn on_song_changed(&mut self, title: &str, artist: &str, now_ms: i64) {
        if !self.phase.is_active() {
            return;
        }
        self.tag_song(Track::detected(title, artist), now_ms);
    }

    /// Playback stopped; finalize the song under measurement
    pub fn on_playback_stopped(&mut self, now_ms: i64) {
        if !self.phase.is_measuring() {
            return;
        }
        self.observe(now_ms);
        self.finalize_current(now_ms);
        self.settle_countdown_sec = 0;
        self.recording_duration_sec = 0;
        self.transition(SessionPhase::ActiveNoSong);
    }

    /// Feed a metrics snapshot. Settling advances the countdown only; readings
    /// are appended while recording. The snapshot that ends settling is not
    /// recorded.
    pub fn record_metrics(&mut self, metrics: &HrvMetrics, now_ms: i64) {
        let Some(tagged_at_ms) = self.current_song.as_ref().map(|song| song.tagged_at_ms) else {
            return;
        };
        self.observe(now_ms);
        let settle_ms = self.config.settle_duration_ms;

        match self.phase {
            SessionPhase::ActiveSettling => {
                let elapsed = now_ms - tagged_at_ms;
                self.settle_countdown_sec = ((settle_ms - elapsed).max(0) / 1000) as u64;
                if elapsed >= settle_ms {
                    self.recording_duration_sec = 0;
                    self.transition(SessionPhase::ActiveRecording);
                }
            }
            SessionPhase::ActiveRecording => {
                if let Some(song) = self.current_song.as_mut() {
                    song.push_reading(metrics);
                }
                self.recording_duration_sec =
                    ((now_ms - tagged_at_ms - settle_ms).max(0) / 1000) as u64;
            }
            _ => {}
        }
    }

    /// Mark the current song as affected by movement (sticky until finalized)
    pub fn report_movement(&mut self) {
        if let Some(song) = self.current_song.as_mut() {
            if !song.movement_detected {
                debug!(title = %song.track.title, "movement detected during song");
            }
            song.movement_detected = true;
        }
    }

    /// Finalize any song in progress and end the session; results are kept
    pub fn end_session(&mut self, now_ms: i64) {
        if !self.phase.is_active() {
            return;
        }
        self.observe(now_ms);
        self.finalize_current(now_ms);
        self.pending_song = None;
        self.settle_countdown_sec = 0;
        self.recording_duration_sec = 0;
        self.transition(SessionPhase::Ended);
        info!(results = self.results.len(), "session ended");
    }

    /// Return to `NOT_STARTED`, dropping all songs and results
    pub fn reset(&mut self) {
        self.current_song = None;
        self.pending_song = None;
        self.results.clear();
        self.settle_countdown_sec = 0;
        self.recording_duration_sec = 0;
        self.last_seen_ms = None;
        self.transition(SessionPhase::NotStarted);
    }

    fn tag_song(&mut self, track: Track, now_ms: i64) {
        self.observe(now_ms);
        self.finalize_current(now_ms);
        debug!(title = %track.title, artist = %track.artist, "song tagged");
        self.current_song = Some(TaggedSong::new(track, now_ms));
        self.settle_countdown_sec = (self.config.settle_duration_ms / 1000) as u64;
        self.recording_duration_sec = 0;
        self.transition(SessionPhase::ActiveSettling);
    }

    /// Apply the finalize rule to the current song, if any
    fn finalize_current(&mut self, now_ms: i64) {
        let Some(song) = self.current_song.take() else {
            return;
        };

        let listened_ms = now_ms - song.tagged_at_ms - self.config.settle_duration_ms;
        let duration_listened_sec = (listened_ms.max(0) / 1000) as u64;

        if song.reading_count() == 0 && duration_listened_sec == 0 {
            info!(title = %song.track.title, "discarding unmeasured song");
            return;
        }

        let result = SongSessionResult {
            avg_coherence: mean(&song.coherence_readings).unwrap_or(0.0),
            avg_rmssd: mean(&song.rmssd_readings).unwrap_or(0.0),
            mean_hr: mean(&song.hr_readings).unwrap_or(0.0),
            duration_listened_sec,
            is_valid: duration_listened_sec >= self.config.min_recording_sec,
            movement_detected: song.movement_detected,
            track: song.track,
        };
        info!(
            title = %result.track.title,
            duration_sec = result.duration_listened_sec,
            valid = result.is_valid,
            avg_coherence = result.avg_coherence,
            "song finalized"
        );
        self.results.push(result);
    }

    fn observe(&mut self, now_ms: i64) {
        self.last_seen_ms = Some(now_ms);
    }

    fn transition(&mut self, next: SessionPhase) {
        if self.phase != next {
            debug!(from = self.phase.as_str(), to = next.as_str(), "phase transition");
            self.phase = next;
        }
    }
}
