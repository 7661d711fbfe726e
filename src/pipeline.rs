//! Session pipeline
//!
//! Wires the HRV processor, movement gate and session state machine behind a
//! single event type. Device, playback and user events are funneled through
//! one [`SessionPipeline`] owner, either called directly or driven by
//! [`spawn_session_loop`] on its own thread. Producers only ever send events;
//! the owner is the single writer of session state.
//!
//! ```ignore
//! let handle = spawn_session_loop(SessionPipeline::default(), InMemorySink::default())?;
//! let device = handle.sender();
//! device.send(SessionEvent::RrBatch { timestamp_ms, intervals })?;
//! let (pipeline, sink) = handle.join()?;
//! ```

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::hrv::HrvProcessor;
use crate::movement::MovementGate;
use crate::session::SessionManager;
use crate::types::{HrvMetrics, SessionPhase, SessionSnapshot, SongSessionResult, Track};

/// Track metadata as reported by the playback notification layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedTrack {
    pub title: String,
    #[serde(default)]
    pub artist: String,
}

impl DetectedTrack {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
        }
    }
}

/// Everything that can happen to a session, from any producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StartSession {
        timestamp_ms: i64,
        /// Track already playing when the session starts
        #[serde(default)]
        now_playing: Option<DetectedTrack>,
        #[serde(default)]
        is_playing: bool,
    },
    SelectSong {
        timestamp_ms: i64,
        track: Track,
    },
    RrBatch {
        timestamp_ms: i64,
        intervals: Vec<i32>,
    },
    /// Raw metadata notification, routed through the playback monitor
    TrackChanged {
        timestamp_ms: i64,
        title: String,
        #[serde(default)]
        artist: String,
    },
    /// Raw playing-state notification, routed through the playback monitor
    PlaybackState {
        timestamp_ms: i64,
        playing: bool,
    },
    PlaybackDetected {
        timestamp_ms: i64,
        title: String,
        #[serde(default)]
        artist: String,
    },
    SongChanged {
        timestamp_ms: i64,
        title: String,
        #[serde(default)]
        artist: String,
    },
    PlaybackStopped {
        timestamp_ms: i64,
    },
    /// Linear acceleration sample (m/s², gravity removed)
    Acceleration {
        timestamp_ms: i64,
        x: f64,
        y: f64,
        z: f64,
    },
    /// Pre-classified movement from an external detector
    Movement {
        timestamp_ms: i64,
        moving: bool,
    },
    DeviceDisconnected {
        timestamp_ms: i64,
    },
    EndSession {
        timestamp_ms: i64,
    },
    Reset {
        timestamp_ms: i64,
    },
    /// Stops the owner loop; ignored by [`SessionPipeline::handle`]
    Shutdown {
        #[serde(default)]
        timestamp_ms: i64,
    },
}

impl SessionEvent {
    /// Parse one JSON event. Well-formed JSON that is not a known event with
    /// the right fields is [`CoreError::InvalidEvent`].
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| match e.classify() {
            Category::Data => CoreError::InvalidEvent(e.to_string()),
            _ => CoreError::Json(e),
        })
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            SessionEvent::StartSession { timestamp_ms, .. }
            | SessionEvent::SelectSong { timestamp_ms, .. }
            | SessionEvent::RrBatch { timestamp_ms, .. }
            | SessionEvent::TrackChanged { timestamp_ms, .. }
            | SessionEvent::PlaybackState { timestamp_ms, .. }
            | SessionEvent::PlaybackDetected { timestamp_ms, .. }
            | SessionEvent::SongChanged { timestamp_ms, .. }
            | SessionEvent::PlaybackStopped { timestamp_ms }
            | SessionEvent::Acceleration { timestamp_ms, .. }
            | SessionEvent::Movement { timestamp_ms, .. }
            | SessionEvent::DeviceDisconnected { timestamp_ms }
            | SessionEvent::EndSession { timestamp_ms }
            | SessionEvent::Reset { timestamp_ms }
            | SessionEvent::Shutdown { timestamp_ms } => *timestamp_ms,
        }
    }

    /// Wire name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::StartSession { .. } => "start_session",
            SessionEvent::SelectSong { .. } => "select_song",
            SessionEvent::RrBatch { .. } => "rr_batch",
            SessionEvent::TrackChanged { .. } => "track_changed",
            SessionEvent::PlaybackState { .. } => "playback_state",
            SessionEvent::PlaybackDetected { .. } => "playback_detected",
            SessionEvent::SongChanged { .. } => "song_changed",
            SessionEvent::PlaybackStopped { .. } => "playback_stopped",
            SessionEvent::Acceleration { .. } => "acceleration",
            SessionEvent::Movement { .. } => "movement",
            SessionEvent::DeviceDisconnected { .. } => "device_disconnected",
            SessionEvent::EndSession { .. } => "end_session",
            SessionEvent::Reset { .. } => "reset",
            SessionEvent::Shutdown { .. } => "shutdown",
        }
    }
}

/// State machine call derived from raw playback notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackAction {
    Detected(DetectedTrack),
    Changed(DetectedTrack),
    Stopped,
}

/// Turns raw playback notifications into state machine calls.
///
/// The track playing when the session started is a baseline and never counts
/// as detected playback. Nothing is routed until the user has selected a song.
#[derive(Debug, Clone, Default)]
pub struct PlaybackMonitor {
    baseline: Option<DetectedTrack>,
    current: Option<DetectedTrack>,
    last_routed: Option<DetectedTrack>,
    playing: bool,
    user_selected: bool,
}

impl PlaybackMonitor {
    /// Monitor for a session starting with `now_playing` on the player
    pub fn armed(now_playing: Option<DetectedTrack>, playing: bool) -> Self {
        Self {
            baseline: now_playing.clone(),
            current: now_playing.clone(),
            last_routed: now_playing,
            playing,
            user_selected: false,
        }
    }

    pub fn note_selection(&mut self) {
        self.user_selected = true;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn on_track_changed(
        &mut self,
        track: DetectedTrack,
        phase: SessionPhase,
    ) -> Option<PlaybackAction> {
        self.current = Some(track.clone());
        if !self.user_selected {
            return None;
        }

        let is_new = self.last_routed.as_ref() != Some(&track);
        let action = (self.playing && is_new).then(|| {
            if phase.is_awaiting_song() {
                PlaybackAction::Detected(track.clone())
            } else {
                PlaybackAction::Changed(track.clone())
            }
        });
        self.last_routed = Some(track);
        action
    }

    pub fn on_playing_changed(
        &mut self,
        playing: bool,
        phase: SessionPhase,
    ) -> Option<PlaybackAction> {
        let was_playing = std::mem::replace(&mut self.playing, playing);
        if !self.user_selected || was_playing == playing {
            return None;
        }
        if !playing {
            return Some(PlaybackAction::Stopped);
        }

        let track = self.current.clone()?;
        if self.baseline.as_ref() == Some(&track) || !phase.is_awaiting_song() {
            return None;
        }
        self.last_routed = Some(track.clone());
        Some(PlaybackAction::Detected(track))
    }
}

/// Summary of one session as handed to result sinks and the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub results: Vec<SongSessionResult>,
}

impl SessionReport {
    pub fn valid_results(&self) -> impl Iterator<Item = &SongSessionResult> {
        self.results.iter().filter(|r| r.is_valid)
    }

    /// Valid results by average coherence, highest first; ties keep song order
    pub fn ranked(&self) -> Vec<&SongSessionResult> {
        let mut ranked: Vec<_> = self.valid_results().collect();
        ranked.sort_by(|a, b| b.avg_coherence.total_cmp(&a.avg_coherence));
        ranked
    }

    /// Hand every valid result to `sink`, returning how many were accepted.
    /// A rejected result is logged and skipped.
    pub fn deliver_to<S: ResultSink + ?Sized>(&self, sink: &mut S) -> usize {
        let mut delivered = 0;
        for result in self.valid_results() {
            match sink.persist(&self.session_id, result) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    session_id = %self.session_id,
                    title = %result.track.title,
                    error = %e,
                    "failed to persist song result"
                ),
            }
        }
        delivered
    }
}

/// Destination for finalized, valid song results
pub trait ResultSink {
    fn persist(&mut self, session_id: &Uuid, result: &SongSessionResult) -> Result<(), CoreError>;
}

/// Sink that keeps results in memory
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    pub stored: Vec<(Uuid, SongSessionResult)>,
}

impl ResultSink for InMemorySink {
    fn persist(&mut self, session_id: &Uuid, result: &SongSessionResult) -> Result<(), CoreError> {
        self.stored.push((*session_id, result.clone()));
        Ok(())
    }
}

/// Owner of all per-session state
#[derive(Debug, Clone)]
pub struct SessionPipeline {
    config: CoreConfig,
    hrv: HrvProcessor,
    movement: MovementGate,
    session: SessionManager,
    monitor: PlaybackMonitor,
    session_id: Option<Uuid>,
    started_at_ms: Option<i64>,
    ended_at_ms: Option<i64>,
    last_metrics: Option<HrvMetrics>,
}

impl Default for SessionPipeline {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl SessionPipeline {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            hrv: HrvProcessor::new(config.hrv.clone()),
            movement: MovementGate::new(config.movement.clone()),
            session: SessionManager::new(config.session.clone()),
            monitor: PlaybackMonitor::default(),
            config,
            session_id: None,
            started_at_ms: None,
            ended_at_ms: None,
            last_metrics: None,
        }
    }

    /// Build from a JSON config, validating it first
    pub fn from_config_json(json: &str) -> Result<Self, CoreError> {
        Ok(Self::new(CoreConfig::from_json(json)?))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn hrv(&self) -> &HrvProcessor {
        &self.hrv
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Most recent metrics snapshot, whether or not it was recorded
    pub fn last_metrics(&self) -> Option<HrvMetrics> {
        self.last_metrics
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Report for the current or last session, if one was started
    pub fn report(&self) -> Option<SessionReport> {
        let session_id = self.session_id?;
        let started_at = to_utc(self.started_at_ms?);
        Some(SessionReport {
            session_id,
            started_at,
            ended_at: self.ended_at_ms.map(to_utc),
            results: self.session.results().to_vec(),
        })
    }

    /// Apply one event. Returns the session report when the event ended a
    /// session.
    pub fn handle(&mut self, event: SessionEvent) -> Option<SessionReport> {
        debug!(event = event.kind(), timestamp_ms = event.timestamp_ms(), "event");
        match event {
            SessionEvent::StartSession {
                timestamp_ms,
                now_playing,
                is_playing,
            } => self.start(timestamp_ms, now_playing, is_playing),
            SessionEvent::SelectSong {
                timestamp_ms,
                track,
            } => {
                self.session.select_song_at(track, timestamp_ms);
                if self.session.phase() == SessionPhase::ActiveWaitingPlayback {
                    self.monitor.note_selection();
                }
            }
            SessionEvent::RrBatch {
                timestamp_ms,
                intervals,
            } => {
                if let Some(metrics) = self.hrv.add_rr_intervals(&intervals, timestamp_ms) {
                    self.last_metrics = Some(metrics);
                    if self.session.phase().is_measuring() {
                        self.session.record_metrics(&metrics, timestamp_ms);
                    }
                }
            }
            SessionEvent::TrackChanged {
                timestamp_ms,
                title,
                artist,
            } => {
                let action = self
                    .monitor
                    .on_track_changed(DetectedTrack { title, artist }, self.session.phase());
                self.apply(action, timestamp_ms);
            }
            SessionEvent::PlaybackState {
                timestamp_ms,
                playing,
            } => {
                let action = self
                    .monitor
                    .on_playing_changed(playing, self.session.phase());
                self.apply(action, timestamp_ms);
            }
            SessionEvent::PlaybackDetected {
                timestamp_ms,
                title,
                artist,
            } => self
                .session
                .on_playback_detected(&title, &artist, timestamp_ms),
            SessionEvent::SongChanged {
                timestamp_ms,
                title,
                artist,
            } => self.session.on_song_changed(&title, &artist, timestamp_ms),
            SessionEvent::PlaybackStopped { timestamp_ms } => {
                self.session.on_playback_stopped(timestamp_ms)
            }
            SessionEvent::Acceleration { x, y, z, .. } => {
                let moving = self.movement.push(x, y, z);
                self.movement_observed(moving);
            }
            SessionEvent::Movement { moving, .. } => self.movement_observed(moving),
            SessionEvent::DeviceDisconnected { .. } => {
                info!("device disconnected, clearing RR window");
                self.hrv.reset();
                self.movement.reset();
                self.last_metrics = None;
            }
            SessionEvent::EndSession { timestamp_ms } => return self.end(timestamp_ms),
            SessionEvent::Reset { .. } => {
                self.session.reset();
                self.monitor = PlaybackMonitor::default();
                self.movement.reset();
                self.session_id = None;
                self.started_at_ms = None;
                self.ended_at_ms = None;
            }
            SessionEvent::Shutdown { .. } => {}
        }
        None
    }

    fn start(&mut self, timestamp_ms: i64, now_playing: Option<DetectedTrack>, playing: bool) {
        if self.session.phase().is_active() {
            return;
        }
        self.session.start_session();
        let session_id = Uuid::new_v4();
        info!(%session_id, baseline = ?now_playing.as_ref().map(|t| &t.title), "session id allocated");
        self.session_id = Some(session_id);
        self.started_at_ms = Some(timestamp_ms);
        self.ended_at_ms = None;
        self.monitor = PlaybackMonitor::armed(now_playing, playing);
        self.movement.reset();
    }

    fn end(&mut self, timestamp_ms: i64) -> Option<SessionReport> {
        if !self.session.phase().is_active() {
            return None;
        }
        self.session.end_session(timestamp_ms);
        self.ended_at_ms = Some(timestamp_ms);
        self.movement.reset();
        self.report()
    }

    fn apply(&mut self, action: Option<PlaybackAction>, timestamp_ms: i64) {
        match action {
            Some(PlaybackAction::Detected(track)) => {
                self.session
                    .on_playback_detected(&track.title, &track.artist, timestamp_ms)
            }
            Some(PlaybackAction::Changed(track)) => {
                self.session
                    .on_song_changed(&track.title, &track.artist, timestamp_ms)
            }
            Some(PlaybackAction::Stopped) => self.session.on_playback_stopped(timestamp_ms),
            None => {}
        }
    }

    fn movement_observed(&mut self, moving: bool) {
        if moving && self.session.phase() == SessionPhase::ActiveRecording {
            self.session.report_movement();
        }
    }
}

fn to_utc(timestamp_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default()
}

/// Drain `events` into `pipeline`, delivering each ended session to `sink`.
/// Stops at the first `shutdown` event.
pub fn run_event_loop<I, S>(pipeline: &mut SessionPipeline, events: I, sink: &mut S)
where
    I: IntoIterator<Item = SessionEvent>,
    S: ResultSink + ?Sized,
{
    for event in events {
        if matches!(event, SessionEvent::Shutdown { .. }) {
            debug!("shutdown requested");
            break;
        }
        if let Some(report) = pipeline.handle(event) {
            let delivered = report.deliver_to(sink);
            info!(session_id = %report.session_id, delivered, "session results delivered");
        }
    }
}

/// Handle to a pipeline running on its own thread
pub struct SessionHandle<S> {
    sender: Sender<SessionEvent>,
    worker: JoinHandle<(SessionPipeline, S)>,
}

impl<S> SessionHandle<S> {
    /// A new producer endpoint
    pub fn sender(&self) -> Sender<SessionEvent> {
        self.sender.clone()
    }

    pub fn send(&self, event: SessionEvent) -> Result<(), CoreError> {
        self.sender
            .send(event)
            .map_err(|e| CoreError::LoopStopped(format!("{} event not delivered", e.0.kind())))
    }

    /// Wait for the loop to finish. The loop ends once every sender is dropped
    /// or a shutdown event arrives.
    pub fn join(self) -> Result<(SessionPipeline, S), CoreError> {
        drop(self.sender);
        self.worker
            .join()
            .map_err(|_| CoreError::LoopStopped("session thread panicked".to_string()))
    }
}

/// Run `pipeline` on a dedicated thread fed by an mpsc channel
pub fn spawn_session_loop<S>(
    mut pipeline: SessionPipeline,
    mut sink: S,
) -> Result<SessionHandle<S>, CoreError>
where
    S: ResultSink + Send + 'static,
{
    let (sender, receiver): (Sender<SessionEvent>, Receiver<SessionEvent>) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("hrvxo-session".to_string())
        .spawn(move || {
            run_event_loop(&mut pipeline, receiver, &mut sink);
            (pipeline, sink)
        })?;
    Ok(SessionHandle { sender, worker })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::f64::consts::PI;

    /// Breathing-paced RR intervals, one beat per element
    fn breathing_rr(count: usize) -> Vec<i32> {
        let mut t = 0.0;
        (0..count)
            .map(|_| {
                let rr = 1000.0 + 60.0 * (2.0 * PI * 0.1 * t).sin();
                t += rr / 1000.0;
                rr.round() as i32
            })
            .collect()
    }

    fn start(ts: i64) -> SessionEvent {
        SessionEvent::StartSession {
            timestamp_ms: ts,
            now_playing: None,
            is_playing: false,
        }
    }

    fn select(ts: i64, title: &str) -> SessionEvent {
        SessionEvent::SelectSong {
            timestamp_ms: ts,
            track: Track::new(format!("id-{title}"), title, "Artist"),
        }
    }

    fn detected(ts: i64, title: &str) -> SessionEvent {
        SessionEvent::PlaybackDetected {
            timestamp_ms: ts,
            title: title.to_string(),
            artist: "Artist".to_string(),
        }
    }

    /// One RR batch per second from `from_ms` to `to_ms` inclusive
    fn rr_stream(from_ms: i64, to_ms: i64) -> Vec<SessionEvent> {
        let beats = breathing_rr(((to_ms - from_ms) / 1000 + 1) as usize);
        beats
            .into_iter()
            .enumerate()
            .map(|(i, rr)| SessionEvent::RrBatch {
                timestamp_ms: from_ms + i as i64 * 1000,
                intervals: vec![rr],
            })
            .collect()
    }

    /// Pipeline whose RR window is already warm at `t = 0`
    fn warm_pipeline() -> SessionPipeline {
        let mut pipeline = SessionPipeline::default();
        pipeline.handle(SessionEvent::RrBatch {
            timestamp_ms: 0,
            intervals: breathing_rr(40),
        });
        assert!(pipeline.last_metrics().is_some());
        pipeline
    }

    #[test]
    fn test_pipeline_from_config_json() {
        let pipeline =
            SessionPipeline::from_config_json(r#"{"session": {"min_recording_sec": 30}}"#).unwrap();
        assert_eq!(pipeline.config().session.min_recording_sec, 30);
        assert_eq!(pipeline.session().config().min_recording_sec, 30);

        assert!(matches!(
            SessionPipeline::from_config_json(r#"{"hrv": {"min_intervals": 1}}"#),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_event_wire_format() {
        let event = SessionEvent::from_json(
            r#"{"type":"select_song","timestamp_ms":5,"track":{"id":"42","title":"Weightless","artist":"Marconi Union"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            SessionEvent::SelectSong {
                timestamp_ms: 5,
                track: Track::new("42", "Weightless", "Marconi Union"),
            }
        );

        let event = SessionEvent::from_json(r#"{"type":"shutdown"}"#).unwrap();
        assert_eq!(event, SessionEvent::Shutdown { timestamp_ms: 0 });

        let json = serde_json::to_value(SessionEvent::PlaybackStopped { timestamp_ms: 9 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "playback_stopped", "timestamp_ms": 9}));

        assert!(matches!(
            SessionEvent::from_json(r#"{"type":"dance","timestamp_ms":1}"#),
            Err(CoreError::InvalidEvent(_))
        ));
        assert!(matches!(
            SessionEvent::from_json(r#"{"type":"rr_batch","timestamp_ms":1}"#),
            Err(CoreError::InvalidEvent(_))
        ));
        assert!(matches!(
            SessionEvent::from_json(r#"{"type":"rr_batch","#),
            Err(CoreError::Json(_))
        ));
    }

    #[test]
    fn test_monitor_ignores_baseline_track() {
        let baseline = DetectedTrack::new("Already Playing", "Someone");
        let mut monitor = PlaybackMonitor::armed(Some(baseline.clone()), false);
        monitor.note_selection();

        let action = monitor.on_playing_changed(true, SessionPhase::ActiveWaitingPlayback);
        assert_eq!(action, None);
        assert!(monitor.is_playing());
    }

    #[test]
    fn test_monitor_ignores_baseline_metadata_after_selection() {
        let baseline = DetectedTrack::new("Already Playing", "Someone");
        let mut monitor = PlaybackMonitor::armed(Some(baseline.clone()), true);
        monitor.note_selection();

        assert_eq!(
            monitor.on_track_changed(baseline, SessionPhase::ActiveWaitingPlayback),
            None
        );

        let chosen = DetectedTrack::new("Chosen", "Artist");
        assert_eq!(
            monitor.on_track_changed(chosen.clone(), SessionPhase::ActiveWaitingPlayback),
            Some(PlaybackAction::Detected(chosen))
        );
    }

    #[test]
    fn test_monitor_ignores_baseline_resume_after_selection() {
        let baseline = DetectedTrack::new("Already Playing", "Someone");
        let mut monitor = PlaybackMonitor::armed(Some(baseline.clone()), true);
        assert_eq!(
            monitor.on_playing_changed(false, SessionPhase::ActiveNoSong),
            None
        );
        monitor.note_selection();

        assert_eq!(
            monitor.on_track_changed(baseline, SessionPhase::ActiveWaitingPlayback),
            None
        );
        assert_eq!(
            monitor.on_playing_changed(true, SessionPhase::ActiveWaitingPlayback),
            None
        );
    }

    #[test]
    fn test_monitor_waits_for_user_selection() {
        let mut monitor = PlaybackMonitor::armed(None, true);
        let action = monitor.on_track_changed(
            DetectedTrack::new("Song", "A"),
            SessionPhase::ActiveNoSong,
        );
        assert_eq!(action, None);

        monitor.note_selection();
        let action = monitor.on_track_changed(
            DetectedTrack::new("Other", "B"),
            SessionPhase::ActiveWaitingPlayback,
        );
        assert_eq!(
            action,
            Some(PlaybackAction::Detected(DetectedTrack::new("Other", "B")))
        );
    }

    #[test]
    fn test_monitor_track_change_routing() {
        let mut monitor = PlaybackMonitor::armed(None, true);
        monitor.note_selection();
        let first = DetectedTrack::new("First", "A");
        let second = DetectedTrack::new("Second", "A");

        assert_eq!(
            monitor.on_track_changed(first.clone(), SessionPhase::ActiveWaitingPlayback),
            Some(PlaybackAction::Detected(first.clone()))
        );
        // Repeated metadata for the same track is not a change
        assert_eq!(
            monitor.on_track_changed(first, SessionPhase::ActiveSettling),
            None
        );
        assert_eq!(
            monitor.on_track_changed(second.clone(), SessionPhase::ActiveRecording),
            Some(PlaybackAction::Changed(second))
        );
    }

    #[test]
    fn test_monitor_play_state_edges() {
        let mut monitor = PlaybackMonitor::armed(None, false);
        monitor.note_selection();
        let track = DetectedTrack::new("Paused Song", "A");
        assert_eq!(
            monitor.on_track_changed(track.clone(), SessionPhase::ActiveWaitingPlayback),
            None
        );
        assert_eq!(
            monitor.on_playing_changed(true, SessionPhase::ActiveWaitingPlayback),
            Some(PlaybackAction::Detected(track))
        );
        assert_eq!(
            monitor.on_playing_changed(true, SessionPhase::ActiveSettling),
            None
        );
        assert_eq!(
            monitor.on_playing_changed(false, SessionPhase::ActiveRecording),
            Some(PlaybackAction::Stopped)
        );
        // Resuming mid-song does not start a new measurement
        assert_eq!(
            monitor.on_playing_changed(true, SessionPhase::ActiveRecording),
            None
        );
    }

    #[test]
    fn test_full_session_through_pipeline() {
        let mut pipeline = warm_pipeline();
        pipeline.handle(start(0));
        pipeline.handle(select(0, "Weightless"));
        pipeline.handle(detected(1_000, "ignored title"));
        assert_eq!(pipeline.phase(), SessionPhase::ActiveSettling);

        for event in rr_stream(2_000, 95_000) {
            pipeline.handle(event);
        }
        assert_eq!(pipeline.phase(), SessionPhase::ActiveRecording);

        let report = pipeline
            .handle(SessionEvent::EndSession {
                timestamp_ms: 96_000,
            })
            .unwrap();
        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.track.title, "Weightless");
        assert_eq!(result.duration_listened_sec, 80);
        assert!(result.is_valid);
        assert!(result.avg_coherence > 0.5);
        assert!(result.mean_hr > 55.0 && result.mean_hr < 65.0);
        assert_eq!(report.ended_at, Some(to_utc(96_000)));
        assert_eq!(Some(report.session_id), pipeline.session_id());
    }

    #[test]
    fn test_metrics_ignored_outside_measurement() {
        let mut pipeline = warm_pipeline();
        pipeline.handle(start(0));
        for event in rr_stream(1_000, 20_000) {
            pipeline.handle(event);
        }
        assert!(pipeline.last_metrics().is_some());
        assert_eq!(pipeline.phase(), SessionPhase::ActiveNoSong);
        assert_eq!(pipeline.snapshot().current_readings, 0);
    }

    #[test]
    fn test_movement_only_counts_while_recording() {
        let mut pipeline = warm_pipeline();
        pipeline.handle(start(0));
        pipeline.handle(select(0, "Song"));
        pipeline.handle(detected(1_000, "Song"));
        pipeline.handle(SessionEvent::Movement {
            timestamp_ms: 2_000,
            moving: true,
        });
        assert!(!pipeline.session().current_song().unwrap().movement_detected);

        for event in rr_stream(2_000, 20_000) {
            pipeline.handle(event);
        }
        assert_eq!(pipeline.phase(), SessionPhase::ActiveRecording);
        for i in 0..5 {
            pipeline.handle(SessionEvent::Acceleration {
                timestamp_ms: 20_000 + i,
                x: 1.5,
                y: 0.5,
                z: 0.2,
            });
        }
        assert!(pipeline.session().current_song().unwrap().movement_detected);
    }

    #[test]
    fn test_device_disconnect_clears_window() {
        let mut pipeline = warm_pipeline();
        pipeline.handle(SessionEvent::DeviceDisconnected { timestamp_ms: 1_000 });
        assert!(pipeline.hrv().is_empty());
        assert!(pipeline.last_metrics().is_none());
    }

    #[test]
    fn test_raw_notifications_drive_session() {
        let mut pipeline = warm_pipeline();
        pipeline.handle(SessionEvent::StartSession {
            timestamp_ms: 0,
            now_playing: Some(DetectedTrack::new("Baseline", "X")),
            is_playing: true,
        });
        pipeline.handle(SessionEvent::PlaybackState {
            timestamp_ms: 500,
            playing: false,
        });
        pipeline.handle(select(1_000, "Chosen"));
        pipeline.handle(SessionEvent::TrackChanged {
            timestamp_ms: 2_000,
            title: "Chosen".to_string(),
            artist: "Artist".to_string(),
        });
        assert_eq!(pipeline.phase(), SessionPhase::ActiveWaitingPlayback);
        pipeline.handle(SessionEvent::PlaybackState {
            timestamp_ms: 2_100,
            playing: true,
        });
        assert_eq!(pipeline.phase(), SessionPhase::ActiveSettling);
        assert_eq!(
            pipeline.snapshot().current_track.unwrap().id.as_deref(),
            Some("id-Chosen")
        );

        pipeline.handle(SessionEvent::PlaybackState {
            timestamp_ms: 80_000,
            playing: false,
        });
        assert_eq!(pipeline.phase(), SessionPhase::ActiveNoSong);
        assert_eq!(pipeline.session().results().len(), 1);
    }

    #[test]
    fn test_baseline_metadata_keeps_selection_pending() {
        let mut pipeline = SessionPipeline::default();
        pipeline.handle(SessionEvent::StartSession {
            timestamp_ms: 0,
            now_playing: Some(DetectedTrack::new("Baseline", "X")),
            is_playing: true,
        });
        pipeline.handle(select(1_000, "Chosen"));
        pipeline.handle(SessionEvent::TrackChanged {
            timestamp_ms: 2_000,
            title: "Baseline".to_string(),
            artist: "X".to_string(),
        });

        assert_eq!(pipeline.phase(), SessionPhase::ActiveWaitingPlayback);
        assert!(pipeline.session().current_song().is_none());
        assert_eq!(
            pipeline.session().pending_song().map(|t| t.title.as_str()),
            Some("Chosen")
        );

        pipeline.handle(SessionEvent::TrackChanged {
            timestamp_ms: 3_000,
            title: "Chosen".to_string(),
            artist: "Artist".to_string(),
        });
        assert_eq!(pipeline.phase(), SessionPhase::ActiveSettling);
        assert_eq!(
            pipeline.snapshot().current_track.unwrap().id.as_deref(),
            Some("id-Chosen")
        );
    }

    #[test]
    fn test_report_ranking_and_delivery() {
        let song = |title: &str, coherence: f64, valid: bool| SongSessionResult {
            track: Track::detected(title, ""),
            avg_coherence: coherence,
            avg_rmssd: 40.0,
            mean_hr: 65.0,
            duration_listened_sec: if valid { 90 } else { 20 },
            is_valid: valid,
            movement_detected: false,
        };
        let report = SessionReport {
            session_id: Uuid::new_v4(),
            started_at: to_utc(0),
            ended_at: Some(to_utc(1_000)),
            results: vec![
                song("a", 0.4, true),
                song("b", 0.9, false),
                song("c", 0.7, true),
                song("d", 0.4, true),
            ],
        };

        let titles: Vec<_> = report.ranked().iter().map(|r| r.track.title.as_str()).collect();
        assert_eq!(titles, vec!["c", "a", "d"]);

        let mut sink = InMemorySink::default();
        assert_eq!(report.deliver_to(&mut sink), 3);
        assert!(sink.stored.iter().all(|(id, _)| *id == report.session_id));
    }

    struct FailingSink;

    impl ResultSink for FailingSink {
        fn persist(&mut self, _: &Uuid, _: &SongSessionResult) -> Result<(), CoreError> {
            Err(CoreError::Sink("disk full".to_string()))
        }
    }

    #[test]
    fn test_sink_failure_does_not_stop_loop() {
        let mut pipeline = warm_pipeline();
        let mut events = vec![start(0), select(0, "Song"), detected(1_000, "Song")];
        events.extend(rr_stream(2_000, 90_000));
        events.push(SessionEvent::EndSession { timestamp_ms: 90_000 });
        events.push(start(100_000));

        run_event_loop(&mut pipeline, events, &mut FailingSink);
        assert_eq!(pipeline.phase(), SessionPhase::ActiveNoSong);
    }

    #[test]
    fn test_threaded_loop_with_multiple_producers() {
        let handle = spawn_session_loop(warm_pipeline(), InMemorySink::default()).unwrap();

        let user = handle.sender();
        thread::spawn(move || {
            user.send(start(0)).unwrap();
            user.send(select(0, "Weightless")).unwrap();
        })
        .join()
        .unwrap();

        let playback = handle.sender();
        thread::spawn(move || playback.send(detected(1_000, "Weightless")).unwrap())
            .join()
            .unwrap();

        let device = handle.sender();
        thread::spawn(move || {
            for event in rr_stream(2_000, 92_000) {
                device.send(event).unwrap();
            }
        })
        .join()
        .unwrap();

        handle
            .send(SessionEvent::EndSession {
                timestamp_ms: 92_000,
            })
            .unwrap();
        let (pipeline, sink) = handle.join().unwrap();

        assert_eq!(pipeline.phase(), SessionPhase::Ended);
        assert_eq!(sink.stored.len(), 1);
        assert_eq!(sink.stored[0].1.track.title, "Weightless");
        assert_eq!(sink.stored[0].1.duration_listened_sec, 76);
    }

    #[test]
    fn test_shutdown_stops_loop() {
        let handle = spawn_session_loop(SessionPipeline::default(), InMemorySink::default()).unwrap();
        let producer = handle.sender();
        producer.send(start(0)).unwrap();
        producer.send(SessionEvent::Shutdown { timestamp_ms: 1 }).unwrap();
        producer.send(SessionEvent::EndSession { timestamp_ms: 2 }).ok();

        let (pipeline, sink) = handle.join().unwrap();
        assert_eq!(pipeline.phase(), SessionPhase::ActiveNoSong);
        assert!(sink.stored.is_empty());
    }
}
