//! HrvXo CLI - Command-line interface for the HrvXo session engine
//!
//! Commands:
//! - replay: Apply a recorded event log and print the session report
//! - run: Process streaming events from stdin, one snapshot per event
//! - analyze: Compute HRV metrics for a file of RR intervals
//! - doctor: Diagnose configuration and environment
//! - schema: Print the event and result formats

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use hrvxo_core::hrv::{spectral, time_domain, SpectralSummary};
use hrvxo_core::pipeline::{run_event_loop, InMemorySink, SessionEvent, SessionPipeline};
use hrvxo_core::{CoreConfig, CoreError, SongSessionResult, HRVXO_VERSION, PRODUCER_NAME};

/// HrvXo - per-song HRV coherence measurement
#[derive(Parser)]
#[command(name = "hrvxo")]
#[command(version = HRVXO_VERSION)]
#[command(about = "Measure heart rate variability coherence per song", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults apply to missing fields)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply an event log and print the session report
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        output_format: OutputFormat,

        /// Print only valid results, best coherence first
        #[arg(long)]
        ranked: bool,
    },

    /// Process streaming events from stdin, printing a snapshot per event
    Run {
        /// Flush output after each record
        #[arg(long, default_value = "true")]
        flush: bool,
    },

    /// Compute HRV metrics for a file of RR intervals
    Analyze {
        /// Input file path (use - for stdin); one interval per line or a JSON array
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Diagnose configuration and environment
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print format information
    Schema {
        /// Schema to print
        #[arg(value_enum)]
        schema_type: SchemaType,

        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one event per line)
    Ndjson,
    /// JSON array of events
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Single-line JSON
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Clone, ValueEnum)]
enum SchemaType {
    /// Input events
    Events,
    /// Per-song results
    Results,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable
fn init_logging() {
    let filter = if std::env::var("HRVXO_DEBUG_LOG").is_ok_and(|v| v == "1") {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), HrvxoCliError> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Replay {
            input,
            input_format,
            output_format,
            ranked,
        } => cmd_replay(
            load_config(config_path)?,
            &input,
            input_format,
            output_format,
            ranked,
        ),

        Commands::Run { flush } => cmd_run(load_config(config_path)?, flush),

        Commands::Analyze { input } => cmd_analyze(&load_config(config_path)?, &input),

        Commands::Doctor { json } => cmd_doctor(config_path, json),

        Commands::Schema {
            schema_type,
            json_schema,
        } => cmd_schema(schema_type, json_schema),
    }
}

fn load_config(path: Option<&Path>) -> Result<CoreConfig, HrvxoCliError> {
    match path {
        Some(path) => {
            let json = fs::read_to_string(path)?;
            let config = CoreConfig::from_json(&json)?;
            debug!(path = %path.display(), "loaded configuration");
            Ok(config)
        }
        None => Ok(CoreConfig::default()),
    }
}

fn read_input(input: &Path) -> Result<String, HrvxoCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn parse_events(data: &str, format: InputFormat) -> Result<Vec<SessionEvent>, HrvxoCliError> {
    match format {
        InputFormat::Json => Ok(serde_json::from_str(data)?),
        InputFormat::Ndjson => data
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                SessionEvent::from_json(line.trim()).map_err(|e| HrvxoCliError::EventLine {
                    line: index + 1,
                    message: e.to_string(),
                })
            })
            .collect(),
    }
}

fn cmd_replay(
    config: CoreConfig,
    input: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
    ranked: bool,
) -> Result<(), HrvxoCliError> {
    let events = parse_events(&read_input(input)?, input_format)?;
    if events.is_empty() {
        return Err(HrvxoCliError::NoEvents);
    }
    info!(events = events.len(), "replaying event log");

    let mut pipeline = SessionPipeline::new(config);
    let mut sink = InMemorySink::default();
    run_event_loop(&mut pipeline, events, &mut sink);

    let report = pipeline.report().ok_or(HrvxoCliError::NoSession)?;
    let output = if ranked {
        let ranked: Vec<&SongSessionResult> = report.ranked();
        format_output(&ranked, &output_format)?
    } else {
        format_output(&report, &output_format)?
    };
    println!("{}", output);
    Ok(())
}

fn cmd_run(config: CoreConfig, flush: bool) -> Result<(), HrvxoCliError> {
    let mut pipeline = SessionPipeline::new(config);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for (index, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        }

        let event = SessionEvent::from_json(trimmed).map_err(|e| HrvxoCliError::EventLine {
            line: index + 1,
            message: e.to_string(),
        })?;
        if matches!(event, SessionEvent::Shutdown { .. }) {
            break;
        }

        if let Some(report) = pipeline.handle(event) {
            writeln!(stdout, "{}", serde_json::to_string(&report)?)?;
        }
        writeln!(stdout, "{}", serde_json::to_string(&pipeline.snapshot())?)?;
        if flush {
            stdout.flush()?;
        }
    }

    stdout.flush()?;
    Ok(())
}

/// Metrics for a whole RR file
#[derive(serde::Serialize)]
struct AnalyzeReport {
    accepted: usize,
    rejected: usize,
    mean_hr: Option<f64>,
    rmssd: Option<f64>,
    sdnn: Option<f64>,
    spectral: Option<SpectralSummary>,
}

fn parse_rr(data: &str) -> Result<Vec<i32>, HrvxoCliError> {
    let trimmed = data.trim();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            line.trim()
                .parse::<i32>()
                .map_err(|e| HrvxoCliError::ParseError(format!("line {}: {}", index + 1, e)))
        })
        .collect()
}

fn cmd_analyze(config: &CoreConfig, input: &Path) -> Result<(), HrvxoCliError> {
    let intervals = parse_rr(&read_input(input)?)?;
    if intervals.is_empty() {
        return Err(HrvxoCliError::NoEvents);
    }

    let hrv = &config.hrv;
    let rr: Vec<f64> = intervals
        .iter()
        .copied()
        .filter(|&v| v >= hrv.min_rr_ms && v <= hrv.max_rr_ms)
        .map(f64::from)
        .collect();

    let report = AnalyzeReport {
        accepted: rr.len(),
        rejected: intervals.len() - rr.len(),
        mean_hr: time_domain::mean_hr(&rr),
        rmssd: time_domain::rmssd(&rr),
        sdnn: time_domain::sdnn(&rr),
        spectral: spectral::analyze(&rr, hrv),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_doctor(config_path: Option<&Path>, json: bool) -> Result<(), HrvxoCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "hrvxo_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("HrvXo version {}", HRVXO_VERSION),
    });

    let config = match load_config(config_path) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: match config_path {
                    Some(path) => format!("Config file valid ({})", path.display()),
                    None => "Using default configuration".to_string(),
                },
            });
            Some(config)
        }
        Err(e) => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: CliError::from(e).message,
            });
            None
        }
    };

    if let Some(config) = &config {
        checks.push(DoctorCheck {
            name: "session_timing".to_string(),
            status: CheckStatus::Ok,
            message: format!(
                "Settle {}s, minimum recording {}s",
                config.session.settle_duration_ms / 1000,
                config.session.min_recording_sec
            ),
        });

        // The slowest coherence-band rhythm needs two full cycles in the window
        let window_sec = config.hrv.window_span_ms as f64 / 1000.0;
        let low_hz = config.hrv.coherence_band.low_hz;
        let status = if window_sec * low_hz < 2.0 {
            CheckStatus::Warning
        } else {
            CheckStatus::Ok
        };
        checks.push(DoctorCheck {
            name: "hrv_window".to_string(),
            status,
            message: format!(
                "{}s window, {} intervals minimum, coherence band {}-{} Hz",
                window_sec,
                config.hrv.min_intervals,
                low_hz,
                config.hrv.coherence_band.high_hz
            ),
        });
    }

    // Check stdin is available (for streaming mode)
    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (streaming mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: HRVXO_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("HrvXo Doctor Report");
        println!("===================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(HrvxoCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_schema(schema_type: SchemaType, json_schema: bool) -> Result<(), HrvxoCliError> {
    match schema_type {
        SchemaType::Events => {
            if json_schema {
                println!("{}", get_event_json_schema());
            } else {
                println!("Input Events");
                println!();
                println!("One JSON object per line, tagged by \"type\", each with timestamp_ms:");
                println!();
                println!("  start_session       {{ now_playing?: {{ title, artist }}, is_playing? }}");
                println!("  select_song         {{ track: {{ id?, title, artist }} }}");
                println!("  rr_batch            {{ intervals: [ms, ...] }}");
                println!("  track_changed       {{ title, artist }}     raw player metadata");
                println!("  playback_state      {{ playing }}           raw player state");
                println!("  playback_detected   {{ title, artist }}");
                println!("  song_changed        {{ title, artist }}");
                println!("  playback_stopped");
                println!("  acceleration        {{ x, y, z }}           m/s², gravity removed");
                println!("  movement            {{ moving }}");
                println!("  device_disconnected");
                println!("  end_session");
                println!("  reset");
                println!("  shutdown");
            }
        }
        SchemaType::Results => {
            if json_schema {
                println!("{}", get_result_json_schema());
            } else {
                println!("Song Results");
                println!();
                println!("- track: {{ id?, title, artist }}");
                println!("- avg_coherence: mean coherence over recorded readings (0-1)");
                println!("- avg_rmssd: mean RMSSD (ms)");
                println!("- mean_hr: mean heart rate (bpm)");
                println!("- duration_listened_sec: seconds after the settle window");
                println!("- is_valid: duration reached the minimum recording");
                println!("- movement_detected: wearer moved while recording");
            }
        }
    }

    Ok(())
}

// Helper functions

fn format_output<T: serde::Serialize + ?Sized>(
    value: &T,
    format: &OutputFormat,
) -> Result<String, HrvxoCliError> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string(value)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(value)?),
    }
}

fn event_schema(name: &str, required: &[&str], properties: serde_json::Value) -> serde_json::Value {
    let mut props = serde_json::json!({
        "type": { "const": name },
        "timestamp_ms": { "type": "integer" }
    });
    if let (Some(base), Some(extra)) = (props.as_object_mut(), properties.as_object()) {
        base.extend(extra.clone());
    }
    let mut req = vec!["type", "timestamp_ms"];
    req.extend_from_slice(required);
    serde_json::json!({ "type": "object", "required": req, "properties": props })
}

fn get_event_json_schema() -> String {
    let track = serde_json::json!({
        "type": "object",
        "required": ["title"],
        "properties": {
            "title": { "type": "string" },
            "artist": { "type": "string" }
        }
    });
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "hrvxo.session_event",
        "description": "HrvXo session event",
        "oneOf": [
            event_schema("start_session", &[], serde_json::json!({
                "now_playing": track.clone(),
                "is_playing": { "type": "boolean" }
            })),
            event_schema("select_song", &["track"], serde_json::json!({
                "track": {
                    "type": "object",
                    "required": ["title"],
                    "properties": {
                        "id": { "type": "string" },
                        "title": { "type": "string" },
                        "artist": { "type": "string" }
                    }
                }
            })),
            event_schema("rr_batch", &["intervals"], serde_json::json!({
                "intervals": { "type": "array", "items": { "type": "integer" } }
            })),
            event_schema("track_changed", &["title"], track["properties"].clone()),
            event_schema("playback_state", &["playing"], serde_json::json!({
                "playing": { "type": "boolean" }
            })),
            event_schema("playback_detected", &["title"], track["properties"].clone()),
            event_schema("song_changed", &["title"], track["properties"].clone()),
            event_schema("playback_stopped", &[], serde_json::json!({})),
            event_schema("acceleration", &["x", "y", "z"], serde_json::json!({
                "x": { "type": "number" },
                "y": { "type": "number" },
                "z": { "type": "number" }
            })),
            event_schema("movement", &["moving"], serde_json::json!({
                "moving": { "type": "boolean" }
            })),
            event_schema("device_disconnected", &[], serde_json::json!({})),
            event_schema("end_session", &[], serde_json::json!({})),
            event_schema("reset", &[], serde_json::json!({})),
            event_schema("shutdown", &[], serde_json::json!({}))
        ]
    })
    .to_string()
}

fn get_result_json_schema() -> String {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "hrvxo.song_result",
        "description": "HrvXo per-song measurement",
        "type": "object",
        "required": [
            "track", "avg_coherence", "avg_rmssd", "mean_hr",
            "duration_listened_sec", "is_valid", "movement_detected"
        ],
        "properties": {
            "track": {
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "title": { "type": "string" },
                    "artist": { "type": "string" }
                }
            },
            "avg_coherence": { "type": "number" },
            "avg_rmssd": { "type": "number" },
            "mean_hr": { "type": "number" },
            "duration_listened_sec": { "type": "integer", "minimum": 0 },
            "is_valid": { "type": "boolean" },
            "movement_detected": { "type": "boolean" }
        }
    })
    .to_string()
}

// Error types

#[derive(Debug)]
enum HrvxoCliError {
    Io(io::Error),
    Core(CoreError),
    Json(serde_json::Error),
    EventLine { line: usize, message: String },
    NoEvents,
    NoSession,
    DoctorFailed,
    ParseError(String),
}

impl From<io::Error> for HrvxoCliError {
    fn from(e: io::Error) -> Self {
        HrvxoCliError::Io(e)
    }
}

impl From<CoreError> for HrvxoCliError {
    fn from(e: CoreError) -> Self {
        HrvxoCliError::Core(e)
    }
}

impl From<serde_json::Error> for HrvxoCliError {
    fn from(e: serde_json::Error) -> Self {
        HrvxoCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<HrvxoCliError> for CliError {
    fn from(e: HrvxoCliError) -> Self {
        match e {
            HrvxoCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            HrvxoCliError::Core(CoreError::InvalidConfig(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'hrvxo doctor --config <file>' to inspect".to_string()),
            },
            HrvxoCliError::Core(e) => CliError {
                code: "CORE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            HrvxoCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            HrvxoCliError::EventLine { line, message } => CliError {
                code: "EVENT_ERROR".to_string(),
                message: format!("line {}: {}", line, message),
                hint: Some("Run 'hrvxo schema events' for the event format".to_string()),
            },
            HrvxoCliError::NoEvents => CliError {
                code: "NO_EVENTS".to_string(),
                message: "No records found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            HrvxoCliError::NoSession => CliError {
                code: "NO_SESSION".to_string(),
                message: "Event log never started a session".to_string(),
                hint: Some("Add a start_session event".to_string()),
            },
            HrvxoCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            HrvxoCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Check input format".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
