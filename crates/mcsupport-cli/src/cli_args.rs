use std::path::PathBuf;

use clap::Parser;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "mcsupport",
    about = "Correlates launcher-support chat rooms with uploaded diagnostic reports",
    version
)]
pub struct Cli {
    #[arg(
        long = "state-dir",
        env = "MCSUPPORT_STATE_DIR",
        default_value = ".mcsupport",
        help = "Directory holding transcript records, artifacts, images, and the fingerprint index"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long,
        env = "MCSUPPORT_CONFIG",
        help = "Transcript config JSON path (defaults to <state-dir>/transcript-config.json)"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "ingress-file",
        env = "MCSUPPORT_INGRESS_FILE",
        conflicts_with = "inspect",
        help = "NDJSON file of upload/message events to replay through the correlator"
    )]
    pub ingress_file: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = false,
        help = "Print a summary of the transcript store and exit"
    )]
    pub inspect: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Render replay and inspect output as JSON"
    )]
    pub json: bool,

    #[arg(
        long = "conversation-window-secs",
        env = "MCSUPPORT_CONVERSATION_WINDOW_SECS",
        value_parser = parse_positive_u64,
        help = "Override the idle window after which an open report's session is evicted"
    )]
    pub conversation_window_secs: Option<u64>,

    #[arg(
        long = "recency-window-secs",
        env = "MCSUPPORT_RECENCY_WINDOW_SECS",
        value_parser = parse_positive_u64,
        help = "Override the window used for untargeted helper messages and pending reconciliation"
    )]
    pub recency_window_secs: Option<u64>,

    #[arg(
        long = "privileged-reply-window-secs",
        env = "MCSUPPORT_PRIVILEGED_REPLY_WINDOW_SECS",
        value_parser = parse_positive_u64,
        help = "Retire a session when its owner does not answer a helper within this many seconds"
    )]
    pub privileged_reply_window_secs: Option<u64>,

    #[arg(
        long = "privileged-participant",
        env = "MCSUPPORT_PRIVILEGED_PARTICIPANTS",
        value_delimiter = ',',
        help = "Additional helper participant ids (comma separated)"
    )]
    pub privileged_participants: Vec<String>,

    #[arg(
        long = "fetch-timeout-ms",
        env = "MCSUPPORT_FETCH_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Timeout for attachment downloads"
    )]
    pub fetch_timeout_ms: u64,
}
