use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mcsupport_core::ManualClock;
use mcsupport_transcript::{
    build_correlation_engine, inspect_transcript_store, load_transcript_config_file,
    load_transcript_ingress_events, run_transcript_replay, transcript_config_path_for_state_dir,
    validate_transcript_config, HttpArtifactFetcher, TranscriptConfig, TranscriptReplaySummary,
    TranscriptStoreInspectReport,
};

use crate::cli_args::Cli;

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    if cli.inspect {
        let report = inspect_transcript_store(&cli.state_dir)?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report)
                    .context("failed to render transcript store json")?
            );
        } else {
            println!("{}", render_inspect_report(&report));
        }
        return Ok(());
    }

    let Some(ingress_path) = cli.ingress_file.as_deref() else {
        bail!("nothing to do: pass --ingress-file to replay events or --inspect");
    };
    let config = resolve_transcript_config(&cli)?;
    let loaded = load_transcript_ingress_events(ingress_path)?;
    let fetcher = HttpArtifactFetcher::new(
        Duration::from_millis(cli.fetch_timeout_ms),
        config.max_file_bytes,
    )?;
    let clock = Arc::new(ManualClock::new(0));
    let engine = build_correlation_engine(&cli.state_dir, config, Arc::new(fetcher), clock.clone())?;
    let summary = run_transcript_replay(&engine, &clock, &loaded.events).await;

    if cli.json {
        let payload = serde_json::json!({
            "ingress_file": ingress_path.display().to_string(),
            "invalid_lines": loaded.invalid_lines,
            "summary": summary,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to render replay json")?
        );
    } else {
        println!("{}", render_replay_summary(&summary, loaded.invalid_lines));
    }
    Ok(())
}

pub(crate) fn resolve_transcript_config(cli: &Cli) -> Result<TranscriptConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| transcript_config_path_for_state_dir(&cli.state_dir));
    let mut config = load_transcript_config_file(&path)?;
    if let Some(secs) = cli.conversation_window_secs {
        config.conversation_window_secs = secs;
    }
    if let Some(secs) = cli.recency_window_secs {
        config.recency_window_secs = secs;
    }
    if let Some(secs) = cli.privileged_reply_window_secs {
        config.privileged_reply_window_secs = Some(secs);
    }
    for participant in &cli.privileged_participants {
        let participant = participant.trim();
        if !participant.is_empty()
            && !config
                .privileged_participants
                .iter()
                .any(|existing| existing == participant)
        {
            config.privileged_participants.push(participant.to_string());
        }
    }
    validate_transcript_config(&config)
        .with_context(|| format!("invalid transcript config after overrides ({})", path.display()))?;
    Ok(config)
}

pub(crate) fn render_replay_summary(summary: &TranscriptReplaySummary, invalid_lines: usize) -> String {
    format!(
        "transcript replay: events={} invalid_lines={}\n\
         uploads: created={} reused={} rejected={} rolled_back={} persist_failed={}\n\
         messages: single={} broadcast={} deferred={} unattributed={}\n\
         sweeps: sessions_evicted={} pending_discarded={}\n\
         remaining: active_sessions={} pending_messages={}",
        summary.events,
        invalid_lines,
        summary.uploads_created,
        summary.uploads_reused,
        summary.uploads_rejected,
        summary.uploads_rolled_back,
        summary.uploads_persist_failed,
        summary.messages_single,
        summary.messages_broadcast,
        summary.messages_deferred,
        summary.messages_unattributed,
        summary.sessions_evicted,
        summary.pending_discarded,
        summary.active_sessions,
        summary.pending_messages,
    )
}

pub(crate) fn render_inspect_report(report: &TranscriptStoreInspectReport) -> String {
    let mut lines = vec![format!(
        "transcript store: root={} records={} invalid_records={} messages={} images={}",
        report.root.display(),
        report.records,
        report.invalid_records,
        report.messages,
        report.images
    )];
    if report.records_missing_artifact.is_empty() {
        lines.push("records missing artifact: none".to_string());
    } else {
        lines.push(format!(
            "records missing artifact: {}",
            report.records_missing_artifact.join(", ")
        ));
    }
    lines.join("\n")
}
