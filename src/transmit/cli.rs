//! Transmitter that shells out to the heartbeat CLI.
//!
//! The first heartbeat of a batch goes on the command line; the rest are
//! written to the child's stdin as a JSON array (`--extra-heartbeats`).
//! The CLI owns the network, authentication, and its own offline cache;
//! we only interpret its exit code.

use super::{lines_in_file, Receipt, TransmitError, Transmitter};
use crate::config::Settings;
use crate::core::heartbeat::{Heartbeat, QueuedHeartbeat, WireHeartbeat};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit codes of the heartbeat CLI.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    /// API unreachable or returned an error; heartbeat saved offline
    pub const API_ERROR: i32 = 102;
    /// Config file could not be parsed
    pub const CONFIG_PARSE_ERROR: i32 = 103;
    /// API key invalid
    pub const AUTH_ERROR: i32 = 104;
    /// CLI is backing off after earlier failures
    pub const BACKOFF: i32 = 112;
}

/// How long a single CLI invocation may take.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Delivers heartbeats by running the heartbeat CLI.
#[derive(Debug, Clone)]
pub struct CliTransmitter {
    cli_path: PathBuf,
    plugin: String,
    hostname: Option<String>,
    timeout: Duration,
}

impl CliTransmitter {
    pub fn new(cli_path: impl Into<PathBuf>, plugin: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().to_string())
            .filter(|h| !h.is_empty());

        Self {
            cli_path: cli_path.into(),
            plugin: plugin.into(),
            hostname,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cli_path(&self) -> &PathBuf {
        &self.cli_path
    }

    /// Command-line arguments describing `primary`.
    pub fn arguments(
        &self,
        primary: &Heartbeat,
        lines: Option<u64>,
        settings: &Settings,
        has_extra: bool,
    ) -> Vec<String> {
        let mut args = vec![
            "--entity".to_string(),
            primary.entity.clone(),
            "--time".to_string(),
            format!("{:.3}", primary.unix_time()),
            "--category".to_string(),
            primary.category.as_str().to_string(),
        ];

        if !self.plugin.is_empty() {
            args.push("--plugin".to_string());
            args.push(self.plugin.clone());
        }

        if primary.is_write {
            args.push("--write".to_string());
        }

        if let Some(ref project) = primary.project {
            args.push("--project".to_string());
            args.push(project.clone());
        }

        match primary.language {
            Some(ref language) => {
                args.push("--language".to_string());
                args.push(language.clone());
            }
            None => args.push("--guess-language".to_string()),
        }

        if let Some(lineno) = primary.lineno {
            args.push("--lineno".to_string());
            args.push(lineno.to_string());
        }

        if let Some(cursor_pos) = primary.cursor_pos {
            args.push("--cursorpos".to_string());
            args.push(cursor_pos.to_string());
        }

        if let Some(lines) = lines {
            args.push("--lines-in-file".to_string());
            args.push(lines.to_string());
        }

        if let Some(key) = settings.api_key() {
            args.push("--key".to_string());
            args.push(key.to_string());
        }

        if let Some(ref api_url) = settings.api_url {
            args.push("--api-url".to_string());
            args.push(api_url.clone());
        }

        if settings.metrics {
            args.push("--metrics".to_string());
        }

        if settings.debug {
            args.push("--verbose".to_string());
        }

        if let Some(ref hostname) = self.hostname {
            args.push("--hostname".to_string());
            args.push(hostname.clone());
        }

        if has_extra {
            args.push("--extra-heartbeats".to_string());
        }

        args
    }

    /// Map the CLI's exit status to a delivery result.
    pub fn classify_exit(code: Option<i32>, stderr: &str) -> Result<Receipt, TransmitError> {
        let detail = stderr.trim();
        match code {
            Some(exit_code::SUCCESS) => Ok(Receipt::all_accepted()),
            Some(exit_code::AUTH_ERROR) => Err(TransmitError::auth(format!(
                "heartbeat CLI rejected the API key {detail}"
            ))),
            Some(exit_code::API_ERROR) => Err(TransmitError::network(format!(
                "heartbeat CLI could not reach the API {detail}"
            ))),
            Some(exit_code::BACKOFF) => Err(TransmitError::network(format!(
                "heartbeat CLI is rate limited {detail}"
            ))),
            // the payload was never looked at, so the batch stays queued
            Some(exit_code::CONFIG_PARSE_ERROR) => Err(TransmitError::server(format!(
                "heartbeat CLI could not parse its config {detail}"
            ))),
            Some(code) => Err(TransmitError::server(format!(
                "heartbeat CLI exited with code {code} {detail}"
            ))),
            None => Err(TransmitError::network(format!(
                "heartbeat CLI was terminated by a signal {detail}"
            ))),
        }
    }

    async fn wire_batch(batch: &[QueuedHeartbeat]) -> Vec<WireHeartbeat> {
        let mut wire = Vec::with_capacity(batch.len());
        for queued in batch {
            let lines = lines_in_file(&queued.heartbeat.entity).await;
            wire.push(queued.heartbeat.to_wire(lines));
        }
        wire
    }
}

#[async_trait]
impl Transmitter for CliTransmitter {
    async fn send(
        &self,
        batch: &[QueuedHeartbeat],
        settings: &Settings,
    ) -> Result<Receipt, TransmitError> {
        let Some(primary) = batch.first() else {
            return Ok(Receipt::all_accepted());
        };

        let wire = Self::wire_batch(batch).await;
        let extra = &wire[1..];
        let has_extra = !extra.is_empty();

        let mut command = Command::new(&self.cli_path);
        command
            .args(self.arguments(&primary.heartbeat, wire[0].lines, settings, has_extra))
            .stdin(if has_extra {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            cli = %self.cli_path.display(),
            heartbeats = batch.len(),
            "invoking heartbeat CLI"
        );

        let mut child = command.spawn().map_err(|e| {
            TransmitError::network(format!(
                "could not run {}: {e}",
                self.cli_path.display()
            ))
        })?;

        if has_extra {
            let payload = serde_json::to_vec(extra)
                .map_err(|e| TransmitError::malformed(format!("extra heartbeats: {e}")))?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&payload)
                    .await
                    .map_err(|e| TransmitError::network(format!("writing to CLI stdin: {e}")))?;
                // closing stdin lets the CLI finish reading
                drop(stdin);
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                TransmitError::network(format!(
                    "heartbeat CLI did not finish within {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| TransmitError::network(format!("waiting for heartbeat CLI: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        Self::classify_exit(output.status.code(), &stderr)
    }

    fn name(&self) -> &'static str {
        "cli"
    }
}
