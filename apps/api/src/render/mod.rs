//! Render Service: turns LaTeX source into a PDF with the external
//! typesetting tool.
//!
//! A failed render is data, not an error: `compile` only returns `Err` when
//! the source cannot be stored. Tool failures, timeouts, spawn errors and a
//! run that leaves no PDF all come back as `CompileOutcome { success: false, .. }`.
//!
//! Renders are written into a staging directory. Callers promote it to a
//! numbered version and move the recorded paths with [`CompileOutcome::relocate`].

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RenderSettings;
use crate::storage::{validate_identifier, ArtifactStore, StorageError};

/// Characters of the tool's log kept on failure.
const LOG_TAIL_CHARS: usize = 2000;
/// Characters of captured stdout kept on failure.
const STDOUT_TAIL_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of one compile attempt, stored verbatim in job payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<String>,
    pub tex_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    /// Last ~2000 characters of the tool's log (failure only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<String>,
    /// Last ~500 characters of stdout, or the spawn/timeout reason (failure only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompileOutcome {
    /// Rewrites every recorded path under `from` to the same path under `to`.
    pub fn relocate(&mut self, from: &Path, to: &Path) {
        let moved = |path: &mut String| {
            if let Ok(rest) = Path::new(path.as_str()).strip_prefix(from) {
                *path = to.join(rest).display().to_string();
            }
        };
        moved(&mut self.tex_path);
        if let Some(path) = self.pdf_path.as_mut() {
            moved(path);
        }
        if let Some(path) = self.log_path.as_mut() {
            moved(path);
        }
    }
}

/// Strips NUL bytes, which generation backends occasionally emit and which
/// break the typesetting tool's input.
pub fn sanitize_source(source: &str) -> String {
    source.replace('\0', "")
}

/// Checks that `{base}.tex` and its siblings are storable names.
pub fn validate_output_name(filename_base: &str) -> Result<(), RenderError> {
    validate_identifier("filename", &format!("{filename_base}.tex"))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RenderService {
    store: ArtifactStore,
    settings: RenderSettings,
}

enum ToolRun {
    Exited { ok: bool, code: Option<i32>, stdout: String },
    TimedOut,
    SpawnFailed(String),
}

impl RenderService {
    pub fn new(store: ArtifactStore, settings: RenderSettings) -> Self {
        Self { store, settings }
    }

    /// Writes `{base}.tex` into the staging directory for `token`, then runs
    /// the tool there.
    pub async fn compile(
        &self,
        workspace: &str,
        workflow: Uuid,
        token: Uuid,
        filename_base: &str,
        source: &str,
    ) -> Result<CompileOutcome, RenderError> {
        validate_output_name(filename_base)?;
        let source = sanitize_source(source);
        let tex_path = self
            .store
            .write_staged(workspace, workflow, token, &format!("{filename_base}.tex"), source.as_bytes())
            .await?;
        let out_dir = self.store.staging_dir(workspace, workflow, token)?;
        let pdf_path = out_dir.join(format!("{filename_base}.pdf"));
        let log_path = out_dir.join(format!("{filename_base}.log"));

        let mut run = self.run_tool(&out_dir, &tex_path).await;
        if self.settings.second_pass && matches!(run, ToolRun::Exited { ok: true, .. }) {
            info!("Running cross-reference pass for {workflow}/{filename_base}");
            run = self.run_tool(&out_dir, &tex_path).await;
        }

        let pdf_written = tokio::fs::try_exists(&pdf_path).await.unwrap_or(false);
        let tex_path = tex_path.display().to_string();
        let outcome = match run {
            ToolRun::Exited { ok: true, .. } if pdf_written => {
                info!("Rendered {workflow}/{filename_base}.pdf");
                CompileOutcome {
                    success: true,
                    pdf_path: Some(pdf_path.display().to_string()),
                    tex_path,
                    log_path: Some(log_path.display().to_string()),
                    log_tail: None,
                    error: None,
                }
            }
            ToolRun::Exited { ok: true, .. } => {
                let reason = "render tool exited successfully but wrote no PDF".to_string();
                warn!("Render for {workflow}/{filename_base}: {reason}");
                CompileOutcome {
                    success: false,
                    pdf_path: None,
                    tex_path,
                    log_path: Some(log_path.display().to_string()),
                    log_tail: Some(read_log_tail(&log_path).await.unwrap_or_else(|| reason.clone())),
                    error: Some(reason),
                }
            }
            ToolRun::Exited { code, stdout, .. } => {
                let error = tail_chars(&stdout, STDOUT_TAIL_CHARS);
                let log_tail = read_log_tail(&log_path)
                    .await
                    .or_else(|| (!error.trim().is_empty()).then(|| error.clone()))
                    .unwrap_or_else(|| format!("render tool exited with status {code:?} and wrote no log"));
                warn!("Render failed for {workflow}/{filename_base} (status {code:?})");
                CompileOutcome {
                    success: false,
                    pdf_path: None,
                    tex_path,
                    log_path: Some(log_path.display().to_string()),
                    log_tail: Some(log_tail),
                    error: Some(error),
                }
            }
            ToolRun::TimedOut => {
                let reason = format!(
                    "render tool timed out after {}s",
                    self.settings.timeout.as_secs()
                );
                warn!("Render for {workflow}/{filename_base}: {reason}");
                CompileOutcome {
                    success: false,
                    pdf_path: None,
                    tex_path,
                    log_path: Some(log_path.display().to_string()),
                    log_tail: Some(read_log_tail(&log_path).await.unwrap_or_else(|| reason.clone())),
                    error: Some(reason),
                }
            }
            ToolRun::SpawnFailed(reason) => {
                warn!("Render for {workflow}/{filename_base} could not start: {reason}");
                CompileOutcome {
                    success: false,
                    pdf_path: None,
                    tex_path,
                    log_path: None,
                    log_tail: Some(reason.clone()),
                    error: Some(reason),
                }
            }
        };
        Ok(outcome)
    }

    async fn run_tool(&self, out_dir: &Path, tex_path: &Path) -> ToolRun {
        let child = Command::new(&self.settings.command)
            .arg("-interaction=nonstopmode")
            .arg("-output-directory")
            .arg(out_dir)
            .arg(tex_path)
            .current_dir(out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return ToolRun::SpawnFailed(format!(
                    "failed to start '{}': {e}",
                    self.settings.command
                ))
            }
        };

        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout(self.settings.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ToolRun::Exited {
                ok: output.status.success(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            },
            Ok(Err(e)) => ToolRun::SpawnFailed(format!("failed to wait for render tool: {e}")),
            Err(_) => ToolRun::TimedOut,
        }
    }
}

async fn read_log_tail(path: &Path) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let text = String::from_utf8_lossy(&bytes);
    let tail = tail_chars(&text, LOG_TAIL_CHARS);
    (!tail.trim().is_empty()).then_some(tail)
}

/// The last `n` characters of `text`, on a char boundary.
fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}
