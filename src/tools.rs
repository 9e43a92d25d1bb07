//! Invocation of the external conversion executables.

use crate::error::ConversionError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Maximum number of stderr characters kept in a tool failure.
const STDERR_LIMIT: usize = 2000;

/// One external program run: executable plus its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Runs an external tool to completion.
///
/// A zero exit status is success; the caller inspects the produced files.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> Result<(), ConversionError>;
}

/// Runs tools as child processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<(), ConversionError> {
        let start = Instant::now();
        debug!(program = %invocation.program, args = ?invocation.args, "Running tool");

        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ConversionError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .chars()
                .take(STDERR_LIMIT)
                .collect();
            let code = output.status.code().unwrap_or(-1);
            error!(program = %invocation.program, code, stderr = %stderr, "Tool failed");
            return Err(ConversionError::ToolFailed {
                program: invocation.program.clone(),
                code,
                stderr,
            });
        }

        info!(
            program = %invocation.program,
            duration_ms = start.elapsed().as_millis() as u64,
            "Tool finished"
        );
        Ok(())
    }
}

/// Fails with `MissingOutput` unless `path` exists after a tool run.
pub async fn ensure_output(path: &Path) -> Result<(), ConversionError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(ConversionError::MissingOutput(path.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_exit_is_success() {
        let runner = ProcessRunner::new();
        let result = runner.run(&ToolInvocation::new("true", Vec::<String>::new())).await;
        assert!(result.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let runner = ProcessRunner::new();
        let invocation = ToolInvocation::new("sh", ["-c", "echo broken >&2; exit 3"]);

        match runner.run(&invocation).await {
            Err(ConversionError::ToolFailed { code, stderr, .. }) => {
                assert_eq!(code, 3);
                assert!(stderr.contains("broken"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = ProcessRunner::new();
        let result = runner
            .run(&ToolInvocation::new("definitely-not-a-real-tool-xyz", ["--help"]))
            .await;
        assert!(matches!(result, Err(ConversionError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_ensure_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pdf");

        assert!(matches!(
            ensure_output(&path).await,
            Err(ConversionError::MissingOutput(_))
        ));

        std::fs::write(&path, b"%PDF").unwrap();
        assert!(ensure_output(&path).await.is_ok());
    }
}
