use std::process::Command;
use std::time::Duration;

use tracing::debug;

use super::ansi::clean_cli_output;
use super::{Prompt, Strategy, VerdictSource};
use crate::capture::CaptureBatch;
use crate::error::{Result, WardenError};
use crate::exec;

/// One judge CLI process per tick, reading the screenshots with its file tool.
pub struct CliStrategy {
    program: String,
    timeout: Duration,
}

impl CliStrategy {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, batch: &CaptureBatch, prompt: &Prompt) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--allowed-tools")
            .arg("read_file")
            .arg("--yolo")
            .arg("-p")
            .arg(prompt.with_files(&batch.images))
            .env("NO_COLOR", "true");
        if let Some(folder) = batch.folder() {
            command.current_dir(folder);
        }
        command
    }
}

impl Strategy for CliStrategy {
    fn source(&self) -> VerdictSource {
        VerdictSource::Cli
    }

    fn available(&mut self) -> bool {
        !self.program.is_empty()
    }

    fn analyze(&mut self, batch: &CaptureBatch, prompt: &Prompt) -> Result<String> {
        let output = exec::run_with_timeout(&mut self.command(batch, prompt), self.timeout)
            .map_err(|err| match err {
                WardenError::AnalysisTimeout { secs, .. } => WardenError::AnalysisTimeout {
                    strategy: VerdictSource::Cli.to_string(),
                    secs,
                },
                other => WardenError::analysis(VerdictSource::Cli.to_string(), other.to_string()),
            })?;

        debug!(status = %output.status, "Judge CLI exited");
        let cleaned = clean_cli_output(&output.combined());
        if !output.status.success() && cleaned.is_empty() {
            return Err(WardenError::analysis(
                VerdictSource::Cli.to_string(),
                format!("exited with {}", output.status),
            ));
        }
        Ok(cleaned)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::rules::RuleSet;
    use chrono::Local;
    use std::os::unix::fs::PermissionsExt;

    fn fake_cli(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("judge");
        fs_err::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs_err::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn batch(dir: &std::path::Path) -> CaptureBatch {
        let image = dir.join("Screenshot_20260130_090000_desktop.png");
        fs_err::write(&image, b"png").unwrap();
        CaptureBatch::new(vec![image], Local::now())
    }

    #[test]
    fn passes_flags_and_cleans_output() {
        let temp_dir = tempfile::tempdir().unwrap();
        let program = fake_cli(
            temp_dir.path(),
            r#"[ "$1" = "--allowed-tools" ] && [ "$2" = "read_file" ] && [ "$3" = "--yolo" ] && [ "$4" = "-p" ] || exit 9
printf '\033[1mYOLO mode is enabled\033[0m\n'
echo 'ReadFile Screenshot.png'
echo "cwd=$(basename "$PWD")" >&2
printf '[Verdict]\nNG\nReason: video\n'"#,
        );
        let mut strategy = CliStrategy::new(program, Duration::from_secs(10));
        let prompt = Prompt::build(&RuleSet::new("Goal: study"));
        let raw = strategy.analyze(&batch(temp_dir.path()), &prompt).unwrap();
        assert!(raw.starts_with("[Verdict]\nNG\nReason: video"));
        let dir_name = temp_dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(raw.ends_with(&format!("cwd={}", dir_name)));
    }

    #[test]
    fn timeout_is_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let program = fake_cli(temp_dir.path(), "sleep 5");
        let mut strategy = CliStrategy::new(program, Duration::from_millis(200));
        let prompt = Prompt::build(&RuleSet::new("Goal: study"));
        assert!(matches!(
            strategy.analyze(&batch(temp_dir.path()), &prompt),
            Err(WardenError::AnalysisTimeout { .. })
        ));
    }

    #[test]
    fn missing_program_is_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut strategy = CliStrategy::new("/nonexistent/judge", Duration::from_secs(1));
        let prompt = Prompt::build(&RuleSet::new("Goal: study"));
        assert!(strategy.analyze(&batch(temp_dir.path()), &prompt).is_err());
    }
}
