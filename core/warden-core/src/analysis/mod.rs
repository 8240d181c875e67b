//! Screenshot analysis with ordered fallback strategies.
//!
//! The pipeline tries each available strategy in order: the long-lived
//! session, the one-shot CLI, then the HTTP API. The first usable answer
//! wins. When nothing usable comes back the verdict is compliant: a judge
//! outage must never punish the user.

mod acp;
mod ansi;
mod cli;
mod http;
mod prompt;
mod verdict;

pub use acp::SessionStrategy;
pub use ansi::{clean_cli_output, is_local_read_failure};
pub use cli::CliStrategy;
pub use http::HttpStrategy;
pub use prompt::Prompt;
pub use verdict::{extract, extract_reason, is_violation, Extracted};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};
use warden_protocol::AgentConfig;

use crate::capture::CaptureBatch;
use crate::error::Result;
use crate::rules::RuleSet;
use crate::tuning::AnalysisTuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictSource {
    Cli,
    Api,
    Acp,
    /// No strategy produced a usable answer.
    None,
}

impl fmt::Display for VerdictSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VerdictSource::Cli => "CLI",
            VerdictSource::Api => "API",
            VerdictSource::Acp => "ACP",
            VerdictSource::None => "None",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub is_violation: bool,
    pub reason: String,
    pub raw_text: String,
    pub source: VerdictSource,
}

impl Verdict {
    pub fn from_raw(raw_text: String, source: VerdictSource) -> Self {
        let Extracted {
            is_violation,
            reason,
        } = verdict::extract(&raw_text);
        Self {
            is_violation,
            reason,
            raw_text,
            source,
        }
    }

    /// Compliant verdict carrying a diagnostic in place of judge output.
    pub fn fail_open(diagnostic: impl Into<String>) -> Self {
        Self {
            is_violation: false,
            reason: String::new(),
            raw_text: diagnostic.into(),
            source: VerdictSource::None,
        }
    }
}

/// One way of asking the judge.
pub trait Strategy: Send {
    fn source(&self) -> VerdictSource;

    /// Whether this strategy can be attempted now. May start background resources.
    fn available(&mut self) -> bool;

    /// Raw judge output for `batch`.
    fn analyze(&mut self, batch: &CaptureBatch, prompt: &Prompt) -> Result<String>;

    /// Releases background resources. Called at session end.
    fn shutdown(&mut self) {}
}

pub struct AnalysisPipeline {
    strategies: Vec<Box<dyn Strategy>>,
}

impl AnalysisPipeline {
    pub fn new(strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    /// Session and CLI strategies run in CLI mode; the API needs a key.
    pub fn from_config(config: &AgentConfig, tuning: &AnalysisTuning, workdir: PathBuf) -> Self {
        let mut strategies: Vec<Box<dyn Strategy>> = Vec::new();
        if !config.use_api {
            if !config.acp_script_path.trim().is_empty() {
                strategies.push(Box::new(SessionStrategy::new(
                    tuning.node_path.clone(),
                    PathBuf::from(config.acp_script_path.trim()),
                    workdir,
                    tuning,
                )));
            }
            strategies.push(Box::new(CliStrategy::new(
                cli_program(config),
                Duration::from_secs(tuning.cli_timeout_secs),
            )));
        }
        if !config.api_key.trim().is_empty() {
            strategies.push(Box::new(HttpStrategy::new(
                tuning.api_base.clone(),
                config.model.clone(),
                config.api_key.trim().to_string(),
                Duration::from_secs(tuning.verdict_timeout_secs),
            )));
        }
        Self::new(strategies)
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    /// Never fails. Every error becomes a compliant verdict with a diagnostic.
    pub fn analyze(&mut self, batch: &CaptureBatch, rules: &RuleSet) -> Verdict {
        if batch.is_empty() {
            return Verdict::fail_open("No screenshots to analyse");
        }

        let prompt = Prompt::build(rules);
        let mut diagnostics = Vec::new();

        for strategy in &mut self.strategies {
            let source = strategy.source();
            if !strategy.available() {
                debug!(%source, "Analysis strategy unavailable");
                continue;
            }
            match strategy.analyze(batch, &prompt) {
                Ok(raw) if is_usable(&raw) => {
                    info!(%source, "Analysis completed");
                    return Verdict::from_raw(raw, source);
                }
                Ok(raw) => {
                    warn!(%source, "Analysis output unusable; falling back");
                    diagnostics.push(format!("{}: unusable output: {}", source, raw.trim()));
                }
                Err(err) => {
                    warn!(%source, error = %err, "Analysis strategy failed; falling back");
                    diagnostics.push(format!("{}: {}", source, err));
                }
            }
        }

        if diagnostics.is_empty() {
            return Verdict::fail_open(
                "No analysis strategy is available and no API key is configured",
            );
        }
        Verdict::fail_open(format!(
            "All analysis strategies failed\n{}",
            diagnostics.join("\n")
        ))
    }

    pub fn shutdown(&mut self) {
        for strategy in &mut self.strategies {
            strategy.shutdown();
        }
    }
}

fn is_usable(raw: &str) -> bool {
    !raw.trim().is_empty() && !is_local_read_failure(raw)
}

fn cli_program(config: &AgentConfig) -> String {
    let path = config.cli_path.trim();
    if path.is_empty() {
        "gemini".to_string()
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenError;
    use chrono::Local;
    use std::sync::{Arc, Mutex};

    struct Scripted {
        source: VerdictSource,
        available: bool,
        reply: std::result::Result<&'static str, &'static str>,
        calls: Arc<Mutex<Vec<VerdictSource>>>,
    }

    impl Strategy for Scripted {
        fn source(&self) -> VerdictSource {
            self.source
        }

        fn available(&mut self) -> bool {
            self.available
        }

        fn analyze(&mut self, _batch: &CaptureBatch, _prompt: &Prompt) -> Result<String> {
            self.calls.lock().unwrap().push(self.source);
            self.reply
                .map(str::to_string)
                .map_err(|details| WardenError::analysis(self.source.to_string(), details))
        }
    }

    fn batch() -> CaptureBatch {
        CaptureBatch::new(vec![PathBuf::from("/tmp/Screenshot_1.png")], Local::now())
    }

    fn scripted(
        source: VerdictSource,
        available: bool,
        reply: std::result::Result<&'static str, &'static str>,
        calls: &Arc<Mutex<Vec<VerdictSource>>>,
    ) -> Box<dyn Strategy> {
        Box::new(Scripted {
            source,
            available,
            reply,
            calls: Arc::clone(calls),
        })
    }

    #[test]
    fn falls_through_to_first_usable_answer() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = AnalysisPipeline::new(vec![
            scripted(VerdictSource::Acp, false, Ok("unused"), &calls),
            scripted(VerdictSource::Cli, true, Ok("Error: file not found"), &calls),
            scripted(VerdictSource::Api, true, Ok("[Verdict]\nNG\nReason: game"), &calls),
        ]);
        let verdict = pipeline.analyze(&batch(), &RuleSet::new("Goal: study"));
        assert!(verdict.is_violation);
        assert_eq!(verdict.source, VerdictSource::Api);
        assert_eq!(verdict.reason, "game");
        assert_eq!(
            *calls.lock().unwrap(),
            vec![VerdictSource::Cli, VerdictSource::Api]
        );
    }

    #[test]
    fn every_failure_is_compliant() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = AnalysisPipeline::new(vec![
            scripted(VerdictSource::Acp, true, Err("session died"), &calls),
            scripted(VerdictSource::Cli, true, Ok("   "), &calls),
            scripted(VerdictSource::Api, true, Err("HTTP 503"), &calls),
        ]);
        let verdict = pipeline.analyze(&batch(), &RuleSet::new("Goal: study"));
        assert!(!verdict.is_violation);
        assert_eq!(verdict.source, VerdictSource::None);
        assert!(verdict.raw_text.contains("session died"));
        assert!(verdict.raw_text.contains("HTTP 503"));
    }

    #[test]
    fn empty_batch_and_no_strategies_fail_open() {
        let mut pipeline = AnalysisPipeline::new(Vec::new());
        let empty = CaptureBatch::new(Vec::new(), Local::now());
        assert!(!pipeline.analyze(&empty, &RuleSet::new("r")).is_violation);
        let verdict = pipeline.analyze(&batch(), &RuleSet::new("r"));
        assert!(!verdict.is_violation);
        assert!(verdict.raw_text.contains("no API key"));
    }

    #[test]
    fn api_mode_without_cli_strategies() {
        let config = AgentConfig {
            rules: "Goal: study".into(),
            use_api: true,
            api_key: "key".into(),
            acp_script_path: "/opt/gemini/index.js".into(),
            ..AgentConfig::default()
        };
        let pipeline =
            AnalysisPipeline::from_config(&config, &AnalysisTuning::default(), PathBuf::from("/tmp"));
        assert_eq!(pipeline.strategy_count(), 1);

        let config = AgentConfig {
            use_api: false,
            ..config
        };
        let pipeline =
            AnalysisPipeline::from_config(&config, &AnalysisTuning::default(), PathBuf::from("/tmp"));
        assert_eq!(pipeline.strategy_count(), 3);
    }
}
