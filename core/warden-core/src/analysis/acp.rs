//! Long-lived judge session over the Agent Client Protocol.
//!
//! The judge CLI runs as a child process speaking line-delimited JSON-RPC
//! 2.0 on stdio. A turn is one `session/prompt` request; the answer streams
//! in as `session/update` notifications and the turn ends when the prompt
//! request itself is answered. Every analysis is followed by `session/new`
//! so no screenshot can colour the next judgment.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Prompt, Strategy, VerdictSource};
use crate::capture::CaptureBatch;
use crate::error::{Result, WardenError};
use crate::tuning::AnalysisTuning;

const PROTOCOL_VERSION: u32 = 1;
const METHOD_NOT_FOUND: i64 = -32601;

pub struct SessionStrategy {
    node: String,
    script: PathBuf,
    workdir: PathBuf,
    rpc_timeout: Duration,
    turn_timeout: Duration,
    retry_after: Duration,
    session: Option<AcpSession>,
    last_failure: Option<Instant>,
}

impl SessionStrategy {
    pub fn new(node: String, script: PathBuf, workdir: PathBuf, tuning: &AnalysisTuning) -> Self {
        Self {
            node,
            script,
            workdir,
            rpc_timeout: Duration::from_secs(tuning.rpc_timeout_secs),
            turn_timeout: Duration::from_secs(tuning.verdict_timeout_secs),
            retry_after: Duration::from_secs(tuning.session_retry_secs),
            session: None,
            last_failure: None,
        }
    }

    fn mark_failed(&mut self) {
        self.session = None;
        self.last_failure = Some(Instant::now());
    }

    fn start(&mut self) -> bool {
        match AcpSession::start(&self.node, &self.script, &self.workdir, self.rpc_timeout) {
            Ok(session) => {
                info!(session = %short_id(&session.session_id), "Judge session started");
                self.session = Some(session);
                self.last_failure = None;
                true
            }
            Err(err) => {
                warn!(error = %err, "Failed to start judge session");
                self.mark_failed();
                false
            }
        }
    }
}

impl Strategy for SessionStrategy {
    fn source(&self) -> VerdictSource {
        VerdictSource::Acp
    }

    fn available(&mut self) -> bool {
        if let Some(session) = self.session.as_mut() {
            if session.is_alive() {
                return true;
            }
            warn!("Judge session process exited");
            self.mark_failed();
        }
        if let Some(failed_at) = self.last_failure {
            if failed_at.elapsed() < self.retry_after {
                return false;
            }
        }
        self.start()
    }

    fn analyze(&mut self, batch: &CaptureBatch, prompt: &Prompt) -> Result<String> {
        let turn_timeout = self.turn_timeout.min(self.rpc_timeout);
        let rpc_timeout = self.rpc_timeout;
        let folder = batch
            .folder()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.workdir.clone());
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| WardenError::analysis("ACP", "session is not running"))?;

        let result = session.prompt(&prompt.with_files(&batch.images), turn_timeout);
        if let Err(err) = session.new_session(&folder, rpc_timeout) {
            warn!(error = %err, "Failed to reset judge session");
            self.mark_failed();
        }
        result
    }

    fn shutdown(&mut self) {
        self.session = None;
    }
}

struct AcpSession {
    child: Child,
    stdin: ChildStdin,
    incoming: Receiver<Value>,
    next_id: u64,
    session_id: String,
    transcript: String,
}

impl AcpSession {
    fn start(node: &str, script: &Path, workdir: &Path, rpc_timeout: Duration) -> Result<Self> {
        if !script.exists() {
            return Err(WardenError::FileNotFound(script.to_path_buf()));
        }
        let mut child = Command::new(node)
            .arg(script)
            .arg("--experimental-acp")
            .current_dir(workdir)
            .env("NO_COLOR", "true")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| WardenError::analysis("ACP", format!("failed to spawn: {}", err)))?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                return Err(WardenError::analysis("ACP", "child stdio unavailable"));
            }
        };

        let (tx, incoming) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                match serde_json::from_str::<Value>(&line) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(_) => debug!(line = %line, "Judge session wrote non-JSON output"),
                }
            }
        });
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
                debug!(line = %line, "Judge session stderr");
            }
        });

        let mut session = Self {
            child,
            stdin,
            incoming,
            next_id: 1,
            session_id: String::new(),
            transcript: String::new(),
        };
        session.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientCapabilities": {
                    "fs": { "readTextFile": true, "writeTextFile": false },
                    "terminal": true,
                },
            }),
            rpc_timeout,
        )?;
        session.new_session(workdir, rpc_timeout)?;
        Ok(session)
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn new_session(&mut self, cwd: &Path, timeout: Duration) -> Result<()> {
        let result = self.request(
            "session/new",
            json!({ "cwd": cwd.to_string_lossy(), "mcpServers": [] }),
            timeout,
        )?;
        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::analysis("ACP", "session/new returned no sessionId"))?;
        debug!(session = %short_id(session_id), "Judge session reset");
        self.session_id = session_id.to_string();
        Ok(())
    }

    /// One turn. Returns the concatenated message chunks.
    fn prompt(&mut self, text: &str, timeout: Duration) -> Result<String> {
        self.transcript.clear();
        let params = json!({
            "sessionId": self.session_id,
            "prompt": [{ "type": "text", "text": text }],
        });
        match self.request("session/prompt", params, timeout) {
            Ok(_) => Ok(std::mem::take(&mut self.transcript)),
            Err(err) => {
                if matches!(err, WardenError::AnalysisTimeout { .. }) {
                    self.cancel_turn();
                }
                Err(err)
            }
        }
    }

    /// Tells the judge to drop an abandoned turn so the next request is not
    /// queued behind it.
    fn cancel_turn(&mut self) {
        let notice = json!({
            "jsonrpc": "2.0",
            "method": "session/cancel",
            "params": { "sessionId": self.session_id },
        });
        match self.send(&notice) {
            Ok(()) => debug!(session = %short_id(&self.session_id), "Cancelled judge turn"),
            Err(err) => warn!(error = %err, "Failed to cancel judge turn"),
        }
    }

    fn request(&mut self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match self.incoming.recv_timeout(remaining) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(WardenError::AnalysisTimeout {
                        strategy: format!("ACP {}", method),
                        secs: timeout.as_secs(),
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(WardenError::analysis("ACP", "session process exited"))
                }
            };
            if let Some(reply) = self.dispatch(message, id)? {
                return reply;
            }
        }
    }

    /// Handles one incoming message. Returns the reply when it answers `waiting_for`.
    fn dispatch(&mut self, message: Value, waiting_for: u64) -> Result<Option<Result<Value>>> {
        let method = message.get("method").and_then(Value::as_str).map(str::to_string);
        match (method, message.get("id").cloned()) {
            (Some(method), None) => {
                if method == "session/update" {
                    self.on_update(&message["params"]);
                }
                Ok(None)
            }
            (Some(method), Some(id)) => {
                let response = self.answer_client_request(&method, &message["params"], id);
                self.send(&response)?;
                Ok(None)
            }
            (None, Some(id)) if id.as_u64() == Some(waiting_for) => {
                if let Some(error) = message.get("error") {
                    return Ok(Some(Err(WardenError::analysis(
                        "ACP",
                        format!("RPC error: {}", error),
                    ))));
                }
                Ok(Some(Ok(message.get("result").cloned().unwrap_or(Value::Null))))
            }
            _ => Ok(None),
        }
    }

    fn on_update(&mut self, params: &Value) {
        if let Some(session_id) = params.get("sessionId").and_then(Value::as_str) {
            if session_id != self.session_id {
                return;
            }
        }
        let update = &params["update"];
        if update.get("sessionUpdate").and_then(Value::as_str) != Some("agent_message_chunk") {
            return;
        }
        if let Some(text) = update.pointer("/content/text").and_then(Value::as_str) {
            self.transcript.push_str(text);
        }
    }

    /// Requests the judge makes of us: file reads and tool permissions.
    fn answer_client_request(&self, method: &str, params: &Value, id: Value) -> Value {
        let result = match method {
            "fs/read_text_file" => {
                let path = params.get("path").and_then(Value::as_str).unwrap_or_default();
                match fs_err::read_to_string(path) {
                    Ok(content) => Ok(json!({ "content": content })),
                    Err(err) => Err(json!({ "code": -32000, "message": err.to_string() })),
                }
            }
            "session/request_permission" => {
                let options = params["options"].as_array().cloned().unwrap_or_default();
                let chosen = options
                    .iter()
                    .find(|option| option["kind"] == "allow_once")
                    .or_else(|| options.first())
                    .and_then(|option| option.get("optionId").cloned());
                match chosen {
                    Some(option_id) => Ok(json!({
                        "outcome": { "outcome": "selected", "optionId": option_id }
                    })),
                    None => Ok(json!({ "outcome": { "outcome": "cancelled" } })),
                }
            }
            _ => Err(json!({ "code": METHOD_NOT_FOUND, "message": format!("unsupported method {}", method) })),
        };
        match result {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        }
    }

    fn send(&mut self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_string(message).map_err(|e| WardenError::Json {
            context: "Failed to serialize RPC message".to_string(),
            source: e,
        })?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|err| WardenError::analysis("ACP", format!("failed to write: {}", err)))
    }
}

impl Drop for AcpSession {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
