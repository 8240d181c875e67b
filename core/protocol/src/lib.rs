//! Coordination file records for warden.
//!
//! This crate is shared by the agent, the watchdog tiers and UI clients to
//! prevent schema drift. The four well-known files live in one monitoring
//! directory and each field has exactly one writer:
//!
//! | File | Writer | Readers |
//! |------|--------|---------|
//! | `config.json` | UI (once per session) | agent (startup), guard (hot reload) |
//! | `status.json` | agent (every tick) | UI |
//! | `command.json` | UI (one pending instruction) | agent (claim + delete) |
//! | `agent_log.txt` | agent (append-only) | UI (tail) |
//!
//! Field names are PascalCase on disk. Decoding is lenient because the UI
//! historically wrote every value as a string (`"UseApi": "False"`).

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const CONFIG_FILE: &str = "config.json";
pub const STATUS_FILE: &str = "status.json";
pub const COMMAND_FILE: &str = "command.json";
pub const LOG_FILE: &str = "agent_log.txt";

/// Suffix of a command file the agent has claimed but not yet deleted.
pub const CLAIMED_SUFFIX: &str = "claimed";

/// How much of the audit log the UI tails.
pub const LOG_TAIL_BYTES: u64 = 64 * 1024;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// config.json
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentConfig {
    #[serde(default)]
    pub rules: String,
    #[serde(default)]
    pub cli_path: String,
    #[serde(default)]
    pub acp_script_path: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub use_api: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        serialize_with = "timestamp_string"
    )]
    pub start_time: Option<DateTime<Local>>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        serialize_with = "timestamp_string"
    )]
    pub end_time: Option<DateTime<Local>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rules: String::new(),
            cli_path: String::new(),
            acp_script_path: String::new(),
            model: default_model(),
            use_api: false,
            api_key: String::new(),
            start_time: None,
            end_time: None,
        }
    }
}

impl AgentConfig {
    /// Checks the configuration is sufficient to start monitoring.
    ///
    /// Rules are always required; a credential is required only in API mode.
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.rules.trim().is_empty() {
            return Err(ErrorInfo::new("missing_rules", "no rules are configured"));
        }
        if self.use_api && self.api_key.trim().is_empty() {
            return Err(ErrorInfo::new(
                "missing_api_key",
                "API mode is selected but no API key is configured",
            ));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end <= start {
                return Err(ErrorInfo::new(
                    "invalid_window",
                    "EndTime must be after StartTime",
                ));
            }
        }
        Ok(())
    }
}

pub fn parse_config(bytes: &[u8]) -> Result<AgentConfig, ErrorInfo> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_file", "config file is empty"));
    }
    serde_json::from_slice(bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("config was not valid JSON: {}", err),
        )
    })
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// status.json
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusRecord {
    pub points: u32,
    #[serde(default)]
    pub level: u8,
    #[serde(
        deserialize_with = "required_timestamp",
        serialize_with = "timestamp_value"
    )]
    pub last_updated: DateTime<Local>,
}

pub fn parse_status(bytes: &[u8]) -> Result<StatusRecord, ErrorInfo> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_file", "status file is empty"));
    }
    serde_json::from_slice(bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("status was not valid JSON: {}", err),
        )
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// command.json
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    AddPoints,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandRecord {
    pub command: CommandKind,
    #[serde(default)]
    pub value: i64,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        serialize_with = "timestamp_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Local>>,
}

impl CommandRecord {
    pub fn add_points(value: i64) -> Self {
        Self {
            command: CommandKind::AddPoints,
            value,
            timestamp: Some(Local::now()),
        }
    }

    pub fn stop() -> Self {
        Self {
            command: CommandKind::Stop,
            value: 0,
            timestamp: Some(Local::now()),
        }
    }
}

pub fn parse_command(bytes: &[u8]) -> Result<CommandRecord, ErrorInfo> {
    let value: Value = serde_json::from_slice(bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("command was not valid JSON: {}", err),
        )
    })?;
    if !value.is_object() {
        return Err(ErrorInfo::new("invalid_command", "command must be an object"));
    }
    match value.get("Command").and_then(|v| v.as_str()) {
        Some("AddPoints") | Some("Stop") => {}
        Some(other) => {
            return Err(ErrorInfo::new(
                "unknown_command",
                format!("unsupported command: {}", other),
            ))
        }
        None => return Err(ErrorInfo::new("missing_field", "Command is required")),
    }
    serde_json::from_value(value)
        .map_err(|err| ErrorInfo::new("invalid_command", format!("malformed command: {}", err)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lenient decoding helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Parses an ISO-8601 timestamp with or without an offset.
/// Offset-less values are interpreted as local time.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Local>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Local));
    }
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()?;
    Local.from_local_datetime(&naive).earliest()
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        _ => false,
    })
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Local>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => parse_timestamp(&s),
        _ => None,
    })
}

fn required_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Local>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

fn timestamp_string<S>(value: &Option<DateTime<Local>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
        None => serializer.serialize_none(),
    }
}

fn timestamp_value<S>(value: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string_typed_config() {
        let json = br#"{
            "Rules": "Goal: write thesis\nProhibited: video sites",
            "ApiKey": "",
            "UseApi": "False",
            "Model": "gemini-2.5-flash",
            "StartTime": "2026-01-30T09:00:00.0000000+09:00",
            "EndTime": "2026-01-30T10:30:00.0000000+09:00",
            "CliPath": "/usr/local/bin/gemini"
        }"#;
        let config = parse_config(json).unwrap();
        assert!(!config.use_api);
        assert_eq!(config.cli_path, "/usr/local/bin/gemini");
        assert!(config.acp_script_path.is_empty());
        let start = config.start_time.unwrap();
        let end = config.end_time.unwrap();
        assert_eq!((end - start).num_minutes(), 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn decodes_native_bool_and_offsetless_time() {
        let json = br#"{"Rules":"r","UseApi":true,"ApiKey":"k","StartTime":"2026-01-30T09:00:00"}"#;
        let config = parse_config(json).unwrap();
        assert!(config.use_api);
        assert!(config.start_time.is_some());
        assert!(config.end_time.is_none());
    }

    #[test]
    fn rejects_missing_rules() {
        let config = AgentConfig::default();
        assert_eq!(config.validate().unwrap_err().code, "missing_rules");
    }

    #[test]
    fn rejects_api_mode_without_key() {
        let config = AgentConfig {
            rules: "Goal: study".to_string(),
            use_api: true,
            ..AgentConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().code, "missing_api_key");
    }

    #[test]
    fn rejects_empty_config_file() {
        assert_eq!(parse_config(b"  \n").unwrap_err().code, "empty_file");
    }

    #[test]
    fn parses_add_points_command() {
        let command = parse_command(br#"{"Command":"AddPoints","Value":-100}"#).unwrap();
        assert_eq!(command.command, CommandKind::AddPoints);
        assert_eq!(command.value, -100);
    }

    #[test]
    fn rejects_unknown_command() {
        let err = parse_command(br#"{"Command":"Explode","Value":1}"#).unwrap_err();
        assert_eq!(err.code, "unknown_command");
    }

    #[test]
    fn rejects_truncated_command() {
        assert!(parse_command(br#"{"Command":"AddPo"#).is_err());
    }

    #[test]
    fn status_serializes_pascal_case() {
        let record = StatusRecord {
            points: 30,
            level: 0,
            last_updated: Local::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["Points"], 30);
        assert!(json["LastUpdated"].is_string());
        let parsed = parse_status(serde_json::to_string(&record).unwrap().as_bytes()).unwrap();
        assert_eq!(parsed.points, 30);
    }
}
