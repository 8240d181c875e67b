//! Screen capture through an external screenshot command.
//!
//! Acquiring pixels is left to the platform tool; this module only names
//! the files, runs the tool once per output and cleans up afterwards.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use fs_err as fs;
use tracing::{debug, warn};

use crate::error::{Result, WardenError};
use crate::exec;
use crate::tuning::CaptureTuning;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(15);
const DISCARD_ATTEMPTS: u32 = 3;
const DISCARD_PAUSE: Duration = Duration::from_millis(500);
const FULL_DESKTOP: &str = "desktop";

pub trait CaptureSource: Send {
    /// Captures every output into `folder`, returning the images in output order.
    fn capture(&self, folder: &Path) -> Result<CaptureBatch>;
}

/// Images taken together for one analysis. Owned by one pipeline call.
#[derive(Debug, Clone)]
pub struct CaptureBatch {
    pub images: Vec<PathBuf>,
    pub taken_at: DateTime<Local>,
}

impl CaptureBatch {
    pub fn new(images: Vec<PathBuf>, taken_at: DateTime<Local>) -> Self {
        Self { images, taken_at }
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Directory holding the images, used as the judge's working directory.
    pub fn folder(&self) -> Option<&Path> {
        self.images.first().and_then(|path| path.parent())
    }

    /// Deletes every image, retrying briefly. Failures are logged only.
    pub fn discard(self) {
        for path in &self.images {
            remove_with_retry(path, DISCARD_ATTEMPTS, DISCARD_PAUSE);
        }
    }
}

fn remove_with_retry(path: &Path, attempts: u32, pause: Duration) {
    for attempt in 1..=attempts {
        match fs::remove_file(path) {
            Ok(()) => return,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) if attempt == attempts => {
                warn!(error = %err, path = %path.display(), "Failed to delete screenshot");
            }
            Err(_) => thread::sleep(pause),
        }
    }
}

/// `Screenshot_<yyyyMMdd_HHmmss>_<output>.png`
pub fn screenshot_name(taken_at: DateTime<Local>, output: &str) -> String {
    let output: String = output
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!(
        "Screenshot_{}_{}.png",
        taken_at.format("%Y%m%d_%H%M%S"),
        output
    )
}

/// Runs an argv template once per output. `{path}` and `{output}` are substituted.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    template: Vec<String>,
    outputs: Vec<String>,
}

impl CommandCapture {
    pub fn new(template: Vec<String>, outputs: Vec<String>) -> Self {
        Self { template, outputs }
    }

    pub fn from_tuning(tuning: &CaptureTuning) -> Self {
        let template = tuning
            .command
            .clone()
            .filter(|argv| !argv.is_empty())
            .unwrap_or_else(|| default_template(!tuning.outputs.is_empty()));
        Self::new(template, tuning.outputs.clone())
    }

    fn argv_for(&self, path: &Path, output: &str) -> Vec<String> {
        let path = path.to_string_lossy();
        self.template
            .iter()
            .map(|arg| arg.replace("{path}", &path).replace("{output}", output))
            .collect()
    }
}

impl CaptureSource for CommandCapture {
    fn capture(&self, folder: &Path) -> Result<CaptureBatch> {
        fs::create_dir_all(folder)
            .map_err(|err| WardenError::io("Failed to create capture folder", err))?;

        let taken_at = Local::now();
        let outputs: Vec<&str> = if self.outputs.is_empty() {
            vec![FULL_DESKTOP]
        } else {
            self.outputs.iter().map(String::as_str).collect()
        };

        let mut images = Vec::with_capacity(outputs.len());
        let mut last_error = None;
        for output in outputs {
            let path = folder.join(screenshot_name(taken_at, output));
            match exec::run_checked(&self.argv_for(&path, output), CAPTURE_TIMEOUT) {
                Ok(_) if path.exists() => images.push(path),
                Ok(_) => debug!(output, "Capture command produced no file"),
                Err(err) => {
                    warn!(error = %err, output, "Capture command failed");
                    last_error = Some(err);
                }
            }
        }

        if images.is_empty() {
            let details = last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no screenshot was written".to_string());
            return Err(WardenError::CaptureFailed(details));
        }
        Ok(CaptureBatch::new(images, taken_at))
    }
}

#[cfg(target_os = "linux")]
fn default_template(per_output: bool) -> Vec<String> {
    let wayland = std::env::var_os("WAYLAND_DISPLAY").is_some();
    let argv: &[&str] = match (wayland, per_output) {
        (true, true) => &["grim", "-o", "{output}", "{path}"],
        (true, false) => &["grim", "{path}"],
        (false, _) => &["import", "-window", "root", "{path}"],
    };
    argv.iter().map(|s| s.to_string()).collect()
}

#[cfg(target_os = "macos")]
fn default_template(per_output: bool) -> Vec<String> {
    let argv: &[&str] = if per_output {
        &["screencapture", "-x", "-D", "{output}", "{path}"]
    } else {
        &["screencapture", "-x", "{path}"]
    };
    argv.iter().map(|s| s.to_string()).collect()
}

#[cfg(windows)]
fn default_template(_per_output: bool) -> Vec<String> {
    const SCRIPT: &str = "Add-Type -AssemblyName System.Windows.Forms,System.Drawing; \
        $b = [System.Windows.Forms.SystemInformation]::VirtualScreen; \
        $bmp = New-Object System.Drawing.Bitmap $b.Width, $b.Height; \
        $g = [System.Drawing.Graphics]::FromImage($bmp); \
        $g.CopyFromScreen($b.Location, [System.Drawing.Point]::Empty, $b.Size); \
        $bmp.Save('{path}')";
    vec![
        "powershell".to_string(),
        "-NoProfile".to_string(),
        "-Command".to_string(),
        SCRIPT.to_string(),
    ]
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn default_template(_per_output: bool) -> Vec<String> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn names_follow_timestamp_pattern() {
        let taken_at = Local.with_ymd_and_hms(2026, 1, 30, 9, 5, 7).earliest().unwrap();
        assert_eq!(
            screenshot_name(taken_at, "HDMI-A-1"),
            "Screenshot_20260130_090507_HDMI-A-1.png"
        );
        assert_eq!(
            screenshot_name(taken_at, "\\\\.\\DISPLAY1"),
            "Screenshot_20260130_090507_____DISPLAY1.png"
        );
    }

    #[test]
    fn discard_removes_images_and_tolerates_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let first = temp_dir.path().join("a.png");
        let second = temp_dir.path().join("b.png");
        fs::write(&first, b"png").unwrap();
        let batch = CaptureBatch::new(vec![first.clone(), second], Local::now());
        assert_eq!(batch.folder(), Some(temp_dir.path()));
        batch.discard();
        assert!(!first.exists());
    }

    #[cfg(unix)]
    #[test]
    fn command_capture_runs_once_per_output() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let capture = CommandCapture::new(
            vec!["sh".into(), "-c".into(), "printf {output} > '{path}'".into()],
            vec!["left".into(), "right".into()],
        );
        let batch = capture.capture(temp_dir.path()).expect("capture");
        assert_eq!(batch.images.len(), 2);
        assert!(batch.images[0].to_string_lossy().ends_with("_left.png"));
        assert_eq!(fs::read_to_string(&batch.images[1]).unwrap(), "right");
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_capture_failure() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let capture = CommandCapture::new(vec!["false".into()], Vec::new());
        assert!(matches!(
            capture.capture(temp_dir.path()),
            Err(WardenError::CaptureFailed(_))
        ));
    }
}
