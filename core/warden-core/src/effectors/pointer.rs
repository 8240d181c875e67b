//! Pointer inversion: every movement the user makes is mirrored back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::Capability;
use crate::error::{Result, WardenError};
use crate::escalation::Effect;
use crate::exec;

/// Minimal pointer primitive.
pub trait Pointer: Send + Sync {
    fn position(&self) -> Result<(i32, i32)>;
    fn warp(&self, x: i32, y: i32) -> Result<()>;
}

struct Sampler {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Samples the pointer at a fixed interval and moves it opposite to the
/// user's motion: `new = current - delta * gain`.
pub struct PointerInversion {
    pointer: Arc<dyn Pointer>,
    interval: Duration,
    gain: f64,
    sampler: Mutex<Option<Sampler>>,
}

impl PointerInversion {
    pub fn new(pointer: Arc<dyn Pointer>, interval: Duration, gain: f64) -> Self {
        Self {
            pointer,
            interval,
            gain,
            sampler: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.sampler
            .lock()
            .map(|sampler| sampler.is_some())
            .unwrap_or(false)
    }
}

/// Where the pointer goes after moving from `last` to `current`.
pub fn mirrored(last: (i32, i32), current: (i32, i32), gain: f64) -> (i32, i32) {
    let dx = f64::from(current.0 - last.0);
    let dy = f64::from(current.1 - last.1);
    (
        (f64::from(current.0) - dx * gain).round() as i32,
        (f64::from(current.1) - dy * gain).round() as i32,
    )
}

fn sample_loop(pointer: Arc<dyn Pointer>, interval: Duration, gain: f64, stop: Arc<AtomicBool>) {
    let mut last = match pointer.position() {
        Ok(position) => position,
        Err(err) => {
            warn!(error = %err, "Pointer inversion could not read the pointer");
            return;
        }
    };
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(interval);
        let current = match pointer.position() {
            Ok(position) => position,
            Err(err) => {
                debug!(error = %err, "Pointer sample failed");
                continue;
            }
        };
        if current == last {
            continue;
        }
        let target = mirrored(last, current, gain);
        if let Err(err) = pointer.warp(target.0, target.1) {
            debug!(error = %err, "Pointer warp failed");
            last = current;
            continue;
        }
        last = target;
    }
}

impl Capability for PointerInversion {
    fn activate(&self) -> Result<()> {
        let mut sampler = self
            .sampler
            .lock()
            .map_err(|_| WardenError::effector(Effect::PointerInversion, "sampler lock poisoned"))?;
        if sampler.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("pointer-inversion".to_string())
            .spawn({
                let pointer = Arc::clone(&self.pointer);
                let stop = Arc::clone(&stop);
                let (interval, gain) = (self.interval, self.gain);
                move || sample_loop(pointer, interval, gain, stop)
            })
            .map_err(|err| WardenError::effector(Effect::PointerInversion, err.to_string()))?;
        *sampler = Some(Sampler { stop, handle });
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        let sampler = self
            .sampler
            .lock()
            .map_err(|_| WardenError::effector(Effect::PointerInversion, "sampler lock poisoned"))?
            .take();
        if let Some(sampler) = sampler {
            sampler.stop.store(true, Ordering::SeqCst);
            let _ = sampler.handle.join();
        }
        Ok(())
    }
}

impl Drop for PointerInversion {
    fn drop(&mut self) {
        let _ = self.deactivate();
    }
}

/// X11 pointer through `xdotool`.
pub struct XdotoolPointer;

impl XdotoolPointer {
    /// Available only inside an X11 session.
    pub fn detect() -> Option<Self> {
        if cfg!(target_os = "linux") && std::env::var_os("DISPLAY").is_some() {
            Some(Self)
        } else {
            None
        }
    }
}

const XDOTOOL_TIMEOUT: Duration = Duration::from_secs(2);

impl Pointer for XdotoolPointer {
    fn position(&self) -> Result<(i32, i32)> {
        let argv = ["xdotool", "getmouselocation", "--shell"].map(String::from);
        let output = exec::run_checked(&argv, XDOTOOL_TIMEOUT)?;
        let mut x = None;
        let mut y = None;
        for line in output.stdout.lines() {
            if let Some(value) = line.strip_prefix("X=") {
                x = value.trim().parse().ok();
            } else if let Some(value) = line.strip_prefix("Y=") {
                y = value.trim().parse().ok();
            }
        }
        x.zip(y).ok_or_else(|| {
            WardenError::effector(Effect::PointerInversion, "unexpected xdotool output")
        })
    }

    fn warp(&self, x: i32, y: i32) -> Result<()> {
        let argv = vec![
            "xdotool".to_string(),
            "mousemove".to_string(),
            "--".to_string(),
            x.max(0).to_string(),
            y.max(0).to_string(),
        ];
        exec::run_checked(&argv, XDOTOOL_TIMEOUT).map(|_| ())
    }
}
