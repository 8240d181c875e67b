//! Panic reporting: a fault reaches tracing, the audit log and the OS event
//! log.

use tracing::error;
use warden_core::CoordinationStore;

const EVENT_SOURCE: &str = "warden-agent";

/// Routes panics to tracing, the audit log and the OS event log.
pub fn install_panic_hook(store: Option<CoordinationStore>) {
    std::panic::set_hook(Box::new(move |info| {
        let message = format!("Unhandled fault: {}", info);
        error!(panic = %info, "Agent panicked");
        if let Some(store) = &store {
            let _ = store.audit(&message);
        }
        report_to_event_log(&message);
    }));
}

#[cfg(unix)]
fn report_to_event_log(message: &str) {
    use std::ffi::CString;

    let (Ok(ident), Ok(format), Ok(text)) = (
        CString::new(EVENT_SOURCE),
        CString::new("%s"),
        CString::new(message.replace('\0', " ")),
    ) else {
        return;
    };
    unsafe {
        libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_USER);
        libc::syslog(libc::LOG_ERR, format.as_ptr(), text.as_ptr());
        libc::closelog();
    }
}

#[cfg(windows)]
fn report_to_event_log(message: &str) {
    let text: String = message.chars().take(1024).collect();
    let _ = std::process::Command::new("eventcreate")
        .args(["/T", "ERROR", "/ID", "1000", "/L", "APPLICATION", "/SO", EVENT_SOURCE, "/D"])
        .arg(text)
        .output();
}

#[cfg(not(any(unix, windows)))]
fn report_to_event_log(_message: &str) {}
