//! Verbose wire log for API calls.
//!
//! Every value written here goes through [`redact`] first, so bearer tokens
//! and credential-looking strings never reach the log.

use log::{info, warn};
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

const REDACTED: &str = "[REDACTED]";
const SENSITIVE_WORDS: [&str; 4] = ["password", "secret", "token", "key"];

enum Sink {
    Log,
    File(File),
}

/// Optional per-request diagnostics. Disabled unless verbose mode is on.
pub struct Diagnostics {
    sink: Option<Mutex<Sink>>,
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Diagnostics {
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Enables diagnostics when `verbose` is set. Lines go to `log_file`
    /// (appended, created with owner-only permissions) or, when no file is
    /// given or it cannot be opened, to the `log` facade.
    pub fn new(verbose: bool, log_file: Option<&Path>) -> Self {
        if !verbose {
            return Self::disabled();
        }
        let sink = match log_file {
            Some(path) => match open_log_file(path) {
                Ok(file) => Sink::File(file),
                Err(e) => {
                    warn!(
                        "Cannot open verbose log {}: {}; logging to the default logger",
                        path.display(),
                        e
                    );
                    Sink::Log
                }
            },
            None => Sink::Log,
        };
        Self {
            sink: Some(Mutex::new(sink)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn request_started(&self, method: &Method, path: &str) {
        self.write(|| format!("--> {} {}", method, redact(path)));
    }

    pub fn response_received(
        &self,
        method: &Method,
        path: &str,
        status: StatusCode,
        elapsed: Duration,
    ) {
        self.write(|| {
            format!(
                "<-- {} {} status={} duration={:?}",
                method,
                redact(path),
                status.as_u16(),
                elapsed
            )
        });
    }

    pub fn request_failed(&self, method: &Method, path: &str, error: &anyhow::Error) {
        self.write(|| {
            format!(
                "<!! {} {} error={}",
                method,
                redact(path),
                redact_error(error)
            )
        });
    }

    fn write(&self, line: impl FnOnce() -> String) {
        let Some(sink) = &self.sink else {
            return;
        };
        let line = line();
        let mut sink = sink.lock();
        if let Sink::File(file) = &mut *sink {
            let stamp = chrono::Local::now().format("%Y/%m/%d %H:%M:%S%.6f");
            match writeln!(file, "[port-client] {} {}", stamp, line) {
                Ok(()) => return,
                Err(e) => {
                    warn!("Cannot write verbose log: {}; logging to the default logger", e);
                    *sink = Sink::Log;
                }
            }
        }
        info!(target: "port_client::wire", "{}", line);
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Hides values that look like credentials.
pub fn redact(value: &str) -> Cow<'_, str> {
    if value.starts_with("Bearer ") && value.len() > 20 {
        return Cow::Borrowed("Bearer [REDACTED]");
    }
    let lower = value.to_lowercase();
    if SENSITIVE_WORDS.iter().any(|w| lower.contains(w)) {
        return Cow::Borrowed(REDACTED);
    }
    Cow::Borrowed(value)
}

/// Error text, unless it might carry a credential.
pub fn redact_error(error: &anyhow::Error) -> String {
    let text = format!("{:#}", error);
    let lower = text.to_lowercase();
    if text.contains("Bearer ") || lower.contains("secret") || lower.contains("token") {
        "[REDACTED: error may contain sensitive data]".to_string()
    } else {
        text
    }
}
