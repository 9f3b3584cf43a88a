//! Tracing setup for client sessions.
//!
//! The runtime logs frame traffic at trace, message routing at debug, and
//! lifecycle transitions at info. This module decides once, at startup,
//! where those lines go: stderr for interactive use, or an append-only
//! session log when the client is embedded in a host whose stderr is spoken
//! for. The server's own stdio is never touched; it carries the protocol.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Errors raised while installing the subscriber
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("could not open session log: {0}")]
    Io(#[from] io::Error),

    #[error("invalid log filter: {0}")]
    BadFilter(String),
}

/// Where log lines are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogSink {
    /// Stderr (the default)
    #[default]
    Stderr,
    /// Append to a session log file
    File(PathBuf),
}

/// Log output settings for one client process.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// `tracing` filter directive, e.g. `info` or `lsp_conduit=debug`
    pub filter: String,

    pub sink: LogSink,

    /// Emit JSON lines instead of the human-readable format
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            sink: LogSink::Stderr,
            json: false,
        }
    }
}

impl LogOptions {
    /// Build options from the environment.
    ///
    /// `LSP_CONDUIT_LOG` sets the filter (falling back to `RUST_LOG`),
    /// `LSP_CONDUIT_LOG_FILE` redirects output into a file, and
    /// `LSP_CONDUIT_LOG_JSON=1` switches to JSON lines.
    pub fn from_env() -> Self {
        let filter = std::env::var("LSP_CONDUIT_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());
        let sink = match std::env::var("LSP_CONDUIT_LOG_FILE") {
            Ok(path) => LogSink::File(PathBuf::from(path)),
            Err(_) => LogSink::Stderr,
        };
        let json = matches!(
            std::env::var("LSP_CONDUIT_LOG_JSON").as_deref(),
            Ok("1") | Ok("true")
        );
        Self { filter, sink, json }
    }

    /// Log into `dir`, in a file named after the server being driven and
    /// this process, e.g. `rust-analyzer.4217.log`.
    ///
    /// Several clients (or several runs) can then share one log directory
    /// without clobbering each other.
    pub fn session_file(mut self, dir: &Path, server_command: &str) -> Self {
        let server = Path::new(server_command)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "server".to_string());
        self.sink = LogSink::File(dir.join(format!("{}.{}.log", server, std::process::id())));
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }
}

/// Install the global subscriber described by `options`.
///
/// Call once, before the first client is constructed. Session-log output is
/// always ANSI-free; JSON and human formats are available on either sink.
pub fn init(options: LogOptions) -> Result<(), LogError> {
    let filter = EnvFilter::try_new(&options.filter)
        .map_err(|e| LogError::BadFilter(format!("{}: {e}", options.filter)))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match options.sink {
        LogSink::Stderr => {
            let builder = builder.with_writer(io::stderr);
            if options.json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
        LogSink::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let builder = builder.with_writer(Arc::new(file)).with_ansi(false);
            if options.json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_stderr_at_info() {
        let options = LogOptions::default();
        assert_eq!(options.filter, "info");
        assert_eq!(options.sink, LogSink::Stderr);
        assert!(!options.json);
    }

    #[test]
    fn session_file_is_named_after_the_server() {
        let options = LogOptions::default()
            .session_file(Path::new("/var/log/lsp"), "/usr/local/bin/rust-analyzer");

        let expected = format!("rust-analyzer.{}.log", std::process::id());
        assert_eq!(
            options.sink,
            LogSink::File(PathBuf::from("/var/log/lsp").join(expected))
        );
    }

    #[test]
    fn builders_compose() {
        let options = LogOptions::default().filter("lsp_conduit=trace").json();
        assert_eq!(options.filter, "lsp_conduit=trace");
        assert!(options.json);
        assert_eq!(options.sink, LogSink::Stderr);
    }

    #[test]
    fn from_env_reads_sink_and_format() {
        unsafe {
            std::env::set_var("LSP_CONDUIT_LOG", "debug");
            std::env::set_var("LSP_CONDUIT_LOG_FILE", "/tmp/session.log");
            std::env::set_var("LSP_CONDUIT_LOG_JSON", "1");
        }

        let options = LogOptions::from_env();
        assert_eq!(options.filter, "debug");
        assert_eq!(options.sink, LogSink::File(PathBuf::from("/tmp/session.log")));
        assert!(options.json);

        unsafe {
            std::env::remove_var("LSP_CONDUIT_LOG");
            std::env::remove_var("LSP_CONDUIT_LOG_FILE");
            std::env::remove_var("LSP_CONDUIT_LOG_JSON");
        }
    }
}
