//! Logger initialization for the server.

use std::{fmt::Write as _, io::IsTerminal, str::FromStr, sync::Once};

use jiff::Timestamp;
use logforth::{append::Stderr, filter::EnvFilter, layout::Layout};

static INIT: Once = Once::new();

/// One line per record: RFC 3339 UTC timestamp, lowercase level, the
/// emitting module, then the message.
///
/// ```text
/// 2026-08-01T12:34:56.789Z  info server: Prism 0.1.0
/// ```
#[derive(Debug)]
struct LineLayout {
    color: bool,
}

impl LineLayout {
    /// Level names padded to a common width so messages line up.
    fn level_name(&self, level: log::Level) -> &'static str {
        match (level, self.color) {
            (log::Level::Error, false) => "error",
            (log::Level::Warn, false) => " warn",
            (log::Level::Info, false) => " info",
            (log::Level::Debug, false) => "debug",
            (log::Level::Trace, false) => "trace",
            (log::Level::Error, true) => "\x1b[1;31merror\x1b[0m",
            (log::Level::Warn, true) => "\x1b[33m warn\x1b[0m",
            (log::Level::Info, true) => "\x1b[32m info\x1b[0m",
            (log::Level::Debug, true) => "\x1b[36mdebug\x1b[0m",
            (log::Level::Trace, true) => "\x1b[2mtrace\x1b[0m",
        }
    }
}

impl Layout for LineLayout {
    fn format(
        &self,
        record: &log::Record<'_>,
        _diagnostics: &[Box<dyn logforth::diagnostic::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let mut line = String::new();

        // Timestamp's Display is already RFC 3339 in UTC.
        write!(line, "{} {} ", Timestamp::now(), self.level_name(record.level()))?;

        if let Some(module) = record.module_path() {
            write!(line, "{module}: ")?;
        }

        write!(line, "{}", record.args())?;

        Ok(line.into_bytes())
    }
}

/// Initialize the logger. The log_filter should be a string like "info" or
/// "server=debug,gateway=debug".
pub fn init(log_filter: &str) {
    let log_filter = log_filter.to_owned();

    INIT.call_once(move || {
        logforth::builder()
            .dispatch(move |d| {
                let filter = EnvFilter::from_str(&log_filter)
                    .unwrap_or_else(|_| EnvFilter::from_str("info").expect("default filter should be valid"));

                let layout = LineLayout {
                    color: std::io::stderr().is_terminal(),
                };

                d.filter(filter).append(Stderr::default().with_layout(layout))
            })
            .apply();
    });
}
