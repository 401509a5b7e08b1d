// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! Process-wide logger shared by the control plane binaries.
//!
//! Lines look like
//! `2026-01-02 03:04:05 UTC | CTLPLANED | INFO | (src/supervisor.rs:42 in ctlplane::supervisor) | message`.
//! INFO and below go to stdout, WARN and ERROR to stderr. When a log file is
//! configured every line is appended to it as well.

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use time::OffsetDateTime;
use time::macros::format_description;

pub struct Logger {
    component: String,
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(component: &str, level: LevelFilter) -> Self {
        Self {
            component: component.to_uppercase(),
            level,
            file: None,
        }
    }

    /// Also append every line to `path`, creating it if needed.
    pub fn with_file(mut self, path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.file = Some(Mutex::new(file));
        Ok(self)
    }

    /// Install as the global `log` logger.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    fn format(&self, record: &Record<'_>) -> String {
        format_line(
            OffsetDateTime::now_utc(),
            &self.component,
            record.level(),
            record.file().unwrap_or("<unknown>"),
            record.line().unwrap_or(0),
            record.module_path().unwrap_or("<unknown>"),
            &record.args().to_string(),
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        // Write failures have nowhere to be reported.
        if record.level() <= Level::Warn {
            let _ = writeln!(io::stderr().lock(), "{line}");
        } else {
            let _ = writeln!(io::stdout().lock(), "{line}");
        }
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            let _ = writeln!(file, "{line}");
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            let _ = file.flush();
        }
    }
}

/// Install a stdout/stderr logger for `component` at `level`.
pub fn init(component: &str, level: LevelFilter) -> Result<(), SetLoggerError> {
    Logger::new(component, level).install()
}

/// Parse a configured level name. Unknown names fall back to `Info`.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

pub fn format_line(
    now: OffsetDateTime,
    component: &str,
    level: Level,
    file: &str,
    line: u32,
    module: &str,
    message: &str,
) -> String {
    let timestamp = now
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second] UTC"
        ))
        .unwrap_or_else(|_| "0000-00-00 00:00:00 UTC".to_string());
    format!("{timestamp} | {component} | {level} | ({file}:{line} in {module}) | {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use time::macros::datetime;

    #[test]
    fn test_format_line_layout() {
        let line = format_line(
            datetime!(2026-03-04 05:06:07 UTC),
            "CTLPLANED",
            Level::Info,
            "src/supervisor.rs",
            42,
            "ctlplane::supervisor",
            "[a] spawned (pid=10)",
        );
        assert_eq!(
            line,
            "2026-03-04 05:06:07 UTC | CTLPLANED | INFO | (src/supervisor.rs:42 in ctlplane::supervisor) | [a] spawned (pid=10)"
        );
    }

    #[test]
    fn test_format_line_matches_pattern() {
        let line = format_line(
            OffsetDateTime::now_utc(),
            "RUNNER",
            Level::Warn,
            "src/runner.rs",
            7,
            "ctlplane::runner",
            "parent lost",
        );
        let re = Regex::new(
            r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2} UTC \| RUNNER \| WARN \| \(src/runner\.rs:7 in ctlplane::runner\) \| parent lost$",
        )
        .unwrap();
        assert!(re.is_match(&line), "unexpected line: {line}");
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level(" WARN "), LevelFilter::Warn);
        assert_eq!(parse_level("warning"), LevelFilter::Warn);
        assert_eq!(parse_level("off"), LevelFilter::Off);
        assert_eq!(parse_level("bogus"), LevelFilter::Info);
    }

    #[test]
    fn test_component_is_uppercased() {
        let logger = Logger::new("ctlplaned", LevelFilter::Info);
        assert_eq!(logger.component, "CTLPLANED");
    }

    #[test]
    fn test_enabled_respects_level() {
        let logger = Logger::new("x", LevelFilter::Warn);
        let warn = Metadata::builder().level(Level::Warn).build();
        let info = Metadata::builder().level(Level::Info).build();
        assert!(logger.enabled(&warn));
        assert!(!logger.enabled(&info));
    }

    #[test]
    fn test_file_sink_receives_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctlplane.log");
        let logger = Logger::new("file", LevelFilter::Info)
            .with_file(&path)
            .unwrap();

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .file(Some("src/lib.rs"))
                .line(Some(1))
                .module_path(Some("ctlplane_log::tests"))
                .args(format_args!("hello file"))
                .build(),
        );
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("| FILE | INFO |"), "got: {contents}");
        assert!(contents.trim_end().ends_with("hello file"));
    }
}
