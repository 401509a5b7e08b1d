// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! Shared utilities for the end-to-end tests.
//!
//! Every test gets its own daemon with a private config, manifest and
//! discovery socket under a temp directory, so tests can run in parallel.
//! Daemon and runner hosts share the daemon's stdout/stderr; both streams are
//! collected line by line and can be awaited with [`DaemonHandle::wait_for_log`].
//! When the handle is dropped while the test panics, the captured lines are
//! printed to help debug the failure.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const DAEMON_BINARY: &str = env!("CARGO_BIN_EXE_ctlplaned");
pub const RUNNER_BINARY: &str = env!("CARGO_BIN_EXE_ctlplane-runner");

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

pub struct DaemonHandle {
    child: Child,
    dir: tempfile::TempDir,
    lines: Arc<Mutex<Vec<String>>>,
}

impl DaemonHandle {
    /// Start a daemon running `manifest`. `extra_config` is appended to the
    /// generated YAML config.
    pub fn start(manifest: &str, extra_config: &str) -> Self {
        Self::start_with_env(manifest, extra_config, &[])
    }

    pub fn start_with_env(manifest: &str, extra_config: &str, env: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manifest_path = dir.path().join("manifest.yaml");
        std::fs::write(&manifest_path, manifest).expect("write manifest");

        let config = format!(
            "log_level: debug\n\
             manifest: {manifest}\n\
             discovery:\n  socket: {socket}\n\
             supervisor:\n  stop_timeout_secs: 5\n  readiness_timeout_secs: 15\n  runner:\n    command: {runner}\n\
             {extra_config}\n",
            manifest = manifest_path.display(),
            socket = dir.path().join("run").join("discovery.sock").display(),
            runner = RUNNER_BINARY,
        );
        let config_path = dir.path().join("ctlplane.yaml");
        std::fs::write(&config_path, config).expect("write config");

        let mut cmd = Command::new(DAEMON_BINARY);
        cmd.arg("--config")
            .arg(&config_path)
            .env_remove("CTLPLANE_CONFIG")
            .env_remove("CTLPLANE_MANIFEST")
            .env_remove("CTLPLANE_DISCOVERY_SOCKET")
            .env_remove("CTLPLANE_RUNNER_COMMAND")
            .env_remove("CTLPLANE_LOG_LEVEL")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }
        let mut child = cmd.spawn().expect("spawn ctlplaned");

        let lines = Arc::new(Mutex::new(Vec::new()));
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        collect_lines(stdout, lines.clone());
        collect_lines(stderr, lines.clone());

        Self { child, dir, lines }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn discovery_socket(&self) -> PathBuf {
        self.dir.path().join("run").join("discovery.sock")
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn logs(&self) -> Vec<String> {
        self.lines.lock().expect("log lock").clone()
    }

    pub fn has_log(&self, pattern: &str) -> bool {
        let re = Regex::new(pattern).expect("valid pattern");
        self.logs().iter().any(|l| re.is_match(l))
    }

    /// Wait for a line matching `pattern` and return it.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> String {
        let re = Regex::new(pattern).expect("valid pattern");
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.logs().into_iter().find(|l| re.is_match(l)) {
                return line;
            }
            assert!(
                Instant::now() < deadline,
                "no log line matching {pattern:?} within {timeout:?}"
            );
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Pid of instance `name`, from its spawn log line.
    pub fn runner_pid(&self, name: &str) -> i32 {
        let pattern = format!(r"\[{}\] spawned \(pid=(\d+)", regex::escape(name));
        let line = self.wait_for_log(&pattern, STARTUP_TIMEOUT);
        let re = Regex::new(&pattern).expect("valid pattern");
        re.captures(&line).expect("pid capture")[1]
            .parse()
            .expect("numeric pid")
    }

    pub fn signal(&self, sig: Signal) {
        signal::kill(Pid::from_raw(self.pid() as i32), sig).expect("signal daemon");
    }

    /// Wait for the daemon to exit.
    pub fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().expect("try_wait daemon") {
                return status;
            }
            assert!(Instant::now() < deadline, "daemon still running after {timeout:?}");
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if thread::panicking() {
            eprintln!("\n========== CTLPLANED LOGS (test failed) ==========");
            for line in self.logs() {
                eprintln!("{line}");
            }
            eprintln!("==================================================\n");
        }
        if let Ok(None) = self.child.try_wait() {
            // Runner hosts follow once they notice the daemon is gone.
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn collect_lines<R: Read + Send + 'static>(stream: R, lines: Arc<Mutex<Vec<String>>>) {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            if let Ok(mut lines) = lines.lock() {
                lines.push(line);
            }
        }
    });
}
