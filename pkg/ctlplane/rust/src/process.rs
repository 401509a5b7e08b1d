// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::config::RunnerCommand;
use crate::identity::{IDENTITY_ENV, RunnerIdentity};
use crate::state::{ChildStatus, FailureReason};
use log::{error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::SystemTime;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("[{name}] cannot serialize runner identity: {source:#}")]
    Identity {
        name: String,
        source: anyhow::Error,
    },
    #[error("[{name}] failed to spawn {command}: {source}")]
    Spawn {
        name: String,
        command: String,
        source: std::io::Error,
    },
}

/// Exit of a child, sent by its watcher task.
#[derive(Debug)]
pub struct ExitReport {
    pub index: usize,
    pub status: std::io::Result<ExitStatus>,
}

/// One runner host process and what we know about it.
#[derive(Debug)]
pub struct ManagedRunner {
    pub name: String,
    pub runner_type: String,
    pid: Option<u32>,
    started_at: SystemTime,
    status: ChildStatus,
    exited: bool,
    stop_requested: bool,
    force_killed: bool,
}

impl ManagedRunner {
    /// Spawn the runner command for `identity`. The child is handed to a
    /// watcher task that reports its exit on `exits` tagged with `index`.
    pub fn launch(
        index: usize,
        identity: &RunnerIdentity,
        command: &RunnerCommand,
        exits: UnboundedSender<ExitReport>,
    ) -> Result<Self, LaunchError> {
        let encoded = identity.encode().map_err(|source| LaunchError::Identity {
            name: identity.name.clone(),
            source,
        })?;

        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args)
            .envs(&command.env)
            .env(IDENTITY_ENV, encoded)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let started_at = SystemTime::now();
        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            name: identity.name.clone(),
            command: command.command.clone(),
            source,
        })?;
        let pid = child.id();
        info!(
            "[{}] spawned (pid={}, cmd={})",
            identity.name,
            pid.unwrap_or(0),
            command.command
        );

        tokio::spawn(async move {
            let status = child.wait().await;
            // The supervisor may be gone already.
            let _ = exits.send(ExitReport { index, status });
        });

        Ok(Self {
            name: identity.name.clone(),
            runner_type: identity.runner_type.clone(),
            pid,
            started_at,
            status: ChildStatus::Starting,
            exited: false,
            stop_requested: false,
            force_killed: false,
        })
    }

    /// Placeholder for an instance whose launch failed.
    pub fn launch_failed(identity: &RunnerIdentity) -> Self {
        Self {
            name: identity.name.clone(),
            runner_type: identity.runner_type.clone(),
            pid: None,
            started_at: SystemTime::now(),
            status: ChildStatus::Failed(FailureReason::LaunchFailed),
            exited: true,
            stop_requested: false,
            force_killed: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn status(&self) -> ChildStatus {
        self.status
    }

    pub fn is_discovery(&self) -> bool {
        self.runner_type == crate::DISCOVERY_RUNNER_TYPE
    }

    /// Whether the OS process may still exist, whatever its status says.
    pub fn has_process(&self) -> bool {
        !self.exited && self.pid.is_some()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Move to `next` if allowed. Failures are logged with their reason.
    pub fn transition(&mut self, next: ChildStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            ChildStatus::Failed(reason) => error!("[{}] failed: {reason}", self.name),
            ChildStatus::Running => info!("[{}] running", self.name),
            _ => info!("[{}] {next}", self.name),
        }
        true
    }

    /// Record the process exit and return the status it maps to, or `None`
    /// if the child was already in a terminal state.
    pub fn record_exit(&mut self, status: std::io::Result<ExitStatus>) -> Option<ChildStatus> {
        self.exited = true;
        let next = match status {
            Ok(status) => {
                info!("[{}] exited with {status}", self.name);
                let next = classify_exit(status, self.stop_requested, self.force_killed);
                match next {
                    // Leaving before readiness is a failure even with code 0.
                    ChildStatus::Exited(code)
                        if self.status == ChildStatus::Starting && !self.stop_requested =>
                    {
                        ChildStatus::Failed(FailureReason::ExitCode(code))
                    }
                    other => other,
                }
            }
            Err(e) => {
                warn!("[{}] lost track of the process: {e}", self.name);
                ChildStatus::Failed(FailureReason::ExitCode(-1))
            }
        };
        self.transition(next).then_some(next)
    }

    pub fn send_signal(&self, sig: Signal) {
        if !self.has_process() {
            return;
        }
        if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok())
            && let Err(e) = signal::kill(Pid::from_raw(pid), sig)
        {
            warn!("[{}] failed to send {sig}: {e}", self.name);
        }
    }

    pub fn terminate(&mut self) {
        if self.has_process() {
            self.stop_requested = true;
            info!("[{}] sending SIGTERM", self.name);
            self.send_signal(Signal::SIGTERM);
        }
    }

    pub fn kill(&mut self) {
        if self.has_process() {
            self.stop_requested = true;
            self.force_killed = true;
            info!("[{}] sending SIGKILL", self.name);
            self.send_signal(Signal::SIGKILL);
        }
    }

    /// Give up on a process that outlived SIGKILL.
    pub fn abandon(&mut self) {
        warn!("[{}] still running after SIGKILL, giving up", self.name);
        self.exited = true;
        self.transition(ChildStatus::Failed(FailureReason::ForceKilled));
    }
}

/// Map an exit status to a child status.
///
/// A stop we asked for is a clean exit: signal deaths are reported as
/// `128 + signal` like a shell would. A child we had to SIGKILL is
/// `ForceKilled`. Anything else is a failure unless the code is 0.
pub fn classify_exit(status: ExitStatus, stop_requested: bool, force_killed: bool) -> ChildStatus {
    if force_killed {
        return ChildStatus::Failed(FailureReason::ForceKilled);
    }
    match (status.code(), status.signal()) {
        (Some(code), _) if stop_requested => ChildStatus::Exited(code),
        (None, Some(sig)) if stop_requested => ChildStatus::Exited(128 + sig),
        (Some(0), _) => ChildStatus::Exited(0),
        (Some(code), _) => ChildStatus::Failed(FailureReason::ExitCode(code)),
        (None, Some(sig)) => ChildStatus::Failed(FailureReason::Signaled(sig)),
        (None, None) => ChildStatus::Failed(FailureReason::ExitCode(-1)),
    }
}
