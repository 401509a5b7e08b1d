// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

//! Parent-liveness monitoring for runner hosts.
//!
//! A runner host polls whether its supervisor is still alive and shuts itself
//! down once it is not, so killing the supervisor never leaves orphans.

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::{Pid, getppid};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub trait ParentLivenessProbe: Send + Sync {
    fn is_parent_alive(&self) -> bool;
}

impl ParentLivenessProbe for Box<dyn ParentLivenessProbe> {
    fn is_parent_alive(&self) -> bool {
        self.as_ref().is_parent_alive()
    }
}

/// Dead once this process has been re-parented.
#[derive(Debug, Clone, Copy)]
pub struct ParentProbe {
    parent: Pid,
}

impl ParentProbe {
    pub fn new() -> Self {
        Self { parent: getppid() }
    }

    pub fn parent_pid(&self) -> u32 {
        self.parent.as_raw().unsigned_abs()
    }
}

impl Default for ParentProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ParentLivenessProbe for ParentProbe {
    fn is_parent_alive(&self) -> bool {
        // pid 1 as the original parent means we were never supervised.
        if self.parent.as_raw() <= 1 {
            return false;
        }
        getppid() == self.parent && pid_exists(self.parent)
    }
}

/// Watches an arbitrary pid.
#[derive(Debug, Clone, Copy)]
pub struct PidProbe {
    pid: Pid,
}

impl PidProbe {
    pub fn new(pid: u32) -> Self {
        Self {
            pid: Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX)),
        }
    }
}

impl ParentLivenessProbe for PidProbe {
    fn is_parent_alive(&self) -> bool {
        self.pid.as_raw() > 0 && pid_exists(self.pid)
    }
}

fn pid_exists(pid: Pid) -> bool {
    match signal::kill(pid, None::<signal::Signal>) {
        Ok(()) => true,
        // Exists but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Pick the best probe for a supervisor pid handed over at spawn time.
pub fn probe_for(supervisor_pid: u32) -> Box<dyn ParentLivenessProbe> {
    let probe = ParentProbe::new();
    if probe.parent_pid() == supervisor_pid {
        Box::new(probe)
    } else {
        debug!("supervisor pid {supervisor_pid} is not our parent, watching it directly");
        Box::new(PidProbe::new(supervisor_pid))
    }
}

/// Background poller that fires a callback once the parent is gone.
pub struct ParentMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ParentMonitor {
    /// Poll `probe` every `interval`. `on_parent_lost` runs at most once,
    /// on the first observation that the parent is gone.
    pub fn spawn<P, F>(probe: P, interval: Duration, on_parent_lost: F) -> Self
    where
        P: ParentLivenessProbe + 'static,
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !probe.is_parent_alive() {
                    break;
                }
            }
            // Disposal may race with the last tick.
            if token.is_cancelled() {
                return;
            }
            warn!("parent process is gone");
            on_parent_lost();
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop polling without running the callback.
    pub fn dispose(mut self) {
        self.cancel.cancel();
        self.task.take();
    }
}

impl Drop for ParentMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
