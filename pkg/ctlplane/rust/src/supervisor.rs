// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::config::{ReadinessMode, SupervisorSettings};
use crate::discovery::{DiscoveryClient, DiscoveryError, RetryPolicy};
use crate::identity::RunnerIdentity;
use crate::manifest::InstanceDefinition;
use crate::process::{ExitReport, ManagedRunner};
use crate::state::{ChildStatus, FailureReason};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

const SIGKILL_TIMEOUT: Duration = Duration::from_secs(10);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Snapshot of one supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerHandle {
    pub name: String,
    pub runner_type: String,
    pub pid: Option<u32>,
    pub started_at: SystemTime,
    pub status: ChildStatus,
}

/// A status change caused by a child leaving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorEvent {
    pub name: String,
    pub status: ChildStatus,
}

/// Launches runner hosts, tracks them and stops them.
///
/// There are no restarts: a child that leaves stays gone until the daemon is
/// started again.
pub struct Supervisor {
    settings: SupervisorSettings,
    discovery: DiscoveryClient,
    probe: DiscoveryClient,
    runners: Vec<ManagedRunner>,
    exits_tx: UnboundedSender<ExitReport>,
    exits_rx: UnboundedReceiver<ExitReport>,
    pending: VecDeque<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, discovery: DiscoveryClient) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        // Readiness is polled, so one attempt per poll is enough.
        let probe = discovery
            .clone()
            .with_retry(RetryPolicy::none())
            .with_cache(0, Duration::ZERO);
        Self {
            settings,
            discovery,
            probe,
            runners: Vec::new(),
            exits_tx,
            exits_rx,
            pending: VecDeque::new(),
        }
    }

    /// Launch `entries`, discovery runners first, and wait for readiness.
    ///
    /// The discovery runner must be ready (or have failed) before its
    /// siblings are launched; the siblings then launch in order and become
    /// ready concurrently. A failed launch never stops the others.
    pub async fn start(&mut self, entries: &[InstanceDefinition]) -> Vec<RunnerHandle> {
        let (discovery, others): (Vec<_>, Vec<_>) =
            entries.iter().partition(|entry| entry.is_discovery());

        let first = self.launch_all(&discovery);
        self.await_readiness(first).await;
        if discovery
            .iter()
            .any(|d| self.find(&d.name).is_some_and(|r| r.status() != ChildStatus::Running))
        {
            warn!("discovery is not ready, launching the other instances anyway");
        }

        let rest = self.launch_all(&others);
        self.await_readiness(rest).await;
        self.handles()
    }

    pub fn handles(&self) -> Vec<RunnerHandle> {
        self.runners
            .iter()
            .map(|r| RunnerHandle {
                name: r.name.clone(),
                runner_type: r.runner_type.clone(),
                pid: r.pid(),
                started_at: r.started_at(),
                status: r.status(),
            })
            .collect()
    }

    /// Whether any child process may still be around.
    pub fn has_live_children(&self) -> bool {
        self.runners.iter().any(ManagedRunner::has_process)
    }

    /// Wait for the next child to leave. `None` once no child is left.
    pub async fn next_event(&mut self) -> Option<SupervisorEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if !self.has_live_children() {
                return None;
            }
            let report = self.exits_rx.recv().await?;
            self.handle_exit(report).await;
        }
    }

    /// Stop every child: the others first, the discovery runner last. Both
    /// groups share one `timeout` for SIGTERM; stragglers then get SIGKILL.
    pub async fn stop_all(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let (discovery, others): (Vec<usize>, Vec<usize>) = (0..self.runners.len())
            .partition(|&i| self.runners.get(i).is_some_and(ManagedRunner::is_discovery));
        self.stop_group(&others, deadline).await;
        self.stop_group(&discovery, deadline).await;

        for runner in &mut self.runners {
            if runner.status().is_alive() {
                runner.transition(ChildStatus::Exited(0));
            }
        }
        info!("all runner hosts stopped");
    }

    async fn stop_group(&mut self, indices: &[usize], deadline: Instant) {
        let live: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| self.has_process(i))
            .collect();
        if live.is_empty() {
            return;
        }
        for runner in self.select_mut(&live) {
            runner.terminate();
        }
        if self.wait_for_exits(&live, deadline).await {
            return;
        }

        for runner in self.select_mut(&live) {
            if runner.has_process() {
                warn!("[{}] stop timeout reached, sending SIGKILL", runner.name);
                runner.kill();
            }
        }
        if !self
            .wait_for_exits(&live, Instant::now() + SIGKILL_TIMEOUT)
            .await
        {
            for runner in self.select_mut(&live) {
                if runner.has_process() {
                    runner.abandon();
                }
            }
        }
    }

    fn has_process(&self, index: usize) -> bool {
        self.runners.get(index).is_some_and(ManagedRunner::has_process)
    }

    fn select_mut<'a>(
        &'a mut self,
        indices: &'a [usize],
    ) -> impl Iterator<Item = &'a mut ManagedRunner> + 'a {
        self.runners
            .iter_mut()
            .enumerate()
            .filter(move |(i, _)| indices.contains(i))
            .map(|(_, runner)| runner)
    }

    /// Process exit reports until every child in `indices` is gone or
    /// `deadline` passes. Returns whether they all left.
    async fn wait_for_exits(&mut self, indices: &[usize], deadline: Instant) -> bool {
        while indices.iter().any(|&i| self.has_process(i)) {
            match tokio::time::timeout_at(deadline, self.exits_rx.recv()).await {
                Ok(Some(report)) => self.handle_exit(report).await,
                Ok(None) | Err(_) => return false,
            }
        }
        true
    }

    fn launch_all(&mut self, entries: &[&InstanceDefinition]) -> Vec<usize> {
        let socket = self.discovery.socket().to_path_buf();
        let supervisor_pid = Some(std::process::id());
        let mut launched = Vec::with_capacity(entries.len());
        for entry in entries {
            let identity = RunnerIdentity::for_instance(entry, socket.clone(), supervisor_pid);
            let command = self
                .settings
                .command_for(&entry.runner_type)
                .clone()
                .resolve_sibling();
            let index = self.runners.len();
            match ManagedRunner::launch(index, &identity, &command, self.exits_tx.clone()) {
                Ok(runner) => {
                    self.runners.push(runner);
                    launched.push(index);
                }
                Err(e) => {
                    error!("{e}");
                    let runner = ManagedRunner::launch_failed(&identity);
                    self.pending.push_back(SupervisorEvent {
                        name: runner.name.clone(),
                        status: runner.status(),
                    });
                    self.runners.push(runner);
                }
            }
        }
        launched
    }

    async fn await_readiness(&mut self, indices: Vec<usize>) {
        if self.settings.readiness == ReadinessMode::Spawned {
            for runner in self.select_mut(&indices) {
                runner.transition(ChildStatus::Running);
            }
            return;
        }

        let deadline = Instant::now() + self.settings.readiness_timeout();
        loop {
            while let Ok(report) = self.exits_rx.try_recv() {
                self.handle_exit(report).await;
            }

            let mut waiting = 0;
            for &i in &indices {
                let Some(runner) = self.runners.get(i) else {
                    continue;
                };
                if runner.status() != ChildStatus::Starting {
                    continue;
                }
                if self.is_ready(runner).await {
                    if let Some(runner) = self.runners.get_mut(i) {
                        runner.transition(ChildStatus::Running);
                    }
                } else {
                    waiting += 1;
                }
            }
            if waiting == 0 {
                return;
            }

            if Instant::now() >= deadline {
                let failed = ChildStatus::Failed(FailureReason::ReadinessTimeout);
                let mut timed_out = Vec::new();
                for runner in self.select_mut(&indices) {
                    if runner.status() == ChildStatus::Starting {
                        runner.transition(failed);
                        timed_out.push(SupervisorEvent {
                            name: runner.name.clone(),
                            status: failed,
                        });
                    }
                }
                self.pending.extend(timed_out);
                return;
            }

            // Exits are picked up at the top of the loop.
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    async fn is_ready(&self, runner: &ManagedRunner) -> bool {
        if runner.is_discovery() {
            return self.probe.ping().await.is_ok();
        }
        match self.probe.lookup(&runner.name).await {
            // An older record belongs to a previous incarnation.
            Ok(record) => record.registered_at >= runner.started_at(),
            Err(DiscoveryError::UnknownService(_)) => false,
            Err(e) => {
                debug!("[{}] readiness check: {e}", runner.name);
                false
            }
        }
    }

    async fn handle_exit(&mut self, report: ExitReport) {
        let Some(runner) = self.runners.get_mut(report.index) else {
            return;
        };
        let unexpected = !runner.stop_requested();
        let Some(status) = runner.record_exit(report.status) else {
            return;
        };
        let name = runner.name.clone();
        let deregister = unexpected && !runner.is_discovery();
        // Queued first: the caller may drop us while deregistering.
        self.pending.push_back(SupervisorEvent {
            name: name.clone(),
            status,
        });
        if deregister {
            match self.probe.deregister(&name).await {
                Ok(true) => info!("[{name}] removed from discovery"),
                Ok(false) => {}
                Err(e) => debug!("[{name}] could not deregister: {e}"),
            }
        }
    }

    fn find(&self, name: &str) -> Option<&ManagedRunner> {
        self.runners.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerCommand;
    use crate::discovery::{AddressBook, DiscoveryServer};
    use crate::process::tests::sh;
    use std::path::Path;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn settings(readiness: ReadinessMode, runner: RunnerCommand) -> SupervisorSettings {
        SupervisorSettings {
            readiness,
            readiness_timeout_secs: 1,
            runner,
            ..SupervisorSettings::default()
        }
    }

    fn client(socket: &Path) -> DiscoveryClient {
        DiscoveryClient::new(socket).with_retry(RetryPolicy::none())
    }

    fn statuses(handles: &[RunnerHandle]) -> Vec<(&str, ChildStatus)> {
        handles.iter().map(|h| (h.name.as_str(), h.status)).collect()
    }

    #[tokio::test]
    async fn test_discovery_first_then_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(
            settings(ReadinessMode::Spawned, sh("exec sleep 60")),
            client(&dir.path().join("d.sock")),
        );
        let entries = vec![
            InstanceDefinition::new("A", "idle"),
            InstanceDefinition::new("discovery", crate::DISCOVERY_RUNNER_TYPE),
            InstanceDefinition::new("B", "idle"),
        ];
        let handles = sup.start(&entries).await;
        assert_eq!(
            statuses(&handles),
            vec![
                ("discovery", ChildStatus::Running),
                ("A", ChildStatus::Running),
                ("B", ChildStatus::Running),
            ]
        );
        assert!(handles[0].started_at <= handles[1].started_at);
        assert!(handles.iter().all(|h| h.pid.is_some()));

        sup.stop_all(Duration::from_secs(5)).await;
        assert!(sup.handles().iter().all(|h| h.status == ChildStatus::Exited(143)));
        assert!(!sup.has_live_children());
        assert_eq!(sup.next_event().await.map(|e| e.status), Some(ChildStatus::Exited(143)));
    }

    #[tokio::test]
    async fn test_launch_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings(ReadinessMode::Spawned, sh("exec sleep 60"));
        cfg.runners.insert(
            "broken".to_string(),
            RunnerCommand {
                command: "/nonexistent/runner".to_string(),
                ..RunnerCommand::default()
            },
        );
        let mut sup = Supervisor::new(cfg, client(&dir.path().join("d.sock")));
        let handles = sup
            .start(&[
                InstanceDefinition::new("bad", "broken"),
                InstanceDefinition::new("good", "idle"),
            ])
            .await;
        assert_eq!(
            statuses(&handles),
            vec![
                ("bad", ChildStatus::Failed(FailureReason::LaunchFailed)),
                ("good", ChildStatus::Running),
            ]
        );
        assert_eq!(
            sup.next_event().await,
            Some(SupervisorEvent {
                name: "bad".into(),
                status: ChildStatus::Failed(FailureReason::LaunchFailed),
            })
        );
        sup.stop_all(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_exit_codes_become_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings(ReadinessMode::Spawned, sh("sleep 0.2; exit 3"));
        cfg.runners.insert("clean".to_string(), sh("sleep 0.2; exit 0"));
        let mut sup = Supervisor::new(cfg, client(&dir.path().join("d.sock")));
        sup.start(&[
            InstanceDefinition::new("conflicted", "idle"),
            InstanceDefinition::new("done", "clean"),
        ])
        .await;

        let mut events = Vec::new();
        while let Some(event) = sup.next_event().await {
            events.push(event);
        }
        events.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            events,
            vec![
                SupervisorEvent {
                    name: "conflicted".into(),
                    status: ChildStatus::Failed(FailureReason::ExitCode(3)),
                },
                SupervisorEvent {
                    name: "done".into(),
                    status: ChildStatus::Exited(0),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_stubborn_child_is_force_killed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(
            settings(ReadinessMode::Spawned, sh("trap '' TERM; exec sleep 60")),
            client(&dir.path().join("d.sock")),
        );
        sup.start(&[InstanceDefinition::new("stubborn", "idle")]).await;
        sup.stop_all(Duration::from_millis(300)).await;
        assert_eq!(
            sup.handles()[0].status,
            ChildStatus::Failed(FailureReason::ForceKilled)
        );
        assert!(!sup.has_live_children());
    }

    #[tokio::test]
    async fn test_stop_all_shares_one_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(
            settings(ReadinessMode::Spawned, sh("trap '' TERM; exec sleep 60")),
            client(&dir.path().join("d.sock")),
        );
        sup.start(&[
            InstanceDefinition::new("discovery", crate::DISCOVERY_RUNNER_TYPE),
            InstanceDefinition::new("A", "idle"),
        ])
        .await;

        let timeout = Duration::from_secs(1);
        let started = Instant::now();
        sup.stop_all(timeout).await;
        let elapsed = started.elapsed();
        assert!(
            elapsed < timeout + Duration::from_millis(800),
            "stop_all took {elapsed:?}"
        );
        let killed = ChildStatus::Failed(FailureReason::ForceKilled);
        assert_eq!(
            statuses(&sup.handles()),
            vec![("discovery", killed), ("A", killed)]
        );
    }

    #[tokio::test]
    async fn test_exit_event_survives_dropped_wait() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        // Accepts connections but never answers, so deregistration hangs.
        let _silent = tokio::net::UnixListener::bind(&socket).unwrap();
        let mut sup = Supervisor::new(
            settings(ReadinessMode::Spawned, sh("sleep 0.1; exit 3")),
            client(&socket).with_request_timeout(Duration::from_secs(5)),
        );
        sup.start(&[InstanceDefinition::new("A", "idle")]).await;

        let dropped = tokio::time::timeout(Duration::from_millis(800), sup.next_event()).await;
        assert!(dropped.is_err(), "deregistration should still be pending");
        assert_eq!(
            sup.next_event().await,
            Some(SupervisorEvent {
                name: "A".into(),
                status: ChildStatus::Failed(FailureReason::ExitCode(3)),
            })
        );
        assert_eq!(sup.next_event().await, None);
    }

    #[tokio::test]
    async fn test_readiness_timeout_without_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(
            settings(ReadinessMode::Announced, sh("exec sleep 60")),
            client(&dir.path().join("missing.sock")),
        );
        let handles = sup
            .start(&[
                InstanceDefinition::new("discovery", crate::DISCOVERY_RUNNER_TYPE),
                InstanceDefinition::new("A", "idle"),
            ])
            .await;
        let timed_out = ChildStatus::Failed(FailureReason::ReadinessTimeout);
        assert_eq!(
            statuses(&handles),
            vec![("discovery", timed_out), ("A", timed_out)],
            "siblings launch even when discovery is not ready"
        );
        // Timed out children still get stopped.
        assert!(sup.has_live_children());
        sup.stop_all(Duration::from_secs(5)).await;
        assert!(!sup.has_live_children());
    }

    #[tokio::test]
    async fn test_announced_readiness_and_deregistration() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let book = Arc::new(AddressBook::new());
        let cancel = CancellationToken::new();
        let server = DiscoveryServer::bind(&socket, book.clone()).unwrap();
        tokio::spawn(server.serve(cancel.clone()));

        // A record from before the launch does not count.
        book.register("stale", "tcp://127.0.0.1:9".parse().unwrap());

        let mut cfg = settings(ReadinessMode::Announced, sh("sleep 1.5; exit 2"));
        cfg.runners.insert("discovery".to_string(), sh("exec sleep 60"));
        cfg.runners.insert("idle".to_string(), sh("exec sleep 60"));
        let mut sup = Supervisor::new(cfg, client(&socket));

        let announcer = {
            let book = book.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                book.register("A", "tcp://127.0.0.1:7001".parse().unwrap());
            })
        };
        let handles = sup
            .start(&[
                InstanceDefinition::new("discovery", crate::DISCOVERY_RUNNER_TYPE),
                InstanceDefinition::new("A", "flaky"),
                InstanceDefinition::new("stale", "idle"),
            ])
            .await;
        announcer.await.unwrap();
        assert_eq!(
            statuses(&handles),
            vec![
                ("discovery", ChildStatus::Running),
                ("A", ChildStatus::Running),
                ("stale", ChildStatus::Failed(FailureReason::ReadinessTimeout)),
            ]
        );

        // "stale" timed out during start; "A" exits on its own later.
        assert_eq!(
            sup.next_event().await.map(|e| e.name),
            Some("stale".to_string())
        );
        assert_eq!(
            sup.next_event().await,
            Some(SupervisorEvent {
                name: "A".into(),
                status: ChildStatus::Failed(FailureReason::ExitCode(2)),
            })
        );
        assert!(book.resolve("A").is_none(), "unexpected exit deregisters");

        sup.stop_all(Duration::from_secs(5)).await;
        cancel.cancel();
    }
}
