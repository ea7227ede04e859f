//! Process inspection and signalling.
//!
//! Everything platform specific sits behind [`ProcessTable`] so the reaper
//! and supervisor only ever ask three questions: is this pid alive, which
//! pids descend from it, and deliver this signal.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, Signal, System};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signals the supervisor sends to agent processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the agent to abort its current turn.
    Interrupt,
    /// Graceful shutdown request.
    Terminate,
    /// Forced kill.
    Kill,
}

/// Narrow view of the operating system's process table.
pub trait ProcessTable: Send + Sync {
    /// Whether `pid` names a running (non-zombie) process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Every transitive descendant of `pid`, parents before children.
    fn descendants_of(&self, pid: u32) -> Vec<u32>;

    /// Deliver `signal` to `pid`; `false` if the process was not found or
    /// the signal could not be sent.
    fn signal(&self, pid: u32, signal: ProcessSignal) -> bool;
}

/// [`ProcessTable`] backed by `sysinfo`.
#[derive(Debug)]
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcessTable {
    /// Create an empty table; every query refreshes what it needs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let sys_pid = Pid::from_u32(pid);
        if !system.refresh_process(sys_pid) {
            return false;
        }
        system.process(sys_pid).is_some_and(|process| {
            !matches!(
                process.status(),
                ProcessStatus::Zombie | ProcessStatus::Dead
            )
        })
    }

    fn descendants_of(&self, pid: u32) -> Vec<u32> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes();

        let parent_pairs = system.processes().iter().filter_map(|(child, process)| {
            process
                .parent()
                .map(|parent| (parent.as_u32(), child.as_u32()))
        });
        descendants_from_pairs(pid, parent_pairs)
    }

    fn signal(&self, pid: u32, signal: ProcessSignal) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let sys_pid = Pid::from_u32(pid);
        if !system.refresh_process(sys_pid) {
            return false;
        }
        let Some(process) = system.process(sys_pid) else {
            return false;
        };
        match signal {
            ProcessSignal::Interrupt => process.kill_with(Signal::Interrupt).unwrap_or(false),
            ProcessSignal::Terminate => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
            ProcessSignal::Kill => process.kill(),
        }
    }
}

/// Breadth-first walk over `(parent, child)` pairs starting at `root`.
///
/// The root itself is never included, and cycles in a corrupt table do not
/// loop forever.
pub fn descendants_from_pairs<I>(root: u32, pairs: I) -> Vec<u32>
where
    I: IntoIterator<Item = (u32, u32)>,
{
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (parent, child) in pairs {
        if parent != child {
            children.entry(parent).or_default().push(child);
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    let mut out = Vec::new();
    while let Some(current) = queue.pop_front() {
        for &child in children.get(&current).map_or(&[][..], Vec::as_slice) {
            if seen.insert(child) {
                out.push(child);
                queue.push_back(child);
            }
        }
    }
    out
}

/// Send a graceful terminate to `pid` and all of its descendants.
///
/// Descendants are enumerated before anything is signalled, while they are
/// still parented under `pid`. Returns every pid that was targeted.
pub fn terminate_tree(table: &dyn ProcessTable, pid: u32) -> Vec<u32> {
    let mut targets = vec![pid];
    targets.extend(table.descendants_of(pid));

    for &target in &targets {
        if table.signal(target, ProcessSignal::Terminate) {
            debug!(pid = target, "sent terminate");
        } else {
            debug!(pid = target, "terminate not delivered, process likely gone");
        }
    }
    targets
}

/// Force-kill `pid` and all of its descendants without a grace period.
///
/// Returns every pid that was targeted.
pub fn kill_tree(table: &dyn ProcessTable, pid: u32) -> Vec<u32> {
    let mut targets = vec![pid];
    targets.extend(table.descendants_of(pid));

    for &target in &targets {
        if table.signal(target, ProcessSignal::Kill) {
            debug!(pid = target, "sent kill");
        }
    }
    targets
}

/// After `delay`, force-kill every pid in `pids` that is still alive.
///
/// Fire-and-forget: the returned handle may be dropped. `on_killed` is called
/// with the pids that actually received a forced kill, only if non-empty.
pub fn schedule_force_kill<F>(
    table: Arc<dyn ProcessTable>,
    pids: Vec<u32>,
    delay: Duration,
    on_killed: F,
) -> JoinHandle<()>
where
    F: FnOnce(Vec<u32>) + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        let survivors: Vec<u32> = pids
            .into_iter()
            .filter(|&pid| table.is_alive(pid))
            .collect();
        if survivors.is_empty() {
            debug!("all targeted processes exited before escalation");
            return;
        }

        let mut killed = Vec::with_capacity(survivors.len());
        for pid in survivors {
            if table.signal(pid, ProcessSignal::Kill) {
                killed.push(pid);
            } else {
                warn!(pid, "forced kill failed");
            }
        }

        if !killed.is_empty() {
            info!(pids = ?killed, "escalated to forced kill");
            on_killed(killed);
        }
    })
}
