use crate::fold;
use crate::trace::{Call, Event, RetCode};
use indexmap::IndexMap;
use itertools::Itertools;
use log::debug;
use nix::unistd::Pid;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Syscalls whose duration is counted against the owning process.
pub const TRACKED_SYSCALLS: &[&str] = &[
    "open",
    "openat",
    "link",
    "unlink",
    "unlinkat",
    "getcwd",
    "chdir",
    "mkdir",
    "access",
    "faccessat",
    "lstat",
    "stat",
    "newfstatat",
    "statfs",
    "readlink",
    "mount",
    "read",
    "write",
    "connect",
    "socket",
    "bind",
    "setsockopt",
    "getsockopt",
    "getsockname",
    "getpeername",
    "sendmmsg",
    "recvmsg",
    "recvfrom",
    "sendto",
];

/// Count and total duration of one syscall within one process.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SyscallCounter {
    pub calls: u64,
    pub elapsed: f64,
}

impl SyscallCounter {
    fn add(&mut self, elapsed: f64) {
        self.calls += 1;
        self.elapsed += elapsed;
    }
}

pub type SyscallTable = IndexMap<String, SyscallCounter>;

/// One exec epoch of a process. `parent` indexes `Collapser::procs` and
/// always points at the live node for that pid, so a later exec there is
/// visible to descendants; `table` indexes `Collapser::tables`.
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: Pid,
    pub parent: Option<usize>,
    pub begin: f64,
    pub end: Option<f64>,
    pub retcode: Option<i64>,
    /// raw execve argument text; absent for tasks that never exec'd
    /// themselves (threads, accounted to their parent)
    pub args: Option<String>,
    /// time already credited to retired descendants
    pub child_samples: f64,
    pub table: usize,
}

/// Folds a stream of `Call`s into a forest of process epochs and renders one
/// folded-stack row per retired epoch plus one per syscall counter.
///
/// The flame-chart renderer expects sample counts; we approximate them by
/// emitting each epoch's self time in microseconds, which is why a child's
/// self time is subtracted from every ancestor.
#[derive(Debug, Default)]
pub struct Collapser {
    procs: Vec<Process>,
    tables: Vec<SyscallTable>,
    pmap: IndexMap<Pid, usize>,
    finished: Vec<usize>,
}

impl Collapser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pids of tasks that have been created and not yet exited.
    pub fn live_pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.pmap.keys().copied()
    }

    fn new_table(&mut self) -> usize {
        self.tables.push(SyscallTable::new());
        self.tables.len() - 1
    }

    fn spawn(&mut self, pid: Pid, parent: Option<usize>, begin: f64) -> usize {
        // until it execs, a child's syscalls accrue to its parent's table
        let table = match parent {
            Some(parent) => self.procs[parent].table,
            None => self.new_table(),
        };
        self.procs.push(Process {
            pid,
            parent,
            begin,
            end: None,
            retcode: None,
            args: None,
            child_samples: 0.0,
            table,
        });
        self.procs.len() - 1
    }

    /// Snapshot the epoch that led up to an exec and reset the live node:
    /// new begin, its own fresh syscall table, no credited children yet.
    /// Returns the snapshot for retirement.
    fn exec(&mut self, idx: usize, args: &str, ts: f64) -> usize {
        let mut old = self.procs[idx].clone();
        old.end = Some(ts);
        self.procs.push(old);
        let snapshot = self.procs.len() - 1;

        let table = self.new_table();
        let live = &mut self.procs[idx];
        live.begin = ts;
        live.end = None;
        live.args = Some(args.to_owned());
        live.child_samples = 0.0;
        live.table = table;
        snapshot
    }

    /// Account for an epoch which is done.
    fn record_finished(&mut self, idx: usize) {
        if self.procs[idx].args.is_none() {
            // still a thread in its parent's group: its syscalls and its
            // elapsed time are already attributed there
            return;
        }
        let self_time = self.self_time(idx, now());
        let mut cur = self.procs[idx].parent;
        while let Some(parent) = cur {
            self.procs[parent].child_samples += self_time;
            cur = self.procs[parent].parent;
        }
        self.finished.push(idx);
    }

    /// Wall time of the epoch minus time credited to retired descendants and
    /// time spent in tracked syscalls. May go negative on pathological
    /// input; `render` floors it.
    fn self_time(&self, idx: usize, now: f64) -> f64 {
        let proc = &self.procs[idx];
        let end = proc.end.unwrap_or(now);
        let in_syscalls: f64 = self.tables[proc.table].values().map(|c| c.elapsed).sum();
        (end - proc.begin) - proc.child_samples - in_syscalls
    }

    /// Consume one call into the process forest.
    pub fn record(&mut self, call: &Call) {
        let (func, args, retcode, elapsed) = match &call.event {
            Event::Syscall {
                func,
                args,
                retcode,
                elapsed,
                ..
            } => (func.as_str(), args.as_str(), retcode, *elapsed),
            Event::Exit { code } => {
                let Some(idx) = self.pmap.swap_remove(&call.pid) else {
                    debug!("exit for unknown pid {}", call.pid);
                    return;
                };
                self.procs[idx].retcode = Some(*code);
                self.procs[idx].end = Some(call.ts);
                self.record_finished(idx);
                return;
            }
            Event::Signal { .. } => return,
        };

        match func {
            "clone" => {
                // a new task keyed by the returned pid; we assume it will
                // exec something later
                if let RetCode::Num(child) = *retcode {
                    let child = Pid::from_raw(child as i32);
                    let parent = self.pmap.get(&call.pid).copied();
                    let idx = self.spawn(child, parent, call.ts);
                    self.pmap.insert(child, idx);
                }
            }
            "execve" => {
                if *retcode != RetCode::Num(0) {
                    // failed exec
                    return;
                }
                match self.pmap.get(&call.pid).copied() {
                    None => {
                        // the root of the tree wasn't cloned from anything
                        // we saw, so create a node to hold it
                        let idx = self.spawn(call.pid, None, call.ts);
                        self.procs[idx].args = Some(args.to_owned());
                        self.pmap.insert(call.pid, idx);
                    }
                    Some(idx) => {
                        let snapshot = self.exec(idx, args, call.ts);
                        self.record_finished(snapshot);
                    }
                }
            }
            func if TRACKED_SYSCALLS.contains(&func) => {
                if func == "read" && args.as_bytes().get(1..7) == Some(&b"<pipe:"[..]) {
                    // pipe reads are waits on other processes, not work
                    return;
                }
                if let Some(&idx) = self.pmap.get(&call.pid) {
                    let table = self.procs[idx].table;
                    self.tables[table].entry(func.to_owned()).or_default().add(elapsed);
                }
            }
            _ => {}
        }
    }

    /// Frame path from the root down to this epoch. Tasks without their own
    /// args contribute no frame but their ancestors still do.
    fn stack(&self, idx: usize) -> String {
        let mut frames = Vec::new();
        let mut cur = Some(idx);
        while let Some(i) = cur {
            let proc = &self.procs[i];
            if let Some(args) = &proc.args {
                frames.push(fold::frame(proc.pid, args));
            }
            cur = proc.parent;
        }
        frames.iter().rev().join(";")
    }

    /// Write one folded row per retired epoch, in retirement order, followed
    /// by one row per syscall counter in first-seen order.
    pub fn render<W: Write>(&self, mut out: W) -> io::Result<()> {
        let now = now();
        for &idx in &self.finished {
            let stack = self.stack(idx);
            let us = (self.self_time(idx, now) * 1e6) as i64;
            writeln!(out, "{} {}", stack, us.max(1))?;
            for (func, counter) in &self.tables[self.procs[idx].table] {
                let us = (counter.elapsed * 1e6) as i64;
                writeln!(out, "{};{}({} calls) {}", stack, func, counter.calls, us)?;
            }
        }
        Ok(())
    }
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
