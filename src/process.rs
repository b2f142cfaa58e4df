//! The caller-facing process record (§6 exposed operations, §9 `consoleChan`
//! coupling). A `Process` is created before `Start` and handed to the
//! driver; the driver deposits the pid, start time, and PTY master fd into
//! it as they become known.

use std::fs;
use std::io;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Mutex;

use nix::unistd::Pid;

use crate::error::Error;

/// Receiving end of the PTY master handoff (§4.A, §9). A consumer thread
/// owns this; the driver sends to the paired sender synchronously during
/// the `ProcConsole` exchange.
pub type ConsoleReceiver = Receiver<std::os::fd::OwnedFd>;
pub type ConsoleSender = SyncSender<std::os::fd::OwnedFd>;

/// A container or joined process, as seen by the caller.
///
/// Holds the bits a driver fills in over the course of `Start`: the tracked
/// pid, its start time, and (once registered) a channel the PTY master is
/// posted to.
#[derive(Debug)]
pub struct Process {
    pid: Mutex<Option<Pid>>,
    console_tx: Mutex<Option<ConsoleSender>>,
    external_descriptors: Mutex<Vec<String>>,
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

impl Process {
    pub fn new() -> Self {
        Self {
            pid: Mutex::new(None),
            console_tx: Mutex::new(None),
            external_descriptors: Mutex::new(Vec::new()),
        }
    }

    /// Registers the receiving half of a PTY master handoff. Must be called
    /// before `Start` if the workload requests a console; per §9's resolved
    /// open question, a driver that needs to post an fd with nothing
    /// registered returns [`Error::Protocol`] instead of panicking.
    pub fn console_channel(&self) -> ConsoleReceiver {
        let (tx, rx) = sync_channel(1);
        *self.console_tx.lock().unwrap() = Some(tx);
        rx
    }

    pub(crate) fn set_pid(&self, pid: Pid) {
        *self.pid.lock().unwrap() = Some(pid);
    }

    pub fn pid(&self) -> Option<Pid> {
        *self.pid.lock().unwrap()
    }

    /// `/proc/<pid>/stat` field 22 (process start time in clock ticks since
    /// boot), read as the opaque string the kernel reports it as (§6).
    pub fn start_time(&self) -> Result<String, Error> {
        let pid = self
            .pid()
            .ok_or_else(|| Error::Protocol("start_time requested before pid is known".into()))?;
        read_start_time(pid)
    }

    pub fn external_descriptors(&self) -> Vec<String> {
        self.external_descriptors.lock().unwrap().clone()
    }

    pub fn set_external_descriptors(&self, descriptors: Vec<String>) {
        *self.external_descriptors.lock().unwrap() = descriptors;
    }

    /// Posts `fd` to the registered console channel. Returns
    /// [`Error::Protocol`] if no receiver was ever registered, rather than
    /// panicking (§9 open question resolution, see DESIGN.md).
    pub(crate) fn deliver_console_fd(&self, fd: std::os::fd::OwnedFd) -> Result<(), Error> {
        let guard = self.console_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(fd).map_err(|_| {
                Error::Protocol("console receiver dropped before fd delivery".into())
            }),
            None => Err(Error::Protocol(
                "child requested console handoff but no receiver is registered".into(),
            )),
        }
    }
}

fn read_start_time(pid: Pid) -> Result<String, Error> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))
        .map_err(|e| Error::io("reading /proc/<pid>/stat", e))?;
    // Field 2 (comm) may contain spaces and parens; split on the last
    // closing paren, then count fields from "state" (field 3) onward.
    let after_comm = stat
        .rfind(')')
        .map(|idx| &stat[idx + 1..])
        .ok_or_else(|| Error::Protocol("malformed /proc/<pid>/stat: no comm field".into()))?;
    after_comm
        .split_whitespace()
        .nth(19) // field 22 overall, 0-indexed from field 3
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Protocol("malformed /proc/<pid>/stat: missing starttime field".into())
        })
}

/// Validates a raw signal number before it reaches `kill` (§8 testable
/// property 7): a non-OS signal is rejected without touching the child.
pub fn validate_signal(raw: i32) -> io::Result<nix::sys::signal::Signal> {
    nix::sys::signal::Signal::try_from(raw).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("not a valid signal: {raw}"))
    })
}
