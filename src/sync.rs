//! The parent/child synchronization protocol (§4.A).
//!
//! Messages are newline-delimited JSON over a `SOCK_STREAM` Unix domain
//! socketpair, which -- unlike a plain pipe -- can additionally carry a
//! `SCM_RIGHTS` ancillary message for the PTY master handoff.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    self, recvmsg, sendmsg, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use serde::{Deserialize, Serialize};

use crate::error::{Context, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    ProcConsole,
    ProcConsoleReq,
    ProcConsoleAck,
    ProcReady,
    ProcRun,
    ProcHooks,
    ProcResume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMsg {
    #[serde(rename = "type")]
    pub kind: SyncType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,
}

impl SyncMsg {
    pub fn new(kind: SyncType) -> Self {
        Self { kind, fd: None }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PidRecord {
    pub pid: i32,
}

/// Creates the parent/child endpoint pair used for the sync protocol.
///
/// Returns `(parent_end, child_end)`; the child end is meant to be handed to
/// the bootstrap helper's inherited fd table and closed locally immediately
/// after spawn (§4.B step 2), so the parent can observe EOF.
pub fn new_sync_pair() -> Result<(OwnedFd, OwnedFd), Error> {
    let (a, b) = socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .context("creating sync socketpair")?;
    Ok((a, b))
}

/// The parent-owned half of the sync socket.
pub struct SyncSocket {
    reader: BufReader<UnixStream>,
    raw_fd: RawFd,
}

impl SyncSocket {
    pub fn new(fd: OwnedFd) -> Self {
        let raw_fd = fd.as_raw_fd();
        let stream = UnixStream::from(fd);
        Self {
            reader: BufReader::new(stream),
            raw_fd,
        }
    }

    fn stream(&mut self) -> &mut UnixStream {
        self.reader.get_mut()
    }

    /// Writes an arbitrary byte stream (used for the bootstrap payload and
    /// for the raw `initConfig` JSON blob, both of which are plain writes
    /// rather than framed sync messages).
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.stream()
            .write_all(buf)
            .context("writing to sync socket")
    }

    /// Writes the single `0x80` synchronization byte meaning "enter a new
    /// cgroup namespace now" (§4.F step 6).
    pub fn write_cgroupns_byte(&mut self) -> Result<(), Error> {
        const NEW_CGROUPNS: u8 = 1 << 7;
        self.write_bytes(&[NEW_CGROUPNS])
    }

    /// Reads one JSON line and decodes it as `T`. Used once, up front, to
    /// read the bootstrap helper's `{"pid":N}` record.
    pub fn read_json_line<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T, Error> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .context("reading JSON line from sync socket")?;
        if n == 0 {
            return Err(Error::Protocol("EOF before expected JSON record".into()));
        }
        serde_json::from_str(line.trim_end()).map_err(|e| Error::io("parsing JSON record", e))
    }

    pub fn send_msg(&mut self, msg: &SyncMsg) -> Result<(), Error> {
        let mut line = serde_json::to_vec(msg).map_err(|e| Error::io("encoding sync message", e))?;
        line.push(b'\n');
        self.write_bytes(&line)
    }

    /// Reads the next sync message, or `Ok(None)` on clean EOF.
    pub fn recv_msg(&mut self) -> Result<Option<SyncMsg>, Error> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .context("reading sync message")?;
        if n == 0 {
            return Ok(None);
        }
        let msg = serde_json::from_str(line.trim_end())
            .map_err(|e| Error::Protocol(format!("invalid JSON payload: {e}")))?;
        Ok(Some(msg))
    }

    /// Drives the dispatcher loop: reads messages until EOF, invoking `f` for
    /// each. Mirrors §9's guidance to write this as a single state loop
    /// rather than mutually recursive callbacks.
    pub fn run_dispatcher<F>(&mut self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&mut SyncSocket, SyncType) -> Result<(), Error>,
    {
        loop {
            match self.recv_msg()? {
                None => return Ok(()),
                Some(msg) => f(self, msg.kind)?,
            }
        }
    }

    /// Shuts down the write half. Per invariant 2/testable-property 6, this
    /// must happen exactly once, after all sync traffic, before waiting on
    /// the final child.
    pub fn shutdown_write(&mut self) -> Result<(), Error> {
        self.stream()
            .shutdown(std::net::Shutdown::Write)
            .context("half-closing sync socket")
    }

    /// Sends an fd via `SCM_RIGHTS` ancillary data (the PTY master handoff,
    /// §4.A). The accompanying `ProcConsoleReq`/`ProcConsoleAck` framing
    /// messages are sent separately by the caller.
    pub fn send_fd(&mut self, fd: RawFd) -> Result<(), Error> {
        let iov = [std::io::IoSlice::new(b"\0")];
        let cmsg = [ControlMessage::ScmRights(&[fd])];
        sendmsg::<()>(self.raw_fd, &iov, &cmsg, MsgFlags::empty(), None)
            .context("sending fd via ancillary data")?;
        Ok(())
    }

    /// Receives a single fd sent via `SCM_RIGHTS`.
    pub fn recv_fd(&mut self) -> Result<OwnedFd, Error> {
        let mut buf = [0u8; 1];
        let mut iov = [std::io::IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            self.raw_fd,
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .context("receiving fd via ancillary data")?;
        for cmsg in msg.cmsgs().map_err(|e| Error::io("reading control messages", e))? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(fd) = fds.into_iter().next() {
                    return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        Err(Error::Protocol(
            "ProcConsole handoff did not carry an fd".into(),
        ))
    }
}

/// Bare byte-level reader used only for the bootstrap payload stream, kept
/// separate from [`SyncSocket`] because it runs before any JSON framing is
/// meaningful (the helper hasn't replied with its pid record yet).
pub fn stream_bootstrap(sync: &mut SyncSocket, bytes: &[u8]) -> Result<(), Error> {
    sync.write_bytes(bytes)
}

/// Reads the `{"pid":N}` record the helper writes before exiting (§4.B step 4-5).
pub fn read_pid_record(sync: &mut SyncSocket) -> Result<nix::unistd::Pid, Error> {
    let record: PidRecord = sync.read_json_line()?;
    Ok(nix::unistd::Pid::from_raw(record.pid))
}
