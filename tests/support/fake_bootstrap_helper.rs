//! Stand-in for the bootstrap helper binary (§4.B, §6 helper contract).
//!
//! Real namespace entry needs root and a kernel that supports the relevant
//! `clone`/`unshare` flags, neither of which a test runner can assume. This
//! fixture speaks the same wire protocol -- bootstrap bytes in, `{"pid":N}`
//! record out, then hands the socket to a cloned "grandchild" that plays
//! the container's own init process for the rest of the exchange -- without
//! touching any namespace.
//!
//! The grandchild is created with the raw `clone(2)` syscall and
//! `CLONE_PARENT`, the same technique the real bootstrap helper uses to make
//! the final init process a direct child of the driver rather than of
//! itself: `CLONE_PARENT` makes the new process's parent "the same as that
//! of the calling process" (i.e. the driver that spawned this helper), so
//! the grandchild is reapable by the driver's `waitpid` from the moment it
//! exists rather than only after an ordinary `fork`'s reparenting. A plain
//! `fork()` grandchild would instead be reparented to the nearest subreaper
//! (typically init) once this helper process exits, which is not a child of
//! the driver and therefore not something the driver's `waitpid` can reap.
//! Passing a null stack with `CLONE_VM` unset gives the clone copy-on-write
//! semantics identical to `fork`, so the rest of this file still reads as an
//! ordinary fork-and-branch.
//!
//! A private ordering pipe (separate from the sync socket) sequences the two
//! roles: the grandchild blocks on it until the helper role has finished
//! writing the pid record (and, for the `cgroupns` scenario, draining the
//! sync byte), so the two processes never write to the shared sync socket
//! concurrently.
//!
//! Framing for the bootstrap byte stream is this fixture's own invention
//! (the real helper's framing is undefined by the core and is the helper's
//! business per §4.B): a 4-byte little-endian length prefix followed by
//! that many opaque bytes.
//!
//! Scenario is selected by argv[1]:
//! - `setns` / `ready` (default) -- act as the SetnsDriver/no-mount-ns
//!   InitDriver path: exit after the pid record, grandchild answers nothing
//!   unless scenario says otherwise.
//! - `ready-then-exit` -- grandchild sends `ProcReady`, waits for `ProcRun`,
//!   then closes its side (EOF), standing in for S2.
//! - `hooks` -- grandchild sends `ProcReady`, waits for `ProcRun`, then
//!   sends `ProcHooks`, waits for `ProcResume`, then EOF (S3).
//! - `cgroupns` -- the fixture also drains the single `0x80` sync byte
//!   before the helper process exits (S4).
//! - `bad-ready` -- grandchild immediately sends `ProcReady` with no prior
//!   framing context, used by the setns-protocol-violation scenario (S6).

use std::env;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use nix::unistd::{pipe, read, write};

use initd::bootstrap::HELPER_SYNC_FD;
use initd::sync::{SyncMsg, SyncSocket, SyncType};

fn main() {
    let scenario = env::args().nth(1).unwrap_or_else(|| "ready".to_string());

    // SAFETY: fd 3 is the sync socket the spawning driver dup'd into this
    // well-known slot before exec (§4.B).
    let raw_stream = unsafe { UnixStream::from(OwnedFd::from_raw_fd(HELPER_SYNC_FD)) };

    let mut len_buf = [0u8; 4];
    read_exact_or_die(&raw_stream, &mut len_buf);
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    read_exact_or_die(&raw_stream, &mut payload);

    // Ordering pipe: the grandchild waits on its read-end until the helper
    // role closes/writes its write-end, so the two processes never race on
    // `raw_stream`.
    let (order_r, order_w) = pipe().expect("creating ordering pipe");

    match unsafe { clone_parent() }.expect("clone with CLONE_PARENT") {
        0 => {
            // Grandchild role: block until the helper role has finished
            // using the socket.
            drop(order_w);
            let mut ack = [0u8; 1];
            let _ = read(order_r.as_raw_fd(), &mut ack);
            drop(order_r);

            let sync_fd: OwnedFd = raw_stream.into();
            let mut sync = SyncSocket::new(sync_fd);
            run_grandchild(&mut sync, &scenario);

            // Stand in for the workload: block until signaled/reaped by the
            // test driving this fixture.
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }
        child_pid => {
            // Helper role: report the grandchild, optionally drain the
            // cgroupns sync byte, then exit so the driver's wait(helper)
            // (§4.F step 7) unblocks.
            drop(order_r);

            let record = format!("{{\"pid\":{child_pid}}}\n");
            write_all_or_die(&raw_stream, record.as_bytes());

            if scenario == "cgroupns" {
                let mut byte = [0u8; 1];
                read_exact_or_die(&raw_stream, &mut byte);
                assert_eq!(byte[0], 1 << 7, "expected the new-cgroupns sync byte");
            }

            let _ = write(&order_w, &[1]);
            drop(order_w);

            std::process::exit(0);
        }
    }
}

/// Clones a new process with `CLONE_PARENT`, so its parent is this
/// process's parent rather than this process (§4.F design note "two-process-
/// deep fork"). Returns `0` in the new process, its pid in the caller -- the
/// same convention `fork()` uses, since a null stack with `CLONE_VM` unset
/// gives copy-on-write semantics identical to `fork`.
///
/// # Safety
/// Only async-signal-safe operations may run in the new process before it
/// either execs or calls `_exit`; the code path the new process takes here
/// (socket I/O, then an infinite sleep loop) upholds that.
unsafe fn clone_parent() -> std::io::Result<libc::pid_t> {
    let flags = libc::SIGCHLD | libc::CLONE_PARENT;
    let ret = libc::syscall(
        libc::SYS_clone,
        flags as libc::c_long,
        0 as libc::c_long,
        0 as libc::c_long,
        0 as libc::c_long,
        0 as libc::c_long,
    );
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ret as libc::pid_t)
}

fn run_grandchild(sync: &mut SyncSocket, scenario: &str) {
    match scenario {
        "bad-ready" => {
            let _ = sync.send_msg(&SyncMsg::new(SyncType::ProcReady));
        }
        "hooks" => {
            let _ = sync.send_msg(&SyncMsg::new(SyncType::ProcReady));
            let _ = sync.recv_msg();
            let _ = sync.send_msg(&SyncMsg::new(SyncType::ProcHooks));
            let _ = sync.recv_msg();
        }
        "ready-then-exit" | "cgroupns" => {
            let _ = sync.send_msg(&SyncMsg::new(SyncType::ProcReady));
            let _ = sync.recv_msg();
        }
        // "setns"/"ready" (default, S1): the joined process answers nothing,
        // it just needs the driver to observe a clean EOF.
        _ => {}
    }

    // A real container's init process would go on using other fds for its
    // own workload; this fixture's job here is done, so it drops its half of
    // the sync socket explicitly rather than relying on process exit (it
    // doesn't exit -- it keeps running so the driver has something to wait
    // on/signal/terminate).
    let _ = sync.shutdown_write();
}

fn read_exact_or_die(mut stream: &UnixStream, buf: &mut [u8]) {
    if stream.read_exact(buf).is_err() {
        std::process::exit(1);
    }
}

fn write_all_or_die(mut stream: &UnixStream, buf: &[u8]) {
    use std::io::Write;
    if stream.write_all(buf).is_err() {
        std::process::exit(1);
    }
}
