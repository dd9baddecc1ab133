//! Multi-worker supervisor (C8): binds listening sockets once in the
//! parent, forks `workers - 1` children that inherit them, and runs a C7
//! pool in every process (parent included) so the kernel load-balances
//! `accept()` across all of them.
//!
//! The child-process bookkeeping (`register`/`kill_all`) generalizes a
//! "track spawned child PIDs, signal them on shutdown" pattern from
//! tracking stray sandboxed processes to reaping proxy workers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use socket2::{Domain, Socket, Type};

use crate::error::{PxError, Result};

/// Tracks forked worker PIDs so a shutdown signal can reap them. Workers
/// are not restarted if they die; their share of accept capacity is simply
/// lost until the next start, per the component's stated behavior.
#[derive(Clone, Default)]
pub struct WorkerTracker {
    pids: Arc<Mutex<Vec<i32>>>,
}

impl WorkerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: i32) {
        self.pids.lock().expect("worker tracker mutex poisoned").push(pid);
    }

    #[cfg(unix)]
    pub fn kill_all(&self) {
        let pids = self.pids.lock().expect("worker tracker mutex poisoned");
        for &pid in pids.iter() {
            tracing::debug!(pid, "supervisor: terminating worker");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }

    #[cfg(not(unix))]
    pub fn kill_all(&self) {}
}

/// Binds one `SO_REUSEADDR` listening socket per `listen[i]:port` pair.
/// Binding happens once, in the parent, before any fork — children inherit
/// the resulting file descriptors directly on platforms with fork; where
/// fork-based inheritance isn't available the supervisor instead runs a
/// single worker (see [`supports_multi_worker`]).
pub fn bind_listeners(addrs: &[SocketAddr]) -> Result<Vec<std::net::TcpListener>> {
    addrs
        .iter()
        .map(|addr| {
            let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
            let socket = Socket::new(domain, Type::STREAM, None)
                .map_err(|source| PxError::UpstreamConnect { addr: addr.to_string(), source })?;
            socket
                .set_reuse_address(true)
                .map_err(|source| PxError::UpstreamConnect { addr: addr.to_string(), source })?;
            socket
                .bind(&(*addr).into())
                .map_err(|_| PxError::PortInUse { addr: *addr })?;
            socket
                .listen(1024)
                .map_err(|source| PxError::UpstreamConnect { addr: addr.to_string(), source })?;
            Ok(socket.into())
        })
        .collect()
}

/// True on platforms where forking and inheriting the listening sockets
/// into children is safe. Elsewhere the supervisor runs a single worker;
/// this is a platform-fixed choice, not configurable.
#[cfg(unix)]
pub fn supports_multi_worker() -> bool {
    true
}

#[cfg(not(unix))]
pub fn supports_multi_worker() -> bool {
    false
}

/// Forks `workers - 1` children. Each closure invocation of `run_worker`
/// receives the worker index (0 = parent) and is expected to bind its own
/// executor and run a C7 pool against the already-open listener fds;
/// `std::net::TcpListener`s are handed to children via fork-inherited fds,
/// so no out-of-band duplication is needed on Unix.
///
/// Returns immediately in the parent after forking with the tracker
/// populated; the parent is expected to go on and run worker 0 itself.
#[cfg(unix)]
pub fn fork_workers(workers: u32) -> Result<(WorkerTracker, bool)> {
    let tracker = WorkerTracker::new();
    if workers <= 1 {
        return Ok((tracker, true));
    }

    let parent = nix::unistd::getpid();

    for _ in 1..workers {
        // SAFETY: the child immediately returns out of this function with
        // `is_parent = false`; it does no further forking and performs no
        // operation unsafe to run post-fork beyond what `nix::unistd::fork`
        // itself documents (single-threaded re-exec-free continuation into
        // the worker's own async runtime).
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { child, .. }) => {
                tracker.register(child.as_raw());
            }
            Ok(nix::unistd::ForkResult::Child) => {
                install_default_sigint();
                die_with_parent(parent);
                return Ok((tracker, false));
            }
            Err(e) => {
                tracing::error!(error = %e, "supervisor: fork failed");
                break;
            }
        }
    }

    Ok((tracker, true))
}

/// Asks the kernel to deliver `SIGTERM` to this child the moment its
/// parent exits, by any means (normal exit, signal, crash) — not just a
/// graceful shutdown the parent happens to catch. `PR_SET_PDEATHSIG` is
/// Linux-only; on other Unix platforms a worker outlives a killed parent
/// until the next request fails, which matches the documented degraded
/// behavior for those platforms.
///
/// There is an unavoidable race between `fork()` returning here and the
/// `prctl` call landing: if the parent has already died in that window,
/// re-checking the parent pid and exiting immediately closes it.
#[cfg(target_os = "linux")]
fn die_with_parent(parent: nix::unistd::Pid) {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
    }
    if nix::unistd::getppid() != parent {
        std::process::exit(0);
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn die_with_parent(_parent: nix::unistd::Pid) {}

#[cfg(not(unix))]
pub fn fork_workers(_workers: u32) -> Result<(WorkerTracker, bool)> {
    Ok((WorkerTracker::new(), true))
}

#[cfg(unix)]
fn install_default_sigint() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_tracker_registers_pids() {
        let tracker = WorkerTracker::new();
        tracker.register(123);
        tracker.register(456);
        assert_eq!(*tracker.pids.lock().unwrap(), vec![123, 456]);
    }

    #[test]
    fn single_worker_skips_forking() {
        let (_tracker, is_parent) = fork_workers(1).unwrap();
        assert!(is_parent);
    }
}
