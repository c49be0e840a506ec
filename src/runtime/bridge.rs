// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::runtime::thread::{ThreadHandle, ThreadKind, VIRTUAL_TID_BASE};
use crate::tenant::Tenant;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything the engine asks of the embedding runtime.
///
/// The engine never reaches into runtime internals; this trait is the whole
/// seam. [`HostBridge`] is the OS-backed default used in production; tests
/// substitute their own implementation to observe or stub the calls.
pub trait RuntimeBridge: Send + Sync {
    /// Marks every relevant thread of `tenant` with the tenant-death
    /// condition. With `virtual_only`, only virtual threads are marked.
    /// With `os_wakeup`, blocked platform threads additionally get an
    /// OS-level wake so they re-check their state.
    fn prepare_for_destroy(&self, tenant: &Tenant, virtual_only: bool, os_wakeup: bool);

    /// Has `thread` been marked with the death condition?
    fn has_tenant_death(&self, thread: &ThreadHandle) -> bool {
        thread.death_requested()
    }

    fn mask_shutdown(&self, thread: &ThreadHandle);

    fn unmask_shutdown(&self, thread: &ThreadHandle);

    /// Injects the death condition into a virtual thread iff neither it nor
    /// its carrier is masked. Returns whether the mark was placed.
    fn set_tenant_death_to_virtual(&self, vthread: &ThreadHandle) -> bool;

    /// OS-level wake of a blocked thread (empty-handler signal on Linux).
    fn wake_up_tenant_thread(&self, thread: &ThreadHandle);

    /// The runtime's thread interrupt.
    fn interrupt(&self, thread: &ThreadHandle);

    /// Renders a diagnostic dump of `threads` to the log.
    fn dump_threads(&self, threads: &[Arc<ThreadHandle>]);

    /// CPU time consumed by the OS thread `tid`, in nanoseconds. Zero when
    /// unknown.
    fn thread_cpu_time_ns(&self, tid: u64) -> i64;

    fn threads_cpu_time_ns(&self, tids: &[u64]) -> i64 {
        tids.iter().map(|tid| self.thread_cpu_time_ns(*tid)).sum()
    }

    /// Best-effort scheduling-priority bump, used so shutdown and its
    /// victims' cleanup code get CPU ahead of regular tenant work.
    fn raise_priority(&self, tid: u64, level: PriorityLevel);

    /// Undoes a [`RuntimeBridge::raise_priority`] on `tid`. Best-effort.
    fn restore_priority(&self, tid: u64);
}

/// How hard to bump a thread's priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityLevel {
    /// The thread driving a destroy (or its watchdog).
    Shutdown,
    /// A thread being destroyed, so its unwind code can make progress.
    Victim,
}

/// The production bridge: plain OS primitives.
#[derive(Default)]
pub struct HostBridge {
    wakeup_handler_installed: AtomicBool,
}

impl HostBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an empty `SIGURG` handler once, so a directed signal
    /// interrupts blocking syscalls without further effect.
    fn ensure_wakeup_handler(&self) {
        if self.wakeup_handler_installed.swap(true, Ordering::AcqRel) {
            return;
        }
        extern "C" fn noop_handler(_: libc::c_int) {}
        let action = nix::sys::signal::SigAction::new(
            nix::sys::signal::SigHandler::Handler(noop_handler),
            nix::sys::signal::SaFlags::empty(),
            nix::sys::signal::SigSet::empty(),
        );
        // SAFETY: installing a no-op handler for SIGURG; the handler does
        // nothing and is async-signal-safe.
        if let Err(e) = unsafe { nix::sys::signal::sigaction(nix::sys::signal::Signal::SIGURG, &action) } {
            log::warn!("failed to install thread wakeup handler: {e}");
        }
    }

    fn signal_thread(&self, tid: u64) {
        self.ensure_wakeup_handler();
        let pid = std::process::id() as libc::pid_t;
        // SAFETY: tgkill with a valid signal; a stale tid at worst hits
        // ESRCH, which we ignore.
        unsafe {
            libc::syscall(libc::SYS_tgkill, pid, tid as libc::pid_t, libc::SIGURG);
        }
    }
}

impl RuntimeBridge for HostBridge {
    fn prepare_for_destroy(&self, tenant: &Tenant, virtual_only: bool, os_wakeup: bool) {
        for vthread in tenant.virtual_threads() {
            vthread.try_request_death_virtual();
        }
        if !virtual_only {
            for thread in tenant.carrier_threads().into_iter().chain(tenant.platform_threads()) {
                thread.request_death();
                if os_wakeup {
                    self.wake_up_tenant_thread(&thread);
                }
            }
        }
    }

    fn mask_shutdown(&self, thread: &ThreadHandle) {
        thread.mask();
    }

    fn unmask_shutdown(&self, thread: &ThreadHandle) {
        thread.unmask();
    }

    fn set_tenant_death_to_virtual(&self, vthread: &ThreadHandle) -> bool {
        vthread.try_request_death_virtual()
    }

    fn wake_up_tenant_thread(&self, thread: &ThreadHandle) {
        thread.unpark();
        if thread.kind() != ThreadKind::Virtual {
            self.signal_thread(thread.tid());
        }
    }

    fn interrupt(&self, thread: &ThreadHandle) {
        thread.interrupt();
    }

    fn dump_threads(&self, threads: &[Arc<ThreadHandle>]) {
        log::warn!("dumping {} surviving tenant threads", threads.len());
        for thread in threads {
            log::warn!(
                "  thread {} ({:?}, {:?}) masked={} death_pending={}",
                thread.name(),
                thread.kind(),
                thread.state(),
                thread.is_masked(),
                thread.death_requested(),
            );
        }
    }

    fn thread_cpu_time_ns(&self, tid: u64) -> i64 {
        if tid >= VIRTUAL_TID_BASE {
            return 0;
        }
        // First schedstat field is the cumulative on-cpu time in ns.
        let schedstat = format!("/proc/self/task/{tid}/schedstat");
        if let Ok(contents) = std::fs::read_to_string(&schedstat) {
            if let Some(ns) = contents.split_whitespace().next().and_then(|v| v.parse().ok()) {
                if ns > 0 {
                    return ns;
                }
            }
        }
        // Kernels without schedstats still expose utime/stime ticks in
        // stat fields 14 and 15 (after the parenthesized comm).
        let stat = format!("/proc/self/task/{tid}/stat");
        let Ok(contents) = std::fs::read_to_string(&stat) else { return 0 };
        let Some(after_comm) = contents.rsplit(") ").next() else { return 0 };
        let mut fields = after_comm.split_whitespace().skip(11);
        let utime: i64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let stime: i64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks_per_sec <= 0 {
            return 0;
        }
        (utime + stime) * (1_000_000_000 / ticks_per_sec)
    }

    fn raise_priority(&self, tid: u64, level: PriorityLevel) {
        let nice = match level {
            PriorityLevel::Shutdown => -4,
            PriorityLevel::Victim => -3,
        };
        // SAFETY: setpriority on our own thread id; failure (typically
        // EPERM without CAP_SYS_NICE) is ignored.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
        if rc != 0 {
            log::debug!("could not raise priority of thread {tid}");
        }
    }

    fn restore_priority(&self, tid: u64) {
        // SAFETY: see raise_priority.
        unsafe {
            libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, 0);
        }
    }
}
