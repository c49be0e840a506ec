// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::runtime::{enter_thread, ThreadHandle};
use crate::sched::VirtualThreadContainer;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Body = Box<dyn FnOnce() + Send>;
type ExitHook = Box<dyn FnOnce() + Send>;

/// A user-mode thread multiplexed onto the carrier pool.
///
/// The body runs once, on whichever carrier mounts the thread; while
/// mounted, the virtual thread *is* the current thread for tenant
/// attribution, masking, and safepoints. Cancellation is cooperative: the
/// body observes a pending tenant death at its safepoints and blocking
/// calls.
pub struct VirtualThread {
    handle: Arc<ThreadHandle>,
    body: Mutex<Option<Body>>,
    exit_hooks: Mutex<Vec<ExitHook>>,
    done: Mutex<bool>,
    done_cvar: Condvar,
}

impl VirtualThread {
    pub(crate) fn new(handle: Arc<ThreadHandle>, body: Body) -> Arc<VirtualThread> {
        Arc::new(VirtualThread {
            handle,
            body: Mutex::new(Some(body)),
            exit_hooks: Mutex::new(Vec::new()),
            done: Mutex::new(false),
            done_cvar: Condvar::new(),
        })
    }

    pub fn handle(&self) -> &Arc<ThreadHandle> {
        &self.handle
    }

    /// Registers a callback invoked after the thread exits (or is retired
    /// without ever running). Used by executors to return permits.
    pub(crate) fn add_exit_hook(&self, hook: ExitHook) {
        self.exit_hooks.lock().push(hook);
    }

    /// Blocks until the thread has exited. Returns `false` on timeout.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_cvar.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    /// Runs this thread on `carrier`. The carrier's identity is shadowed by
    /// the virtual thread for the duration of the mount.
    pub(crate) fn mount_and_run(
        self: &Arc<Self>,
        carrier: &Arc<ThreadHandle>,
        container: &Arc<VirtualThreadContainer>,
    ) {
        self.handle.set_carrier(Some(carrier));
        {
            let _current = enter_thread(self.handle.clone());
            // A thread marked dead before its first mount never runs.
            if !self.handle.death_observable() {
                if let Some(body) = self.body.lock().take() {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
                    if result.is_err() {
                        log::warn!("virtual thread {} panicked", self.handle.name());
                    }
                }
            }
        }
        self.handle.set_carrier(None);
        self.retire(container);
    }

    /// Takes the thread out of service: container bookkeeping, exit hooks,
    /// and the completion latch. Also used for threads discarded from the
    /// run queue at container shutdown.
    pub(crate) fn retire(&self, container: &Arc<VirtualThreadContainer>) {
        container.on_exit(&self.handle);
        for hook in self.exit_hooks.lock().drain(..) {
            hook();
        }
        let mut done = self.done.lock();
        *done = true;
        self.done_cvar.notify_all();
    }
}

impl std::fmt::Debug for VirtualThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualThread").field("handle", &self.handle).finish()
    }
}
