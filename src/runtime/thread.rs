// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::tenant::Tenant;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Synthetic thread ids for virtual threads live above this bit so they can
/// never collide with OS thread ids.
pub(crate) const VIRTUAL_TID_BASE: u64 = 1 << 62;

/// The OS thread id of the calling thread.
pub fn os_thread_id() -> u64 {
    nix::unistd::gettid().as_raw() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// An ordinary OS-scheduled thread.
    Platform,
    /// An OS thread in a virtual-thread scheduler pool.
    Carrier,
    /// A user-mode thread multiplexed onto carriers.
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Runnable = 0,
    Waiting = 1,
    TimedWaiting = 2,
    Terminated = 3,
}

impl ThreadState {
    fn from_u8(v: u8) -> ThreadState {
        match v {
            0 => ThreadState::Runnable,
            1 => ThreadState::Waiting,
            2 => ThreadState::TimedWaiting,
            _ => ThreadState::Terminated,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, ThreadState::Waiting | ThreadState::TimedWaiting)
    }
}

/// Per-thread wake channel. Interrupts, death marks, and plain unparks all
/// funnel through one condvar so a blocked thread has a single thing to
/// sleep on.
struct Parker {
    epoch: Mutex<u64>,
    cvar: Condvar,
}

impl Parker {
    fn new() -> Self {
        Parker { epoch: Mutex::new(0), cvar: Condvar::new() }
    }

    fn wake(&self) {
        *self.epoch.lock() += 1;
        self.cvar.notify_all();
    }
}

/// Why an interruptible wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Elapsed,
    Interrupted,
    /// The tenant-death condition became observable on this thread.
    Death,
}

/// Observation of the tenant-death condition at a safepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantDeath;

/// The engine's view of one participating thread.
///
/// A handle outlives its thread: the thread sets `alive = false` on exit
/// and collections holding the handle purge it lazily. All cross-thread
/// signaling (death marks, interrupts, wakes) goes through the handle.
pub struct ThreadHandle {
    tid: u64,
    kind: ThreadKind,
    name: String,
    /// System/innocuous threads never inherit a tenant.
    system: bool,
    alive: AtomicBool,
    state: AtomicU8,
    /// The tenant-death condition has been requested for this thread. A
    /// masked thread keeps the flag but does not observe it until unmask.
    pending_death: AtomicBool,
    interrupted: AtomicBool,
    mask_depth: AtomicU32,
    /// Per-thread "inherit the creator's tenant" flag.
    inherit_tenant: AtomicBool,
    attached_tenant: Mutex<Weak<Tenant>>,
    inherited_tenant: Mutex<Weak<Tenant>>,
    /// For virtual threads: the carrier currently mounting this thread.
    carrier: Mutex<Weak<ThreadHandle>>,
    parker: Parker,
}

impl ThreadHandle {
    pub(crate) fn new(
        tid: u64,
        kind: ThreadKind,
        name: impl Into<String>,
        inherit_default: bool,
    ) -> Arc<ThreadHandle> {
        Self::build(tid, kind, name.into(), inherit_default, false)
    }

    /// A system/innocuous thread: participates in bookkeeping, never
    /// inherits a tenant.
    pub(crate) fn new_system(tid: u64, name: impl Into<String>) -> Arc<ThreadHandle> {
        Self::build(tid, ThreadKind::Platform, name.into(), false, true)
    }

    fn build(
        tid: u64,
        kind: ThreadKind,
        name: String,
        inherit_default: bool,
        system: bool,
    ) -> Arc<ThreadHandle> {
        Arc::new(ThreadHandle {
            tid,
            kind,
            name,
            system,
            alive: AtomicBool::new(true),
            state: AtomicU8::new(ThreadState::Runnable as u8),
            pending_death: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            mask_depth: AtomicU32::new(0),
            inherit_tenant: AtomicBool::new(inherit_default),
            attached_tenant: Mutex::new(Weak::new()),
            inherited_tenant: Mutex::new(Weak::new()),
            carrier: Mutex::new(Weak::new()),
            parker: Parker::new(),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn mark_terminated(&self) {
        self.set_state(ThreadState::Terminated);
        self.alive.store(false, Ordering::Release);
        self.parker.wake();
    }

    /// Requests the tenant-death condition. Observation is deferred while a
    /// shutdown mask is held.
    pub(crate) fn request_death(&self) {
        self.pending_death.store(true, Ordering::Release);
        self.parker.wake();
    }

    pub fn death_requested(&self) -> bool {
        self.pending_death.load(Ordering::Acquire)
    }

    /// True when the death condition is both requested and not hidden by a
    /// shutdown mask.
    pub fn death_observable(&self) -> bool {
        self.death_requested() && self.mask_depth.load(Ordering::Acquire) == 0
    }

    pub fn is_masked(&self) -> bool {
        self.mask_depth.load(Ordering::Acquire) > 0
    }

    pub(crate) fn mask(&self) {
        self.mask_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unmask(&self) {
        let previous = self.mask_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unbalanced shutdown unmask");
        if previous == 1 && self.death_requested() {
            // A death arrived while masked; make sure a blocked thread
            // notices at its next wait.
            self.parker.wake();
        }
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.parker.wake();
    }

    pub fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn unpark(&self) {
        self.parker.wake();
    }

    pub fn attached_tenant(&self) -> Option<Arc<Tenant>> {
        self.attached_tenant.lock().upgrade()
    }

    pub(crate) fn set_attached_tenant(&self, tenant: Option<&Arc<Tenant>>) {
        *self.attached_tenant.lock() = tenant.map_or_else(Weak::new, Arc::downgrade);
    }

    pub fn inherited_tenant(&self) -> Option<Arc<Tenant>> {
        self.inherited_tenant.lock().upgrade()
    }

    pub(crate) fn set_inherited_tenant(&self, tenant: Option<&Arc<Tenant>>) {
        *self.inherited_tenant.lock() = tenant.map_or_else(Weak::new, Arc::downgrade);
    }

    pub fn inherits_tenant(&self) -> bool {
        !self.system && self.inherit_tenant.load(Ordering::Acquire)
    }

    pub(crate) fn set_inherits_tenant(&self, inherit: bool) {
        self.inherit_tenant.store(inherit, Ordering::Release);
    }

    pub fn carrier(&self) -> Option<Arc<ThreadHandle>> {
        self.carrier.lock().upgrade()
    }

    pub(crate) fn set_carrier(&self, carrier: Option<&Arc<ThreadHandle>>) {
        *self.carrier.lock() = carrier.map_or_else(Weak::new, Arc::downgrade);
    }

    /// Injects the death condition into a virtual thread, unless it or its
    /// current carrier holds a shutdown mask. Returns whether the mark was
    /// placed.
    pub(crate) fn try_request_death_virtual(&self) -> bool {
        debug_assert_eq!(self.kind, ThreadKind::Virtual);
        if self.is_masked() {
            return false;
        }
        if let Some(carrier) = self.carrier() {
            if carrier.is_masked() {
                return false;
            }
        }
        self.request_death();
        true
    }

    /// Blocks the calling thread (which must be the one this handle
    /// represents) until woken, interrupted, marked dead, or `timeout`
    /// elapses.
    pub(crate) fn park_interruptibly(&self, timeout: Option<Duration>) -> WakeReason {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.set_state(match timeout {
            Some(_) => ThreadState::TimedWaiting,
            None => ThreadState::Waiting,
        });
        let reason = self.park_inner(deadline);
        self.set_state(ThreadState::Runnable);
        reason
    }

    fn park_inner(&self, deadline: Option<Instant>) -> WakeReason {
        let mut epoch = self.parker.epoch.lock();
        loop {
            if self.death_observable() {
                return WakeReason::Death;
            }
            if self.take_interrupted() {
                return WakeReason::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return WakeReason::Elapsed;
                    }
                    if self.parker.cvar.wait_until(&mut epoch, deadline).timed_out() {
                        return WakeReason::Elapsed;
                    }
                }
                None => self.parker.cvar.wait(&mut epoch),
            }
        }
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("tid", &self.tid)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// tid → handle for every participating thread in the process. Entries are
/// weak; a handle disappears when its last owner (thread TLS or a tenant
/// collection) drops it.
#[derive(Default)]
pub(crate) struct ThreadTable {
    threads: Mutex<HashMap<u64, Weak<ThreadHandle>>>,
}

impl ThreadTable {
    pub(crate) fn insert(&self, handle: &Arc<ThreadHandle>) {
        let mut threads = self.threads.lock();
        threads.retain(|_, weak| weak.strong_count() > 0);
        threads.insert(handle.tid(), Arc::downgrade(handle));
    }

    pub(crate) fn remove(&self, tid: u64) {
        self.threads.lock().remove(&tid);
    }

    pub(crate) fn get(&self, tid: u64) -> Option<Arc<ThreadHandle>> {
        self.threads.lock().get(&tid).and_then(Weak::upgrade)
    }
}

/// Per-thread identity stack. The top is the handle tenant-attribution
/// applies to: a carrier pushes the virtual thread it mounts and pops it at
/// unmount. Handles still on the stack when the thread exits are marked
/// terminated by the TLS destructor.
#[derive(Default)]
struct CurrentSlot {
    stack: Vec<Arc<ThreadHandle>>,
}

impl Drop for CurrentSlot {
    fn drop(&mut self) {
        for handle in self.stack.drain(..) {
            handle.mark_terminated();
        }
    }
}

thread_local! {
    static CURRENT: RefCell<CurrentSlot> = RefCell::new(CurrentSlot::default());
}

/// The handle of the calling thread, if it participates in tenancy.
pub fn current_thread() -> Option<Arc<ThreadHandle>> {
    CURRENT
        .try_with(|current| current.borrow().stack.last().cloned())
        .ok()
        .flatten()
}

/// Permanently adopts `handle` as the calling thread's base identity; it is
/// marked terminated when the thread exits.
pub(crate) fn adopt_current(handle: Arc<ThreadHandle>) {
    CURRENT.with(|current| current.borrow_mut().stack.push(handle));
}

/// Makes `handle` the calling thread's identity until the guard drops.
pub(crate) fn enter_thread(handle: Arc<ThreadHandle>) -> CurrentThreadGuard {
    CURRENT.with(|current| current.borrow_mut().stack.push(handle));
    CurrentThreadGuard { _private: () }
}

pub(crate) struct CurrentThreadGuard {
    _private: (),
}

impl Drop for CurrentThreadGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            current.borrow_mut().stack.pop();
        });
    }
}

/// A safepoint: the calling thread observes a pending tenant-death
/// condition here, unless it is hidden by a shutdown mask.
///
/// Tenant code is expected to call this (directly or through the blocking
/// helpers) at its cancellation points and unwind its work when `Err` is
/// returned.
pub fn safepoint() -> Result<(), TenantDeath> {
    match current_thread() {
        Some(handle) if handle.death_observable() => Err(TenantDeath),
        _ => Ok(()),
    }
}

/// Sleeps up to `duration`, waking early on interrupt or tenant death.
/// Unregistered threads sleep uninterruptibly.
pub fn interruptible_sleep(duration: Duration) -> WakeReason {
    match current_thread() {
        Some(handle) => handle.park_interruptibly(Some(duration)),
        None => {
            std::thread::sleep(duration);
            WakeReason::Elapsed
        }
    }
}

/// Re-entrant guard hiding the calling thread from tenant termination.
///
/// While at least one `ShutdownMask` is alive on a thread, a concurrent
/// destroy leaves its death mark pending instead of delivering it; the mark
/// becomes observable at the first safepoint after the last guard drops.
pub struct ShutdownMask {
    handle: Arc<ThreadHandle>,
}

impl ShutdownMask {
    /// Masks the calling thread. Returns `None` when the thread is not
    /// registered with the tenancy runtime (nothing would deliver a death
    /// condition to it anyway).
    pub fn acquire() -> Option<ShutdownMask> {
        let handle = current_thread()?;
        handle.mask();
        Some(ShutdownMask { handle })
    }
}

impl Drop for ShutdownMask {
    fn drop(&mut self) {
        self.handle.unmask();
    }
}
