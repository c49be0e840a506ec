// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod destroy;
mod registry;

pub use registry::{NewPoolPredicate, NewThreadPredicate, PoolThreadPredicate};
pub(crate) use registry::TenantRegistry;

use crate::cgroup::JGroup;
use crate::errors::{Result, TenantError};
use crate::policy::TenantConfiguration;
use crate::runtime::{Tenancy, ThreadHandle, ThreadKind};
use crate::sched::VirtualThreadContainer;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Unique, monotonically assigned tenant identity. Never reused within a
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(u64);

impl TenantId {
    pub(crate) fn new(raw: u64) -> Self {
        TenantId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The cgroup directory name for this tenant, `t<id>`.
    pub(crate) fn group_name(&self) -> String {
        format!("t{}", self.0)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TenantState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Dead = 3,
}

impl TenantState {
    fn from_u8(v: u8) -> TenantState {
        match v {
            0 => TenantState::Starting,
            1 => TenantState::Running,
            2 => TenantState::Stopping,
            _ => TenantState::Dead,
        }
    }
}

/// Monotonic state word: transitions only ever move forward through
/// Starting → Running → Stopping → Dead.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        StateCell(AtomicU8::new(TenantState::Starting as u8))
    }

    fn load(&self) -> TenantState {
        TenantState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Advances to `target` unless the state is already at or past it.
    /// Returns whether this call performed the transition.
    fn advance_to(&self, target: TenantState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >= target as u8 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// A named, policy-bearing container grouping threads for isolation and
/// accounting.
///
/// A tenant owns its cgroup ([`JGroup`], present iff CPU throttling is
/// enabled) and its default [`VirtualThreadContainer`]; both point back at
/// it only weakly. Thread membership is tracked in three collections:
/// platform threads that entered through [`Tenant::run_thread`] (held
/// weakly so an exited thread can be collected), plus live virtual and
/// carrier threads registered by the container hooks.
pub struct Tenant {
    id: TenantId,
    name: String,
    tenancy: Weak<Tenancy>,
    parent: Mutex<Weak<Tenant>>,
    state: StateCell,
    configuration: RwLock<TenantConfiguration>,
    jgroup: Mutex<Option<Arc<JGroup>>>,
    container: Mutex<Option<Arc<VirtualThreadContainer>>>,
    spawned: Mutex<Vec<Weak<ThreadHandle>>>,
    virtuals: Mutex<HashMap<u64, Arc<ThreadHandle>>>,
    carriers: Mutex<HashMap<u64, Arc<ThreadHandle>>>,
    /// CPU time of threads that already exited this tenant, in ns.
    exited_cpu_time_ns: AtomicI64,
    /// Readers: `run_thread` entry and `process_cpu_time`. Writer: destroy
    /// (and its watchdog). Write-held means no new thread may enter.
    pub(crate) destroy_lock: RwLock<()>,
    cleanup_done: AtomicBool,
}

impl Tenant {
    pub(crate) fn new(
        tenancy: &Arc<Tenancy>,
        id: TenantId,
        name: String,
        parent: Option<&Arc<Tenant>>,
        configuration: TenantConfiguration,
        jgroup: Option<Arc<JGroup>>,
    ) -> Arc<Tenant> {
        Arc::new(Tenant {
            id,
            name,
            tenancy: Arc::downgrade(tenancy),
            parent: Mutex::new(parent.map_or_else(Weak::new, Arc::downgrade)),
            state: StateCell::new(),
            configuration: RwLock::new(configuration),
            jgroup: Mutex::new(jgroup),
            container: Mutex::new(None),
            spawned: Mutex::new(Vec::new()),
            virtuals: Mutex::new(HashMap::new()),
            carriers: Mutex::new(HashMap::new()),
            exited_cpu_time_ns: AtomicI64::new(0),
            destroy_lock: RwLock::new(()),
            cleanup_done: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> TenantId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TenantState {
        self.state.load()
    }

    pub fn parent(&self) -> Option<Arc<Tenant>> {
        self.parent.lock().upgrade()
    }

    pub fn configuration(&self) -> TenantConfiguration {
        self.configuration.read().clone()
    }

    pub fn jgroup(&self) -> Option<Arc<JGroup>> {
        self.jgroup.lock().clone()
    }

    /// The tenant's default virtual-thread container. `None` once the
    /// tenant has been cleaned up.
    pub fn default_container(&self) -> Option<Arc<VirtualThreadContainer>> {
        self.container.lock().clone()
    }

    pub(crate) fn set_container(&self, container: Arc<VirtualThreadContainer>) {
        *self.container.lock() = Some(container);
    }

    pub(crate) fn tenancy(&self) -> Option<Arc<Tenancy>> {
        self.tenancy.upgrade()
    }

    /// Whether the calling thread currently runs attached to this tenant.
    pub fn contains_current_thread(&self) -> bool {
        crate::runtime::current_thread()
            .and_then(|handle| handle.attached_tenant())
            .is_some_and(|tenant| tenant.id == self.id)
    }

    /// Runs `f` on the calling thread *as* this tenant.
    ///
    /// The thread's previous attachment is restored on every exit path,
    /// including unwinds out of `f`.
    pub fn run<F, R>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        let tenancy = self.tenancy().ok_or(TenantError::DeadTenant(self.id))?;
        if self.state() == TenantState::Dead {
            return Err(TenantError::DeadTenant(self.id));
        }
        let handle = tenancy.ensure_current_thread();
        if let Some(current) = handle.attached_tenant() {
            if current.id == self.id {
                return Ok(f());
            }
            return Err(TenantError::CrossTenant { current: current.id, target: self.id });
        }

        if let Some(group) = self.jgroup() {
            group.attach()?;
        }
        handle.set_attached_tenant(Some(self));
        let _restore = scopeguard::guard((handle, tenancy), |(handle, tenancy)| {
            handle.set_attached_tenant(None);
            // Detaching means moving the OS thread back to the runtime's
            // own group.
            if let Some(jvm_group) = tenancy.jvm_group() {
                let _ = jvm_group.attach();
            }
        });
        Ok(f())
    }

    /// Entry point invoked when a thread belonging to this tenant starts
    /// executing its body. Returns whether the body ran.
    ///
    /// Entry takes the destroy lock for read without blocking. A carrier
    /// is allowed through even when destroy holds the lock: yielded virtual
    /// threads may still need re-mounting while the tenant drains.
    pub fn run_thread<F>(self: &Arc<Self>, f: F) -> bool
    where
        F: FnOnce(),
    {
        let Some(tenancy) = self.tenancy() else { return false };
        let handle = tenancy.ensure_current_thread();

        let entry_guard = self.destroy_lock.try_read();
        if entry_guard.is_none() && handle.kind() != ThreadKind::Carrier {
            log::info!(
                "tenant {} ({}) is shutting down; thread {} will not run",
                self.id,
                self.name,
                handle.name()
            );
            return false;
        }
        if self.state() == TenantState::Starting {
            self.state.advance_to(TenantState::Running);
        }
        if self.state() >= TenantState::Stopping {
            return false;
        }

        self.spawned.lock().push(Arc::downgrade(&handle));
        if let Some(group) = self.jgroup() {
            if let Err(e) = group.attach() {
                log::warn!("thread {} could not join tenant {} cgroup: {e}", handle.name(), self.id);
            }
        }
        handle.set_attached_tenant(Some(self));
        drop(entry_guard);

        let _exit = scopeguard::guard(
            (self.clone(), handle.clone(), tenancy),
            |(tenant, handle, tenancy)| {
                handle.set_attached_tenant(None);
                let cpu = tenancy.bridge().thread_cpu_time_ns(handle.tid());
                tenant.exited_cpu_time_ns.fetch_add(cpu, Ordering::AcqRel);
                tenant.remove_spawned(handle.tid());
            },
        );
        f();
        true
    }

    /// Replaces the tenant's resource limits and writes them through to its
    /// cgroup. Rejected once the tenant is stopping: its group is on the
    /// teardown path and a late write would race the evacuator.
    pub fn update(&self, configuration: TenantConfiguration) -> Result<()> {
        configuration.validate()?;
        if self.state() >= TenantState::Stopping {
            return Err(TenantError::DeadTenant(self.id));
        }
        let mut current = self.configuration.write();
        if let Some(group) = self.jgroup() {
            for limit in configuration.limits() {
                limit.sync(&group)?;
            }
        }
        *current = configuration;
        Ok(())
    }

    /// Total CPU time consumed by this tenant's platform threads, in
    /// nanoseconds: live threads (when the destroy lock is available) plus
    /// everything accumulated from already-exited threads.
    pub fn process_cpu_time(&self) -> Result<i64> {
        let tenancy = self.tenancy().ok_or(TenantError::DeadTenant(self.id))?;
        if !tenancy.features().cpu_accounting_enabled() {
            return Err(TenantError::FeatureDisabled("cpu accounting"));
        }
        let exited = self.exited_cpu_time_ns.load(Ordering::Acquire);
        match self.destroy_lock.try_read() {
            Some(_guard) => {
                let tids: Vec<u64> = self
                    .spawned
                    .lock()
                    .iter()
                    .filter_map(Weak::upgrade)
                    .filter(|handle| handle.is_alive())
                    .map(|handle| handle.tid())
                    .collect();
                Ok(exited + tenancy.bridge().threads_cpu_time_ns(&tids))
            }
            // A destroy is in flight; report what we know without blocking.
            None => Ok(exited),
        }
    }

    /// Accumulated `cpuacct` usage of the tenant's cgroup, when throttling
    /// is enabled and the controller is mounted.
    pub fn cpu_usage_ns(&self) -> Option<u64> {
        self.jgroup().and_then(|group| group.cpuacct_usage_ns())
    }

    /// Cooperatively destroys this tenant; see the crate docs for the full
    /// protocol. Returns `Ok(true)` once every tenant thread has exited and
    /// cleanup ran, `Ok(false)` when a watchdog took over.
    pub fn destroy(self: &Arc<Self>) -> Result<bool> {
        destroy::destroy_tenant(self)
    }

    pub(crate) fn advance_state(&self, target: TenantState) -> bool {
        self.state.advance_to(target)
    }

    /// CPU time already banked from threads that exited this tenant, in
    /// nanoseconds.
    pub fn exited_cpu_time(&self) -> i64 {
        self.exited_cpu_time_ns.load(Ordering::Acquire)
    }

    // Thread-collection plumbing used by the container hooks and the
    // termination engine.

    pub(crate) fn add_carrier(&self, handle: &Arc<ThreadHandle>) {
        self.carriers.lock().insert(handle.tid(), handle.clone());
    }

    pub(crate) fn remove_carrier(&self, tid: u64) {
        self.carriers.lock().remove(&tid);
    }

    pub(crate) fn add_virtual(&self, handle: &Arc<ThreadHandle>) {
        self.virtuals.lock().insert(handle.tid(), handle.clone());
    }

    pub(crate) fn remove_virtual(&self, tid: u64) {
        self.virtuals.lock().remove(&tid);
    }

    pub(crate) fn remove_spawned(&self, tid: u64) {
        self.spawned
            .lock()
            .retain(|weak| weak.upgrade().is_some_and(|handle| handle.tid() != tid));
    }

    pub(crate) fn platform_threads(&self) -> Vec<Arc<ThreadHandle>> {
        self.spawned
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|handle| handle.is_alive())
            .collect()
    }

    pub(crate) fn carrier_threads(&self) -> Vec<Arc<ThreadHandle>> {
        self.carriers.lock().values().filter(|h| h.is_alive()).cloned().collect()
    }

    pub(crate) fn virtual_threads(&self) -> Vec<Arc<ThreadHandle>> {
        self.virtuals.lock().values().filter(|h| h.is_alive()).cloned().collect()
    }

    /// Drops collection entries whose threads are gone or terminated.
    pub(crate) fn purge_dead_threads(&self) {
        self.spawned
            .lock()
            .retain(|weak| weak.upgrade().is_some_and(|handle| handle.is_alive()));
        self.virtuals.lock().retain(|_, handle| handle.is_alive());
        self.carriers.lock().retain(|_, handle| handle.is_alive());
    }

    pub(crate) fn thread_sets_empty(&self) -> bool {
        self.platform_threads().is_empty()
            && self.virtual_threads().is_empty()
            && self.carrier_threads().is_empty()
    }

    pub(crate) fn clear_thread_collections(&self) {
        self.spawned.lock().clear();
        self.virtuals.lock().clear();
        self.carriers.lock().clear();
    }

    pub(crate) fn take_jgroup(&self) -> Option<Arc<JGroup>> {
        self.jgroup.lock().take()
    }

    pub(crate) fn take_container(&self) -> Option<Arc<VirtualThreadContainer>> {
        self.container.lock().take()
    }

    pub(crate) fn drop_parent_link(&self) {
        *self.parent.lock() = Weak::new();
    }

    /// Claims the cleanup phase; only the first caller gets `true`.
    pub(crate) fn claim_cleanup(&self) -> bool {
        !self.cleanup_done.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenant")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::MountTable;
    use crate::runtime::Tenancy;
    use crate::Features;
    use assert_matches::assert_matches;

    #[test]
    fn state_transitions_are_monotonic() {
        let state = StateCell::new();
        assert_eq!(state.load(), TenantState::Starting);
        assert!(state.advance_to(TenantState::Running));
        assert!(state.advance_to(TenantState::Dead));
        // No way back.
        assert!(!state.advance_to(TenantState::Running));
        assert!(!state.advance_to(TenantState::Stopping));
        assert_eq!(state.load(), TenantState::Dead);
    }

    #[test]
    fn group_name_uses_tenant_id() {
        assert_eq!(TenantId::new(42).group_name(), "t42");
    }

    #[test]
    fn update_round_trips_through_accessors() {
        let dir = tempfile::tempdir().unwrap();
        let tenancy = Tenancy::builder()
            .features(Features::MULTI_TENANT | Features::CPU_THROTTLING)
            .mount_table(Arc::new(MountTable::with_root(dir.path())))
            .build()
            .unwrap();
        let tenant = tenancy
            .create_tenant(TenantConfiguration::new().name("upd").limit_cpu_shares(128))
            .unwrap();

        tenant
            .update(TenantConfiguration::new().limit_cpu_shares(512).limit_cpu_cfs(100_000, 50_000))
            .unwrap();

        let config = tenant.configuration();
        assert_eq!(config.cpu_shares(), Some(512));
        assert_eq!(config.cpu_cfs(), Some((100_000, 50_000)));
        let group = tenant.jgroup().unwrap();
        assert_eq!(group.get_value("cpu.shares").unwrap().as_deref(), Some("512"));
        assert_eq!(group.get_value("cpu.cfs_quota_us").unwrap().as_deref(), Some("50000"));
    }

    #[test]
    fn update_validates_limits() {
        let tenancy = Tenancy::builder().features(Features::MULTI_TENANT).build().unwrap();
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        assert_matches!(
            tenant.update(TenantConfiguration::new().limit_cpu_cfs(999, 1_000)),
            Err(TenantError::BadArgument(_))
        );
    }

    #[test]
    fn update_is_rejected_once_stopping() {
        let tenancy = Tenancy::builder()
            .features(Features::MULTI_TENANT | Features::THREAD_STOP)
            .build()
            .unwrap();
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        tenant.destroy().unwrap();
        assert_matches!(
            tenant.update(TenantConfiguration::new().limit_cpu_shares(1)),
            Err(TenantError::DeadTenant(_))
        );
    }
}
