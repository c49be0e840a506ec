// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod carrier;
mod executor;
mod vthread;

pub use carrier::SchedulerConfig;
pub use executor::{BoundedVirtualExecutor, ExecutorState, RejectionPolicy};
pub use vthread::VirtualThread;

use crate::errors::{Result, TenantError};
use crate::runtime::{Tenancy, ThreadHandle, ThreadKind, VIRTUAL_TID_BASE};
use crate::tenant::{Tenant, TenantState};
use carrier::CarrierPool;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Registry of the carrier and virtual threads belonging to one tenant (or
/// to the root, for a container with no tenant).
///
/// The container supplies the scheduler (a lazily-created carrier pool)
/// and the start/exit hooks that keep the tenant's thread collections in
/// sync with what is actually running.
pub struct VirtualThreadContainer {
    tenancy: Weak<Tenancy>,
    tenant: Weak<Tenant>,
    /// Whether the tenant binding was inherited from the creating thread
    /// (as opposed to a tenant-owned default container). Only inherited
    /// bindings are subject to the pool-thread predicate.
    inherited: bool,
    /// Executor owning this container, when there is one; consulted for the
    /// pool-thread predicate.
    executor: Mutex<Weak<BoundedVirtualExecutor>>,
    config: SchedulerConfig,
    pool: OnceCell<Arc<CarrierPool>>,
    carriers: Mutex<HashMap<u64, Arc<ThreadHandle>>>,
    virtuals: Mutex<HashMap<u64, Arc<ThreadHandle>>>,
    vthreads: Mutex<HashMap<u64, Arc<VirtualThread>>>,
    closed: AtomicBool,
}

impl VirtualThreadContainer {
    /// Creates a container bound to no tenant: its virtual threads run in
    /// the root.
    pub fn new(tenancy: &Arc<Tenancy>, config: SchedulerConfig) -> Arc<VirtualThreadContainer> {
        Self::build(tenancy, None, false, config)
    }

    pub(crate) fn new_for_tenant(
        tenancy: &Arc<Tenancy>,
        tenant: &Arc<Tenant>,
        config: SchedulerConfig,
    ) -> Arc<VirtualThreadContainer> {
        Self::build(tenancy, Some(tenant), false, config)
    }

    pub(crate) fn new_inherited(
        tenancy: &Arc<Tenancy>,
        tenant: Option<&Arc<Tenant>>,
        config: SchedulerConfig,
    ) -> Arc<VirtualThreadContainer> {
        Self::build(tenancy, tenant, tenant.is_some(), config)
    }

    fn build(
        tenancy: &Arc<Tenancy>,
        tenant: Option<&Arc<Tenant>>,
        inherited: bool,
        config: SchedulerConfig,
    ) -> Arc<VirtualThreadContainer> {
        let container = Arc::new(VirtualThreadContainer {
            tenancy: Arc::downgrade(tenancy),
            tenant: tenant.map_or_else(Weak::new, Arc::downgrade),
            inherited,
            executor: Mutex::new(Weak::new()),
            config,
            pool: OnceCell::new(),
            carriers: Mutex::new(HashMap::new()),
            virtuals: Mutex::new(HashMap::new()),
            vthreads: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        tenancy.register_container(&container);
        container
    }

    pub fn tenant(&self) -> Option<Arc<Tenant>> {
        self.tenant.upgrade()
    }

    pub(crate) fn tenancy(&self) -> Option<Arc<Tenancy>> {
        self.tenancy.upgrade()
    }

    pub(crate) fn set_executor(&self, executor: &Arc<BoundedVirtualExecutor>) {
        *self.executor.lock() = Arc::downgrade(executor);
    }

    pub(crate) fn label(&self) -> String {
        match self.tenant() {
            Some(tenant) => tenant.name().to_string(),
            None => "root".to_string(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        self.config
    }

    /// Starts a virtual thread in this container.
    ///
    /// The thread is stamped with the container's tenant before it first
    /// mounts, and is registered in the tenant's virtual set before the
    /// body can run.
    pub fn spawn_virtual<F>(self: &Arc<Self>, f: F) -> Result<Arc<VirtualThread>>
    where
        F: FnOnce() + Send + 'static,
    {
        let vthread = self.prepare_virtual(Box::new(f))?;
        self.commit_virtual(&vthread)?;
        Ok(vthread)
    }

    /// Builds and registers a virtual thread without scheduling it yet, so
    /// a caller can attach exit hooks that are guaranteed to see the exit.
    pub(crate) fn prepare_virtual(
        self: &Arc<Self>,
        body: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<VirtualThread>> {
        let tenancy = self.tenancy().ok_or(TenantError::Rejected)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(TenantError::Rejected);
        }
        let tenant = self.tenant();
        if let Some(tenant) = &tenant {
            if tenant.state() >= TenantState::Stopping {
                return Err(TenantError::DeadTenant(tenant.id()));
            }
        }

        let tid = tenancy.allocate_virtual_tid();
        let name = format!("vthread-{}", tid & !VIRTUAL_TID_BASE);
        // The inheritance flag rides along through spawn helpers; with no
        // registered creator it defaults from the process config.
        let inherit = crate::runtime::current_thread()
            .map(|creator| creator.inherits_tenant())
            .unwrap_or(tenancy.config().thread_inheritance);
        let handle = ThreadHandle::new(tid, ThreadKind::Virtual, name, inherit);
        if let Some(tenant) = &tenant {
            handle.set_inherited_tenant(Some(tenant));
            handle.set_attached_tenant(Some(tenant));
        }
        tenancy.thread_table().insert(&handle);
        self.on_start(&handle);

        let vthread = VirtualThread::new(handle, body);
        self.vthreads.lock().insert(tid, vthread.clone());
        Ok(vthread)
    }

    /// Schedules a prepared virtual thread onto the carrier pool. On
    /// failure the thread is retired (its exit hooks run) and the
    /// submission error is returned.
    pub(crate) fn commit_virtual(self: &Arc<Self>, vthread: &Arc<VirtualThread>) -> Result<()> {
        if !self.pool().submit(vthread.clone()) {
            vthread.retire(self);
            return Err(TenantError::Rejected);
        }
        Ok(())
    }

    fn pool(self: &Arc<Self>) -> Arc<CarrierPool> {
        self.pool.get_or_init(|| CarrierPool::new(self, self.config)).clone()
    }

    /// Hook invoked when a thread of this container starts.
    pub(crate) fn on_start(&self, handle: &Arc<ThreadHandle>) {
        match handle.kind() {
            ThreadKind::Virtual => {
                self.virtuals.lock().insert(handle.tid(), handle.clone());
                if let Some(tenant) = self.tenant() {
                    tenant.add_virtual(handle);
                }
            }
            ThreadKind::Carrier => {
                self.carriers.lock().insert(handle.tid(), handle.clone());
                if let Some(tenant) = self.tenant() {
                    tenant.add_carrier(handle);
                }
            }
            ThreadKind::Platform => {}
        }
    }

    /// Hook invoked when a thread of this container exits.
    pub(crate) fn on_exit(&self, handle: &Arc<ThreadHandle>) {
        match handle.kind() {
            ThreadKind::Virtual => {
                handle.mark_terminated();
                self.virtuals.lock().remove(&handle.tid());
                self.vthreads.lock().remove(&handle.tid());
                if let Some(tenant) = self.tenant() {
                    tenant.remove_virtual(handle.tid());
                }
            }
            ThreadKind::Carrier => {
                self.carriers.lock().remove(&handle.tid());
                if let Some(tenant) = self.tenant() {
                    tenant.remove_carrier(handle.tid());
                }
            }
            ThreadKind::Platform => {}
        }
        if let Some(tenancy) = self.tenancy() {
            tenancy.thread_table().remove(handle.tid());
        }
    }

    /// Live threads of this container, carriers and virtuals alike.
    pub fn threads(&self) -> Vec<Arc<ThreadHandle>> {
        self.carriers
            .lock()
            .values()
            .chain(self.virtuals.lock().values())
            .filter(|handle| handle.is_alive())
            .cloned()
            .collect()
    }

    pub fn thread_count(&self) -> usize {
        self.threads().len()
    }

    pub(crate) fn interrupt(&self, handle: &ThreadHandle) {
        if let Some(tenancy) = self.tenancy() {
            tenancy.bridge().interrupt(handle);
        }
    }

    /// Whether a new carrier gets the container's tenant stamped on it.
    /// Tenant-owned containers always stamp; inherited ones ask the
    /// pool-thread predicate.
    pub(crate) fn should_stamp_carrier(
        &self,
        handle: &Arc<ThreadHandle>,
        tenant: &Arc<Tenant>,
    ) -> bool {
        if !self.inherited {
            return true;
        }
        let Some(tenancy) = self.tenancy() else { return true };
        match self.executor.lock().upgrade() {
            Some(executor) => tenancy.registry().should_stamp_pool_thread(
                handle,
                &executor,
                tenant,
                Some(tenant),
            ),
            None => true,
        }
    }

    /// Stops accepting virtual threads, closes the carrier run queue, and
    /// retires anything that never got mounted. Deregisters the container
    /// from the process-wide directory.
    pub fn shut_down(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = self.pool.get() {
            for orphan in pool.shut_down() {
                orphan.retire(self);
            }
        }
        if let Some(tenancy) = self.tenancy() {
            tenancy.deregister_container(self);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for VirtualThreadContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualThreadContainer")
            .field("label", &self.label())
            .field("closed", &self.is_closed())
            .finish()
    }
}
