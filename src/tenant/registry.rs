// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::runtime::ThreadHandle;
use crate::sched::BoundedVirtualExecutor;
use crate::tenant::{Tenant, TenantId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Decides whether a thread created inside `tenant` inherits it.
/// Arguments: creator thread, new thread, current tenant.
pub type NewThreadPredicate =
    dyn Fn(&ThreadHandle, &ThreadHandle, &Arc<Tenant>) -> bool + Send + Sync;

/// Decides whether an executor created inside `tenant` inherits it.
/// Arguments: creator thread, executor, current tenant.
pub type NewPoolPredicate =
    dyn Fn(&ThreadHandle, &BoundedVirtualExecutor, &Arc<Tenant>) -> bool + Send + Sync;

/// Decides whether a pool worker inherits the pool's tenant. Arguments:
/// new thread, executor, current tenant, tenant the pool inherited.
pub type PoolThreadPredicate = dyn Fn(&ThreadHandle, &BoundedVirtualExecutor, &Arc<Tenant>, Option<&Arc<Tenant>>) -> bool
    + Send
    + Sync;

/// The process-wide id→tenant map plus the pluggable inheritance policy.
///
/// Tenants are inserted at creation and removed when they enter `Stopping`;
/// lookups after that point fail even though the tenant object is still
/// winding down. Ids are monotonic and never reused.
pub(crate) struct TenantRegistry {
    tenants: Mutex<HashMap<u64, Arc<Tenant>>>,
    next_id: AtomicU64,
    new_thread_predicate: RwLock<Option<Arc<NewThreadPredicate>>>,
    new_pool_predicate: RwLock<Option<Arc<NewPoolPredicate>>>,
    pool_thread_predicate: RwLock<Option<Arc<PoolThreadPredicate>>>,
}

impl TenantRegistry {
    pub(crate) fn new() -> Self {
        TenantRegistry {
            tenants: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            new_thread_predicate: RwLock::new(None),
            new_pool_predicate: RwLock::new(None),
            pool_thread_predicate: RwLock::new(None),
        }
    }

    pub(crate) fn allocate_id(&self) -> TenantId {
        TenantId::new(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    pub(crate) fn insert(&self, tenant: &Arc<Tenant>) {
        self.tenants.lock().insert(tenant.id().raw(), tenant.clone());
    }

    pub(crate) fn remove(&self, id: TenantId) {
        self.tenants.lock().remove(&id.raw());
    }

    pub(crate) fn get(&self, id: TenantId) -> Option<Arc<Tenant>> {
        self.tenants.lock().get(&id.raw()).cloned()
    }

    pub(crate) fn ids(&self) -> Vec<TenantId> {
        let mut ids: Vec<_> = self.tenants.lock().keys().map(|id| TenantId::new(*id)).collect();
        ids.sort();
        ids
    }

    pub(crate) fn install_new_thread_predicate(&self, p: Option<Arc<NewThreadPredicate>>) {
        *self.new_thread_predicate.write() = p;
    }

    pub(crate) fn install_new_pool_predicate(&self, p: Option<Arc<NewPoolPredicate>>) {
        *self.new_pool_predicate.write() = p;
    }

    pub(crate) fn install_pool_thread_predicate(&self, p: Option<Arc<PoolThreadPredicate>>) {
        *self.pool_thread_predicate.write() = p;
    }

    /// Whether `new_thread`, created by `creator` while `tenant` was
    /// current, inherits the tenant.
    pub(crate) fn should_inherit_thread(
        &self,
        creator: &ThreadHandle,
        new_thread: &ThreadHandle,
        tenant: &Arc<Tenant>,
    ) -> bool {
        if new_thread.is_system() || !creator.inherits_tenant() {
            return false;
        }
        match self.new_thread_predicate.read().clone() {
            Some(predicate) => predicate(creator, new_thread, tenant),
            None => true,
        }
    }

    pub(crate) fn should_inherit_pool(
        &self,
        creator: &ThreadHandle,
        executor: &BoundedVirtualExecutor,
        tenant: &Arc<Tenant>,
    ) -> bool {
        if !creator.inherits_tenant() {
            return false;
        }
        match self.new_pool_predicate.read().clone() {
            Some(predicate) => predicate(creator, executor, tenant),
            None => true,
        }
    }

    /// Pool workers of a tenant-owned executor are stamped with the
    /// executor's tenant regardless of any installed predicate; the
    /// predicate only applies to pools with an *inherited* tenant.
    pub(crate) fn should_stamp_pool_thread(
        &self,
        new_thread: &ThreadHandle,
        executor: &BoundedVirtualExecutor,
        tenant: &Arc<Tenant>,
        pool_inherited: Option<&Arc<Tenant>>,
    ) -> bool {
        if pool_inherited.is_none() {
            return true;
        }
        match self.pool_thread_predicate.read().clone() {
            Some(predicate) => predicate(new_thread, executor, tenant, pool_inherited),
            None => true,
        }
    }
}
