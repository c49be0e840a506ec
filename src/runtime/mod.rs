// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod bridge;
mod thread;

pub use bridge::{HostBridge, PriorityLevel, RuntimeBridge};
pub use thread::{
    current_thread, interruptible_sleep, os_thread_id, safepoint, ShutdownMask, TenantDeath,
    ThreadHandle, ThreadKind, ThreadState, WakeReason,
};
pub(crate) use thread::{adopt_current, enter_thread, ThreadTable, VIRTUAL_TID_BASE};

use crate::cgroup::{JGroup, MountTable};
use crate::config::TenancyConfig;
use crate::errors::{Result, TenantError};
use crate::features::Features;
use crate::policy::TenantConfiguration;
use crate::sched::{SchedulerConfig, VirtualThreadContainer};
use crate::tenant::{
    NewPoolPredicate, NewThreadPredicate, PoolThreadPredicate, Tenant, TenantId, TenantRegistry,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

static GLOBAL: OnceLock<Arc<Tenancy>> = OnceLock::new();

/// The process-wide tenancy state: feature word, configuration, cgroup
/// mount table, tenant registry, thread table, and the runtime bridge.
///
/// In production there is one instance, installed once via
/// [`Tenancy::init`] and never replaced. Unit tests construct private
/// instances directly through [`Tenancy::builder`], so multiple instances
/// can coexist in one test process.
pub struct Tenancy {
    features: Features,
    config: TenancyConfig,
    mounts: Option<Arc<MountTable>>,
    /// The runtime's own cgroup; every tenant group is created under it and
    /// detached threads return to it.
    jvm_group: Option<Arc<JGroup>>,
    registry: TenantRegistry,
    threads: ThreadTable,
    bridge: Arc<dyn RuntimeBridge>,
    /// Directory of live virtual-thread containers.
    containers: Mutex<Vec<Weak<VirtualThreadContainer>>>,
    next_virtual_tid: AtomicU64,
}

impl Tenancy {
    pub fn builder() -> TenancyBuilder {
        TenancyBuilder::default()
    }

    /// Installs the process-wide instance. Called once at runtime startup;
    /// later calls return the existing instance.
    ///
    /// A failure to set up the runtime's cgroup is unrecoverable at this
    /// point: the process is configured for throttling it cannot provide.
    pub fn init(builder: TenancyBuilder) -> &'static Arc<Tenancy> {
        GLOBAL.get_or_init(|| match builder.build() {
            Ok(tenancy) => tenancy,
            Err(e) => {
                log::error!("tenancy initialization failed: {e}");
                std::process::exit(128);
            }
        })
    }

    pub fn global() -> Option<&'static Arc<Tenancy>> {
        GLOBAL.get()
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<dyn RuntimeBridge> {
        &self.bridge
    }

    pub fn mounts(&self) -> Option<&Arc<MountTable>> {
        self.mounts.as_ref()
    }

    pub fn jvm_group(&self) -> Option<Arc<JGroup>> {
        self.jvm_group.clone()
    }

    /// Creates a tenant at the top of the forest.
    pub fn create_tenant(
        self: &Arc<Self>,
        configuration: TenantConfiguration,
    ) -> Result<Arc<Tenant>> {
        self.create_tenant_inner(None, configuration)
    }

    /// Creates a tenant nested under `parent`; its cgroup lives inside the
    /// parent's directory.
    pub fn create_tenant_under(
        self: &Arc<Self>,
        parent: &Arc<Tenant>,
        configuration: TenantConfiguration,
    ) -> Result<Arc<Tenant>> {
        self.create_tenant_inner(Some(parent), configuration)
    }

    fn create_tenant_inner(
        self: &Arc<Self>,
        parent: Option<&Arc<Tenant>>,
        configuration: TenantConfiguration,
    ) -> Result<Arc<Tenant>> {
        if !self.features.multi_tenant_enabled() {
            return Err(TenantError::FeatureDisabled("multi-tenant"));
        }
        configuration.validate()?;

        let id = self.registry.allocate_id();
        let name =
            configuration.configured_name().map_or_else(|| format!("tenant-{id}"), str::to_string);

        let jgroup = if self.features.cpu_throttling_enabled() {
            let mounts = self.mounts.clone().expect("throttling implies a mount table");
            let parent_group = match parent {
                Some(parent) => parent.jgroup(),
                None => self.jvm_group(),
            };
            let group = JGroup::create(mounts, parent_group.as_ref(), &id.group_name())?;
            for limit in configuration.limits() {
                limit.sync(&group)?;
            }
            Some(group)
        } else {
            None
        };

        let tenant = Tenant::new(self, id, name, parent, configuration, jgroup);
        let container = VirtualThreadContainer::new_for_tenant(self, &tenant, SchedulerConfig::new());
        tenant.set_container(container);
        self.registry.insert(&tenant);
        log::debug!("created tenant {} ({})", tenant.id(), tenant.name());
        Ok(tenant)
    }

    pub fn tenant(&self, id: TenantId) -> Option<Arc<Tenant>> {
        self.registry.get(id)
    }

    pub fn tenant_ids(&self) -> Vec<TenantId> {
        self.registry.ids()
    }

    /// The tenant the calling thread is attached to, if any.
    pub fn attached_tenant(&self) -> Option<Arc<Tenant>> {
        current_thread().and_then(|handle| handle.attached_tenant())
    }

    /// Resolves a live thread handle by its OS (or virtual) thread id.
    pub fn thread(&self, tid: u64) -> Option<Arc<ThreadHandle>> {
        self.threads.get(tid)
    }

    /// Spawns an OS thread through the tenancy layer.
    ///
    /// If the calling thread is attached to a tenant, its inheritance flag
    /// and the installed new-thread predicate decide whether the child is
    /// stamped with the tenant; a stamped child executes `f` through
    /// [`Tenant::run_thread`].
    pub fn spawn_thread<F>(
        self: &Arc<Self>,
        name: impl Into<String>,
        f: F,
    ) -> std::io::Result<std::thread::JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let creator = self.ensure_current_thread();
        let creator_tenant = creator.attached_tenant();
        let tenancy = self.clone();
        let inherit_default = self.config.thread_inheritance;
        std::thread::Builder::new().name(name.clone()).spawn(move || {
            let handle =
                ThreadHandle::new(os_thread_id(), ThreadKind::Platform, name, inherit_default);
            let inherited = creator_tenant
                .filter(|tenant| tenancy.registry.should_inherit_thread(&creator, &handle, tenant));
            handle.set_inherited_tenant(inherited.as_ref());
            tenancy.threads.insert(&handle);
            adopt_current(handle.clone());
            match inherited {
                Some(tenant) => {
                    tenant.run_thread(f);
                }
                None => f(),
            }
            tenancy.threads.remove(handle.tid());
            handle.mark_terminated();
        })
    }

    /// Overrides the calling thread's inheritance flag. Only allowed when
    /// per-thread overrides are enabled process-wide.
    pub fn set_current_thread_inheritance(self: &Arc<Self>, inherit: bool) -> Result<()> {
        if !self.config.allow_per_thread_inheritance {
            return Err(TenantError::FeatureDisabled("per-thread inheritance"));
        }
        self.ensure_current_thread().set_inherits_tenant(inherit);
        Ok(())
    }

    /// Registers the calling thread as a system thread: it participates in
    /// bookkeeping but never inherits a tenant.
    pub fn register_system_thread(self: &Arc<Self>) -> Arc<ThreadHandle> {
        if let Some(handle) = current_thread() {
            return handle;
        }
        let name = std::thread::current().name().unwrap_or("<system>").to_string();
        let handle = ThreadHandle::new_system(os_thread_id(), name);
        self.threads.insert(&handle);
        adopt_current(handle.clone());
        handle
    }

    pub fn install_new_thread_predicate(&self, predicate: Option<Arc<NewThreadPredicate>>) {
        self.registry.install_new_thread_predicate(predicate);
    }

    pub fn install_new_pool_predicate(&self, predicate: Option<Arc<NewPoolPredicate>>) {
        self.registry.install_new_pool_predicate(predicate);
    }

    pub fn install_pool_thread_predicate(&self, predicate: Option<Arc<PoolThreadPredicate>>) {
        self.registry.install_pool_thread_predicate(predicate);
    }

    /// Process-exit teardown: releases the runtime's own cgroup directory.
    pub fn shutdown(&self) {
        if let Some(group) = &self.jvm_group {
            group.destroy();
        }
    }

    /// Registers the calling thread, creating a platform handle for
    /// threads that arrive from outside the tenancy layer.
    pub(crate) fn ensure_current_thread(self: &Arc<Self>) -> Arc<ThreadHandle> {
        if let Some(handle) = current_thread() {
            return handle;
        }
        let name = std::thread::current().name().unwrap_or("<unregistered>").to_string();
        let handle = ThreadHandle::new(
            os_thread_id(),
            ThreadKind::Platform,
            name,
            self.config.thread_inheritance,
        );
        self.threads.insert(&handle);
        adopt_current(handle.clone());
        handle
    }

    pub(crate) fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub(crate) fn remove_tenant(&self, id: TenantId) {
        self.registry.remove(id);
    }

    pub(crate) fn thread_table(&self) -> &ThreadTable {
        &self.threads
    }

    pub(crate) fn allocate_virtual_tid(&self) -> u64 {
        VIRTUAL_TID_BASE | self.next_virtual_tid.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn register_container(&self, container: &Arc<VirtualThreadContainer>) {
        let mut containers = self.containers.lock();
        containers.retain(|weak| weak.strong_count() > 0);
        containers.push(Arc::downgrade(container));
    }

    pub(crate) fn deregister_container(&self, container: &Arc<VirtualThreadContainer>) {
        self.containers
            .lock()
            .retain(|weak| !weak.ptr_eq(&Arc::downgrade(container)) && weak.strong_count() > 0);
    }

    /// Live containers, for diagnostics.
    pub fn containers(&self) -> Vec<Arc<VirtualThreadContainer>> {
        self.containers.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

impl std::fmt::Debug for Tenancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenancy").field("features", &self.features).finish()
    }
}

/// Builder for [`Tenancy`]. With CPU throttling enabled, `build` discovers
/// the cgroup mount table (unless one is injected), creates the runtime's
/// group at `<root_group>/<jdk_group>/<pid>`, and moves the calling thread
/// into it.
#[derive(Default)]
pub struct TenancyBuilder {
    features: Features,
    config: TenancyConfig,
    bridge: Option<Arc<dyn RuntimeBridge>>,
    mounts: Option<Arc<MountTable>>,
}

impl TenancyBuilder {
    pub fn features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn config(mut self, config: TenancyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bridge(mut self, bridge: Arc<dyn RuntimeBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Overrides mount discovery; used by tests and single-hierarchy
    /// setups.
    pub fn mount_table(mut self, mounts: Arc<MountTable>) -> Self {
        self.mounts = Some(mounts);
        self
    }

    pub fn build(self) -> Result<Arc<Tenancy>> {
        let features = self.features.normalized();
        let config = self.config;
        let bridge = self.bridge.unwrap_or_else(|| Arc::new(HostBridge::new()));

        let (mounts, jvm_group) = if features.cpu_throttling_enabled() {
            let mounts = match self.mounts {
                Some(mounts) => mounts,
                None => Arc::new(MountTable::discover().map_err(|source| {
                    TenantError::CgroupSetup { path: PathBuf::from("/proc/self/mounts"), source }
                })?),
            };
            let path = runtime_group_path(&config);
            let group = JGroup::create(mounts.clone(), None, &path.to_string_lossy())?;
            group.attach()?;
            (Some(mounts), Some(group))
        } else {
            (None, None)
        };

        Ok(Arc::new(Tenancy {
            features,
            config,
            mounts,
            jvm_group,
            registry: TenantRegistry::new(),
            threads: ThreadTable::default(),
            bridge,
            containers: Mutex::new(Vec::new()),
            next_virtual_tid: AtomicU64::new(1),
        }))
    }
}

fn runtime_group_path(config: &TenancyConfig) -> PathBuf {
    let mut path = PathBuf::new();
    for component in config.root_group.split('/').filter(|c| !c.is_empty()) {
        path.push(component);
    }
    path.push(&config.jdk_group);
    path.push(std::process::id().to_string());
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantState;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicBool;

    fn plain_tenancy() -> Arc<Tenancy> {
        Tenancy::builder()
            .features(Features::MULTI_TENANT | Features::THREAD_STOP)
            .build()
            .unwrap()
    }

    fn throttled_tenancy() -> (tempfile::TempDir, Arc<Tenancy>) {
        let dir = tempfile::tempdir().unwrap();
        let mounts = Arc::new(MountTable::with_root(dir.path()));
        let tenancy = Tenancy::builder()
            .features(Features::MULTI_TENANT | Features::CPU_THROTTLING | Features::THREAD_STOP)
            .mount_table(mounts)
            .build()
            .unwrap();
        (dir, tenancy)
    }

    #[test]
    fn create_without_multi_tenant_is_rejected() {
        let tenancy = Tenancy::builder().features(Features::empty()).build().unwrap();
        assert_matches!(
            tenancy.create_tenant(TenantConfiguration::new()),
            Err(TenantError::FeatureDisabled(_))
        );
    }

    #[test]
    fn tenant_ids_are_monotonic_and_registered() {
        let tenancy = plain_tenancy();
        let a = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        let b = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        assert!(b.id() > a.id());
        assert_eq!(tenancy.tenant(a.id()).unwrap().id(), a.id());
        assert_eq!(tenancy.tenant_ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn throttled_tenant_gets_cgroup_with_limits() {
        let (dir, tenancy) = throttled_tenancy();
        let tenant = tenancy
            .create_tenant(TenantConfiguration::new().name("T1").limit_cpu_shares(512))
            .unwrap();
        let group = tenant.jgroup().unwrap();
        assert_eq!(group.get_value("cpu.shares").unwrap().as_deref(), Some("512"));

        let runtime_dir = dir
            .path()
            .join(&tenancy.config().jdk_group)
            .join(std::process::id().to_string());
        assert!(runtime_dir.join(tenant.id().group_name()).is_dir());
    }

    #[test]
    fn nested_tenant_cgroup_paths_stack() {
        let (_dir, tenancy) = throttled_tenancy();
        let parent = tenancy.create_tenant(TenantConfiguration::new().name("A")).unwrap();
        let child = tenancy.create_tenant_under(&parent, TenantConfiguration::new().name("B")).unwrap();
        let child_path = child.jgroup().unwrap().relative_path().to_path_buf();
        assert!(child_path.ends_with(format!(
            "{}/{}",
            parent.id().group_name(),
            child.id().group_name()
        )));
        assert_eq!(child.parent().unwrap().id(), parent.id());
    }

    #[test]
    fn run_executes_inline_within_same_tenant() {
        let tenancy = plain_tenancy();
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        let nested = tenant.clone();
        let value = tenant.run(move || nested.run(|| 7).unwrap()).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn run_rejects_cross_tenant_entry() {
        let tenancy = plain_tenancy();
        let first = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        let second = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        let target = second.clone();
        let result = first.run(move || target.run(|| ())).unwrap();
        assert_matches!(result, Err(TenantError::CrossTenant { .. }));
    }

    #[test]
    fn run_restores_attachment_on_panic() {
        let tenancy = plain_tenancy();
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = tenant.run(|| panic!("boom"));
        }));
        assert!(panicked.is_err());
        assert!(tenancy.attached_tenant().is_none());
    }

    #[test]
    fn run_after_destroy_is_rejected() {
        let tenancy = plain_tenancy();
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        tenant.destroy().unwrap();
        assert_matches!(tenant.run(|| ()), Err(TenantError::DeadTenant(_)));
    }

    #[test]
    fn spawned_thread_inherits_tenant() {
        let tenancy = plain_tenancy();
        let tenant = tenancy.create_tenant(TenantConfiguration::new().name("inherit")).unwrap();
        let observed = Arc::new(Mutex::new(None));

        let handle = {
            let tenancy = tenancy.clone();
            let observed = observed.clone();
            tenant
                .run(move || {
                    tenancy.spawn_thread("worker", move || {
                        *observed.lock() =
                            current_thread().and_then(|h| h.attached_tenant()).map(|t| t.id());
                    })
                })
                .unwrap()
                .unwrap()
        };
        handle.join().unwrap();
        assert_eq!(*observed.lock(), Some(tenant.id()));
    }

    #[test]
    fn new_thread_predicate_can_veto_inheritance() {
        let tenancy = plain_tenancy();
        tenancy.install_new_thread_predicate(Some(Arc::new(|_, _, _| false)));
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        let observed = Arc::new(AtomicBool::new(true));

        let handle = {
            let tenancy = tenancy.clone();
            let observed = observed.clone();
            tenant
                .run(move || {
                    tenancy.spawn_thread("vetoed", move || {
                        let attached =
                            current_thread().and_then(|h| h.attached_tenant()).is_some();
                        observed.store(attached, std::sync::atomic::Ordering::Release);
                    })
                })
                .unwrap()
                .unwrap()
        };
        handle.join().unwrap();
        assert!(!observed.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn per_thread_inheritance_override_is_gated() {
        let tenancy = Tenancy::builder()
            .features(Features::MULTI_TENANT)
            .config(TenancyConfig::from_pairs([(
                "tenant.allow_per_thread_inheritance",
                "false",
            )]))
            .build()
            .unwrap();
        assert_matches!(
            tenancy.set_current_thread_inheritance(false),
            Err(TenantError::FeatureDisabled(_))
        );
    }

    #[test]
    fn disabled_inheritance_flag_stops_stamping() {
        let tenancy = plain_tenancy();
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        let observed = Arc::new(AtomicBool::new(true));

        let handle = {
            let tenancy = tenancy.clone();
            let observed = observed.clone();
            tenant
                .run(move || {
                    tenancy.set_current_thread_inheritance(false).unwrap();
                    let spawned = tenancy.spawn_thread("no-inherit", {
                        let observed = observed.clone();
                        move || {
                            let attached =
                                current_thread().and_then(|h| h.attached_tenant()).is_some();
                            observed.store(attached, std::sync::atomic::Ordering::Release);
                        }
                    });
                    tenancy.set_current_thread_inheritance(true).unwrap();
                    spawned
                })
                .unwrap()
                .unwrap()
        };
        handle.join().unwrap();
        assert!(!observed.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn registry_drops_tenant_when_stopping() {
        let tenancy = plain_tenancy();
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        let id = tenant.id();
        tenant.destroy().unwrap();
        assert_eq!(tenant.state(), TenantState::Dead);
        assert!(tenancy.tenant(id).is_none());
    }

    #[test]
    fn process_cpu_time_requires_accounting() {
        let tenancy = plain_tenancy();
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        assert_matches!(tenant.process_cpu_time(), Err(TenantError::FeatureDisabled(_)));
    }

    #[test]
    fn process_cpu_time_accumulates_exited_threads() {
        let tenancy = Tenancy::builder()
            .features(Features::MULTI_TENANT | Features::CPU_ACCOUNTING | Features::THREAD_STOP)
            .build()
            .unwrap();
        let tenant = tenancy.create_tenant(TenantConfiguration::new().name("acct")).unwrap();

        let mut workers = Vec::new();
        for _ in 0..4 {
            let tenant = tenant.clone();
            workers.push(std::thread::spawn(move || {
                tenant.run_thread(|| {
                    // Burn a visible amount of CPU before exiting.
                    let begin = std::time::Instant::now();
                    let mut acc: u64 = 0;
                    while begin.elapsed() < std::time::Duration::from_millis(60) {
                        for i in 0..10_000u64 {
                            acc = acc.wrapping_add(i ^ (i >> 3));
                        }
                    }
                    std::hint::black_box(acc);
                });
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        let total = tenant.process_cpu_time().unwrap();
        assert!(total > 0, "expected accumulated cpu time, got {total}");
        assert_eq!(total, tenant.exited_cpu_time());
        tenant.destroy().unwrap();
    }

    #[test]
    fn runtime_group_path_includes_root_group() {
        let config = TenancyConfig::from_pairs([
            ("jgroup.root_group", "/outer"),
            ("jgroup.jdk_group", "rt"),
        ]);
        let path = runtime_group_path(&config);
        let expected: PathBuf =
            ["outer", "rt", &std::process::id().to_string()].iter().collect();
        assert_eq!(path, expected);
    }

    #[test]
    fn shutdown_releases_runtime_group() {
        let (dir, tenancy) = throttled_tenancy();
        let runtime_dir = dir
            .path()
            .join(&tenancy.config().jdk_group)
            .join(std::process::id().to_string());
        assert!(runtime_dir.is_dir());
        tenancy.shutdown();
        assert!(!runtime_dir.exists());
    }
}
