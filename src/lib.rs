// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Multi-tenant CPU isolation for a managed runtime.
//!
//! The engine partitions one process into named [`Tenant`]s. Each tenant is
//! bound to a cgroup-v1 subtree for CPU accounting and throttling, and owns
//! the threads spawned while it is active: platform threads entering
//! through [`Tenant::run_thread`], plus the carrier and virtual threads of
//! its [`VirtualThreadContainer`]. A tenant can be created with a resource
//! policy, entered and exited on any thread, queried for accumulated CPU
//! time, updated in place, and destroyed: [`Tenant::destroy`]
//! cooperatively forces every thread associated with the tenant to exit
//! while the rest of the process keeps running.
//!
//! Cancellation is cooperative throughout: tenant code observes a pending
//! death condition at [`safepoint`]s and the interruptible blocking
//! helpers, and can hide critical sections from termination with a
//! [`ShutdownMask`]. The embedding runtime plugs in through
//! [`runtime::RuntimeBridge`]; everything else is plain OS threads and the
//! cgroup filesystem.

pub mod cgroup;
pub mod config;
pub mod errors;
pub mod features;
pub mod policy;
pub mod runtime;
pub mod sched;
pub mod tenant;

pub use config::TenancyConfig;
pub use errors::{Result, TenantError};
pub use features::Features;
pub use policy::{ResourceLimit, TenantConfiguration};
pub use runtime::{
    interruptible_sleep, safepoint, ShutdownMask, Tenancy, TenancyBuilder, TenantDeath, WakeReason,
};
pub use sched::{
    BoundedVirtualExecutor, ExecutorState, RejectionPolicy, SchedulerConfig, VirtualThread,
    VirtualThreadContainer,
};
pub use tenant::{Tenant, TenantId, TenantState};
