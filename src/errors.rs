// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::tenant::TenantId;
use thiserror::Error;

/// Errors surfaced by the tenancy API.
///
/// Cgroup I/O problems on best-effort paths (value reads and writes after
/// setup, group teardown) are deliberately *not* represented here: they are
/// logged and swallowed so that a flaky control plane cannot take down the
/// tenants it is supposed to isolate.
#[derive(Debug, Error)]
pub enum TenantError {
    /// The relevant subsystem was not enabled when the process-wide state
    /// was initialized.
    #[error("feature disabled: {0}")]
    FeatureDisabled(&'static str),

    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The calling thread is already attached to a different tenant.
    #[error("thread is attached to tenant {current}, cannot enter tenant {target}")]
    CrossTenant { current: TenantId, target: TenantId },

    /// The tenant has been destroyed (or is being destroyed) and can no
    /// longer accept work.
    #[error("tenant {0} is no longer accepting threads")]
    DeadTenant(TenantId),

    /// Writing the calling thread's id into a cgroup `tasks` file failed.
    /// The tenant itself remains usable.
    #[error("failed to attach thread to cgroup tasks file")]
    AttachFailed(#[source] std::io::Error),

    /// Creating a tenant's cgroup directory tree failed.
    #[error("failed to set up cgroup directory {}", path.display())]
    CgroupSetup {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A tenant destroy exceeded its stop-the-world budget and was
    /// configured to fail rather than hand off to a watchdog. The tenant
    /// stays in `Stopping`.
    #[error("tenant shutdown exceeded its stop-the-world soft limit")]
    ShutdownTimeout,

    /// A bounded executor refused the task.
    #[error("task rejected by executor")]
    Rejected,
}

pub type Result<T> = std::result::Result<T, TenantError>;

impl TenantError {
    pub(crate) fn bad_argument(msg: impl Into<String>) -> Self {
        TenantError::BadArgument(msg.into())
    }
}
