// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::cgroup::{Controller, JGroup};
use crate::errors::{Result, TenantError};

pub const CFS_PERIOD_MIN_US: i32 = 1_000;
pub const CFS_PERIOD_MAX_US: i32 = 1_000_000;
pub const CFS_QUOTA_MIN_US: i32 = 1_000;
pub const CFS_QUOTA_UNLIMITED: i32 = -1;

/// A single typed, validated resource limit.
///
/// Each variant knows which controller file(s) it writes; syncing a limit
/// whose controller is not mounted is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLimit {
    /// Relative CPU weight (`cpu.shares`).
    CpuShares { shares: i32 },

    /// CFS bandwidth limit (`cpu.cfs_period_us` / `cpu.cfs_quota_us`).
    CpuCfs { period_us: i32, quota_us: i32 },

    /// CPU placement mask (`cpuset.cpus`), e.g. `"0-7,11"`.
    CpusetCpus { cpus: String },
}

impl ResourceLimit {
    pub fn validate(&self) -> Result<()> {
        match self {
            ResourceLimit::CpuShares { shares } => {
                if *shares < 0 {
                    return Err(TenantError::bad_argument(format!(
                        "cpu shares must be non-negative, got {shares}"
                    )));
                }
            }
            ResourceLimit::CpuCfs { period_us, quota_us } => {
                if !(CFS_PERIOD_MIN_US..=CFS_PERIOD_MAX_US).contains(period_us) {
                    return Err(TenantError::bad_argument(format!(
                        "cfs period must be in [{CFS_PERIOD_MIN_US}, {CFS_PERIOD_MAX_US}]us, \
                         got {period_us}"
                    )));
                }
                if *quota_us != CFS_QUOTA_UNLIMITED && *quota_us < CFS_QUOTA_MIN_US {
                    return Err(TenantError::bad_argument(format!(
                        "cfs quota must be at least {CFS_QUOTA_MIN_US}us or {CFS_QUOTA_UNLIMITED}, \
                         got {quota_us}"
                    )));
                }
            }
            ResourceLimit::CpusetCpus { cpus } => {
                if cpus.is_empty() {
                    return Err(TenantError::bad_argument("cpuset mask must not be empty"));
                }
            }
        }
        Ok(())
    }

    pub fn controller(&self) -> Controller {
        match self {
            ResourceLimit::CpuShares { .. } | ResourceLimit::CpuCfs { .. } => Controller::Cpu,
            ResourceLimit::CpusetCpus { .. } => Controller::Cpuset,
        }
    }

    /// Writes this limit into `group`'s controller files.
    pub(crate) fn sync(&self, group: &JGroup) -> Result<()> {
        match self {
            ResourceLimit::CpuShares { shares } => {
                group.set_value("cpu.shares", &shares.to_string())
            }
            ResourceLimit::CpuCfs { period_us, quota_us } => {
                group.set_value("cpu.cfs_period_us", &period_us.to_string())?;
                group.set_value("cpu.cfs_quota_us", &quota_us.to_string())
            }
            ResourceLimit::CpusetCpus { cpus } => group.set_value("cpuset.cpus", cpus),
        }
    }
}

/// The resource policy and identity a tenant is created (or updated) with.
///
/// Later limits of the same kind supersede earlier ones, so `update` can
/// hand back a configuration extended with replacements.
#[derive(Debug, Clone, Default)]
pub struct TenantConfiguration {
    name: Option<String>,
    limits: Vec<ResourceLimit>,
}

impl TenantConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn limit(mut self, limit: ResourceLimit) -> Self {
        self.limits.push(limit);
        self
    }

    pub fn limit_cpu_shares(self, shares: i32) -> Self {
        self.limit(ResourceLimit::CpuShares { shares })
    }

    pub fn limit_cpu_cfs(self, period_us: i32, quota_us: i32) -> Self {
        self.limit(ResourceLimit::CpuCfs { period_us, quota_us })
    }

    pub fn limit_cpuset_cpus(self, cpus: impl Into<String>) -> Self {
        self.limit(ResourceLimit::CpusetCpus { cpus: cpus.into() })
    }

    pub fn validate(&self) -> Result<()> {
        for limit in &self.limits {
            limit.validate()?;
        }
        Ok(())
    }

    pub(crate) fn configured_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn limits(&self) -> &[ResourceLimit] {
        &self.limits
    }

    pub fn cpu_shares(&self) -> Option<i32> {
        self.limits.iter().rev().find_map(|l| match l {
            ResourceLimit::CpuShares { shares } => Some(*shares),
            _ => None,
        })
    }

    pub fn cpu_cfs(&self) -> Option<(i32, i32)> {
        self.limits.iter().rev().find_map(|l| match l {
            ResourceLimit::CpuCfs { period_us, quota_us } => Some((*period_us, *quota_us)),
            _ => None,
        })
    }

    pub fn cpuset_cpus(&self) -> Option<&str> {
        self.limits.iter().rev().find_map(|l| match l {
            ResourceLimit::CpusetCpus { cpus } => Some(cpus.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::MountTable;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[test]
    fn cfs_period_below_minimum_is_rejected() {
        let limit = ResourceLimit::CpuCfs { period_us: 999, quota_us: 1_000 };
        assert_matches!(limit.validate(), Err(TenantError::BadArgument(_)));
    }

    #[test]
    fn cfs_quota_below_minimum_is_rejected() {
        let limit = ResourceLimit::CpuCfs { period_us: 1_000, quota_us: 500 };
        assert_matches!(limit.validate(), Err(TenantError::BadArgument(_)));
    }

    #[test]
    fn cfs_unlimited_quota_is_accepted() {
        let limit = ResourceLimit::CpuCfs { period_us: 100_000, quota_us: CFS_QUOTA_UNLIMITED };
        assert_matches!(limit.validate(), Ok(()));
    }

    #[test]
    fn empty_cpuset_mask_is_rejected() {
        let limit = ResourceLimit::CpusetCpus { cpus: String::new() };
        assert_matches!(limit.validate(), Err(TenantError::BadArgument(_)));
    }

    #[test]
    fn negative_shares_are_rejected() {
        assert_matches!(
            ResourceLimit::CpuShares { shares: -1 }.validate(),
            Err(TenantError::BadArgument(_))
        );
        assert_matches!(ResourceLimit::CpuShares { shares: 0 }.validate(), Ok(()));
    }

    #[test]
    fn sync_writes_controller_files() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(MountTable::with_root(dir.path()));
        let group = JGroup::create(table, None, "t1").unwrap();

        ResourceLimit::CpuShares { shares: 512 }.sync(&group).unwrap();
        ResourceLimit::CpuCfs { period_us: 100_000, quota_us: 50_000 }.sync(&group).unwrap();
        ResourceLimit::CpusetCpus { cpus: "0-1".into() }.sync(&group).unwrap();

        assert_eq!(group.get_value("cpu.shares").unwrap().as_deref(), Some("512"));
        assert_eq!(group.get_value("cpu.cfs_period_us").unwrap().as_deref(), Some("100000"));
        assert_eq!(group.get_value("cpu.cfs_quota_us").unwrap().as_deref(), Some("50000"));
        assert_eq!(group.get_value("cpuset.cpus").unwrap().as_deref(), Some("0-1"));
    }

    #[test]
    fn configuration_read_back_returns_latest_limit() {
        let config = TenantConfiguration::new()
            .name("payments")
            .limit_cpu_shares(128)
            .limit_cpu_shares(512)
            .limit_cpu_cfs(100_000, 25_000);
        assert_eq!(config.cpu_shares(), Some(512));
        assert_eq!(config.cpu_cfs(), Some((100_000, 25_000)));
        assert_eq!(config.cpuset_cpus(), None);
        assert_matches!(config.validate(), Ok(()));
    }
}
