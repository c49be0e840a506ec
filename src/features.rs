// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use bitflags::bitflags;

bitflags! {
    /// Which tenancy subsystems are enabled for this process.
    ///
    /// The word is fixed when the process-wide [`crate::Tenancy`] object is
    /// built and never changes afterwards, so it is read without
    /// synchronization everywhere.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// Tenants can be created, entered, and destroyed.
        const MULTI_TENANT = 1 << 0;

        /// Tenants are bound to cgroup subtrees and CPU limits are applied.
        const CPU_THROTTLING = 1 << 1;

        /// Per-tenant CPU time can be queried.
        const CPU_ACCOUNTING = 1 << 2;

        /// `destroy()` actively drives tenant threads to exit. When off,
        /// destroy only performs cleanup.
        const THREAD_STOP = 1 << 3;
    }
}

impl Features {
    /// Dependent subsystems imply the base one: throttling, accounting, and
    /// thread-stop are all meaningless without multi-tenancy itself.
    pub fn normalized(self) -> Self {
        if self.intersects(Features::CPU_THROTTLING | Features::CPU_ACCOUNTING | Features::THREAD_STOP)
        {
            self | Features::MULTI_TENANT
        } else {
            self
        }
    }

    pub fn multi_tenant_enabled(&self) -> bool {
        self.contains(Features::MULTI_TENANT)
    }

    pub fn cpu_throttling_enabled(&self) -> bool {
        self.contains(Features::CPU_THROTTLING)
    }

    pub fn cpu_accounting_enabled(&self) -> bool {
        self.contains(Features::CPU_ACCOUNTING)
    }

    pub fn thread_stop_enabled(&self) -> bool {
        self.contains(Features::THREAD_STOP)
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::MULTI_TENANT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_implies_multi_tenant() {
        let f = Features::CPU_THROTTLING.normalized();
        assert!(f.multi_tenant_enabled());
        assert!(f.cpu_throttling_enabled());
        assert!(!f.cpu_accounting_enabled());
    }

    #[test]
    fn empty_stays_empty() {
        assert_eq!(Features::empty().normalized(), Features::empty());
    }
}
