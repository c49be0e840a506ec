// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::path::{Path, PathBuf};

/// The cgroup-v1 controllers the engine interacts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    Cpu,
    Cpuset,
    Cpuacct,
}

impl Controller {
    pub const ALL: [Controller; 3] = [Controller::Cpu, Controller::Cpuset, Controller::Cpuacct];

    pub fn name(&self) -> &'static str {
        match self {
            Controller::Cpu => "cpu",
            Controller::Cpuset => "cpuset",
            Controller::Cpuacct => "cpuacct",
        }
    }

    pub fn from_name(name: &str) -> Option<Controller> {
        match name {
            "cpu" => Some(Controller::Cpu),
            "cpuset" => Some(Controller::Cpuset),
            "cpuacct" => Some(Controller::Cpuacct),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Per-controller cgroup-v1 mount points, discovered once at process init.
///
/// Controllers are commonly co-mounted (one directory backing `cpu,cpuacct`),
/// so the table also keeps the *victim roots*: the symlink-resolved,
/// deduplicated set of mount roots that group teardown must visit exactly
/// once each.
#[derive(Debug)]
pub struct MountTable {
    mounts: [Option<PathBuf>; 3],
    victim_roots: Vec<PathBuf>,
}

impl MountTable {
    /// Discovers controller mount points from `/proc/self/mounts`.
    ///
    /// A controller that is not mounted anywhere is simply disabled; limits
    /// naming it become no-ops.
    pub fn discover() -> io::Result<MountTable> {
        let mounts = std::fs::read_to_string("/proc/self/mounts")?;
        Ok(Self::parse(&mounts))
    }

    /// Builds a table with every controller backed by the single hierarchy
    /// at `root`. Used for co-mounted hierarchies and by tests, which point
    /// this at a scratch directory.
    pub fn with_root(root: impl Into<PathBuf>) -> MountTable {
        let root = root.into();
        let mounts = [Some(root.clone()), Some(root.clone()), Some(root)];
        let victim_roots = Self::compute_victim_roots(&mounts);
        MountTable { mounts, victim_roots }
    }

    fn parse(proc_mounts: &str) -> MountTable {
        let mut mounts: [Option<PathBuf>; 3] = [None, None, None];
        for line in proc_mounts.lines() {
            // Fields: device mountpoint fstype options dump pass.
            let mut fields = line.split_whitespace();
            let _device = fields.next();
            let (Some(mountpoint), Some(fstype), Some(options)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if fstype != "cgroup" {
                continue;
            }
            for option in options.split(',') {
                if let Some(controller) = Controller::from_name(option) {
                    let slot = &mut mounts[controller.index()];
                    if slot.is_none() {
                        *slot = Some(PathBuf::from(mountpoint));
                    }
                }
            }
        }
        let victim_roots = Self::compute_victim_roots(&mounts);
        MountTable { mounts, victim_roots }
    }

    fn compute_victim_roots(mounts: &[Option<PathBuf>; 3]) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for root in mounts.iter().flatten() {
            let resolved = std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
            if !roots.contains(&resolved) {
                roots.push(resolved);
            }
        }
        roots
    }

    pub fn enabled(&self, controller: Controller) -> bool {
        self.mounts[controller.index()].is_some()
    }

    pub fn mount_root(&self, controller: Controller) -> Option<&Path> {
        self.mounts[controller.index()].as_deref()
    }

    /// The deduplicated set of filesystem roots visited by group teardown.
    pub fn victim_roots(&self) -> &[PathBuf] {
        &self.victim_roots
    }

    pub fn any_enabled(&self) -> bool {
        self.mounts.iter().any(Option::is_some)
    }
}
