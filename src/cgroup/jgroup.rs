// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::cgroup::{Controller, MountTable};
use crate::errors::{Result, TenantError};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Mirror of one cgroup directory, replicated across every enabled
/// controller's mount root.
///
/// A `JGroup` only stores the path *relative* to the mount roots; the same
/// relative path exists under each enabled controller. Ownership follows a
/// single strong direction: tenants own their group, groups refer to their
/// parent through a `Weak`.
pub struct JGroup {
    mounts: Arc<MountTable>,
    /// Path relative to each controller's mount root.
    path: PathBuf,
    parent: Option<Weak<JGroup>>,
    /// Serializes value reads/writes on this group.
    op_lock: Mutex<()>,
}

impl JGroup {
    /// Creates the group directory `name` under `parent` (or at the top of
    /// the hierarchy) on every enabled controller.
    ///
    /// When the cpuset controller is enabled the new directory's
    /// `cpuset.cpus` and `cpuset.mems` are seeded from the parent
    /// directory; a fresh cpuset group is unschedulable until both are set.
    pub fn create(
        mounts: Arc<MountTable>,
        parent: Option<&Arc<JGroup>>,
        name: &str,
    ) -> Result<Arc<JGroup>> {
        if name.is_empty() {
            return Err(TenantError::bad_argument("cgroup name must not be empty"));
        }
        let path = match parent {
            Some(parent) => parent.path.join(name),
            None => PathBuf::from(name),
        };

        for controller in Controller::ALL {
            let Some(root) = mounts.mount_root(controller) else { continue };
            let dir = root.join(&path);
            std::fs::create_dir_all(&dir)
                .map_err(|source| TenantError::CgroupSetup { path: dir.clone(), source })?;
            if controller == Controller::Cpuset {
                for file in ["cpuset.cpus", "cpuset.mems"] {
                    seed_from_parent(&dir, file);
                }
            }
        }

        Ok(Arc::new(JGroup {
            mounts,
            path,
            parent: parent.map(Arc::downgrade),
            op_lock: Mutex::new(()),
        }))
    }

    /// The group's path relative to each controller mount root.
    pub fn relative_path(&self) -> &Path {
        &self.path
    }

    pub fn parent(&self) -> Option<Arc<JGroup>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Moves the calling OS thread into this group by appending its thread
    /// id to `tasks` on every enabled controller.
    pub fn attach(&self) -> Result<()> {
        self.attach_tid(crate::runtime::os_thread_id())
    }

    pub(crate) fn attach_tid(&self, tid: u64) -> Result<()> {
        for controller in Controller::ALL {
            let Some(root) = self.mounts.mount_root(controller) else { continue };
            let tasks = root.join(&self.path).join("tasks");
            append_line(&tasks, tid).map_err(TenantError::AttachFailed)?;
        }
        Ok(())
    }

    /// Writes `value` to the controller file named by `key`.
    ///
    /// `key` must have the form `controller.name` (e.g. `cpu.shares`); the
    /// write goes to that controller's mount root. A missing or unwritable
    /// file is logged and swallowed; a disabled controller is a no-op.
    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let controller = parse_key(key)?;
        if !self.mounts.enabled(controller) {
            return Ok(());
        }
        let _guard = self.op_lock.lock();
        let file = self.controller_file(controller, key);
        if let Err(e) = std::fs::write(&file, value) {
            log::warn!("failed to write {value:?} to {}: {e}", file.display());
        }
        Ok(())
    }

    /// Reads the controller file named by `key`. Returns `None` when the
    /// controller is disabled or the file does not exist.
    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        let controller = parse_key(key)?;
        if !self.mounts.enabled(controller) {
            return Ok(None);
        }
        let _guard = self.op_lock.lock();
        let file = self.controller_file(controller, key);
        match std::fs::read_to_string(&file) {
            Ok(contents) => Ok(Some(contents.trim_end().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                log::warn!("failed to read {}: {e}", file.display());
                Ok(None)
            }
        }
    }

    /// Accumulated CPU time of this group in nanoseconds, per the cpuacct
    /// controller. `None` when cpuacct is unavailable.
    pub fn cpuacct_usage_ns(&self) -> Option<u64> {
        self.get_value("cpuacct.usage").ok().flatten().and_then(|v| v.parse().ok())
    }

    /// Tears the group down: on every victim root, drains each `tasks` file
    /// in the group's subtree into the parent directory's `tasks`
    /// (deepest-first), then removes the directories.
    ///
    /// Best-effort by design; threads racing into the group can make
    /// individual steps fail, and a leaked directory is preferable to a
    /// wedged destroy.
    pub(crate) fn destroy(&self) {
        for root in self.mounts.victim_roots() {
            let dir = root.join(&self.path);
            if !dir.exists() {
                continue;
            }
            let parent_tasks = match dir.parent() {
                Some(parent) => parent.join("tasks"),
                None => continue,
            };
            evacuate_and_remove(&dir, &parent_tasks);
        }
    }

    fn controller_file(&self, controller: Controller, key: &str) -> PathBuf {
        // parse_key established the controller is enabled.
        let root = self.mounts.mount_root(controller).expect("controller enabled");
        root.join(&self.path).join(key)
    }
}

impl std::fmt::Debug for JGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JGroup").field("path", &self.path).finish()
    }
}

/// Validates `controller.name` key syntax and resolves the controller.
fn parse_key(key: &str) -> Result<Controller> {
    let Some((controller, name)) = key.split_once('.') else {
        return Err(TenantError::bad_argument(format!(
            "cgroup key {key:?} is not of the form controller.name"
        )));
    };
    if name.is_empty() || key.contains('/') {
        return Err(TenantError::bad_argument(format!("malformed cgroup key {key:?}")));
    }
    Controller::from_name(controller)
        .ok_or_else(|| TenantError::bad_argument(format!("unknown cgroup controller {controller:?}")))
}

/// Copies `file` from the directory above `dir` into `dir`, if present.
fn seed_from_parent(dir: &Path, file: &str) {
    let Some(parent) = dir.parent() else { return };
    match std::fs::read_to_string(parent.join(file)) {
        Ok(contents) => {
            if let Err(e) = std::fs::write(dir.join(file), contents) {
                log::warn!("failed to seed {file} in {}: {e}", dir.display());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to read parent {file} for {}: {e}", dir.display()),
    }
}

fn append_line(path: &Path, value: u64) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    // One id per write; the kernel rejects batched writes to tasks.
    writeln!(file, "{value}")
}

fn evacuate_and_remove(dir: &Path, parent_tasks: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("failed to list {}: {e}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            evacuate_and_remove(&entry.path(), parent_tasks);
        }
    }
    drain_tasks(&dir.join("tasks"), parent_tasks);
    for entry in std::fs::read_dir(dir).into_iter().flatten().flatten() {
        // Controller files cannot be unlinked on a real cgroupfs; this only
        // matters for scratch-directory hierarchies.
        let _ = std::fs::remove_file(entry.path());
    }
    if let Err(e) = std::fs::remove_dir(dir) {
        log::warn!("failed to remove cgroup directory {}: {e}", dir.display());
    }
}

fn drain_tasks(tasks: &Path, parent_tasks: &Path) {
    let contents = match std::fs::read_to_string(tasks) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            log::warn!("failed to read {}: {e}", tasks.display());
            return;
        }
    };
    for line in contents.lines() {
        let Ok(tid) = line.trim().parse::<u64>() else { continue };
        if let Err(e) = append_line(parent_tasks, tid) {
            log::warn!("failed to move task {tid} into {}: {e}", parent_tasks.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn scratch_table() -> (tempfile::TempDir, Arc<MountTable>) {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(MountTable::with_root(dir.path()));
        (dir, table)
    }

    #[test]
    fn create_rejects_empty_name() {
        let (_dir, table) = scratch_table();
        assert_matches!(JGroup::create(table, None, ""), Err(TenantError::BadArgument(_)));
    }

    #[test]
    fn create_seeds_cpuset_from_parent() {
        let (dir, table) = scratch_table();
        std::fs::write(dir.path().join("cpuset.cpus"), "0-3").unwrap();
        std::fs::write(dir.path().join("cpuset.mems"), "0").unwrap();
        let group = JGroup::create(table, None, "t1").unwrap();
        assert_eq!(group.get_value("cpuset.cpus").unwrap().as_deref(), Some("0-3"));
        assert_eq!(group.get_value("cpuset.mems").unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn set_and_get_value_round_trip() {
        let (_dir, table) = scratch_table();
        let group = JGroup::create(table, None, "t1").unwrap();
        group.set_value("cpu.shares", "512").unwrap();
        assert_eq!(group.get_value("cpu.shares").unwrap().as_deref(), Some("512"));
    }

    #[test]
    fn get_value_missing_file_is_none() {
        let (_dir, table) = scratch_table();
        let group = JGroup::create(table, None, "t1").unwrap();
        assert_eq!(group.get_value("cpu.cfs_quota_us").unwrap(), None);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        let (_dir, table) = scratch_table();
        let group = JGroup::create(table, None, "t1").unwrap();
        assert_matches!(group.set_value("shares", "1"), Err(TenantError::BadArgument(_)));
        assert_matches!(group.set_value("memory.limit", "1"), Err(TenantError::BadArgument(_)));
        assert_matches!(group.get_value("cpu."), Err(TenantError::BadArgument(_)));
        assert_matches!(group.get_value("cpu.../x"), Err(TenantError::BadArgument(_)));
    }

    #[test]
    fn attach_appends_thread_id() {
        let (dir, table) = scratch_table();
        let group = JGroup::create(table, None, "t1").unwrap();
        group.attach().unwrap();
        let tasks = std::fs::read_to_string(dir.path().join("t1/tasks")).unwrap();
        let tid = crate::runtime::os_thread_id();
        assert_eq!(tasks, format!("{tid}\n"));
    }

    #[test]
    fn nested_group_paths_stack() {
        let (_dir, table) = scratch_table();
        let parent = JGroup::create(table.clone(), None, "t10").unwrap();
        let child = JGroup::create(table, Some(&parent), "t11").unwrap();
        assert_eq!(child.relative_path(), Path::new("t10/t11"));
    }

    #[test]
    fn destroy_evacuates_subtree_into_parent_tasks() {
        let (dir, table) = scratch_table();
        let parent = JGroup::create(table.clone(), None, "t10").unwrap();
        let child = JGroup::create(table, Some(&parent), "t11").unwrap();
        std::fs::write(dir.path().join("t10/t11/tasks"), "101\n102\n").unwrap();
        std::fs::create_dir(dir.path().join("t10/t11/deeper")).unwrap();
        std::fs::write(dir.path().join("t10/t11/deeper/tasks"), "103\n").unwrap();

        child.destroy();

        assert!(!dir.path().join("t10/t11").exists());
        // Parent directory survives; the children's tasks landed in it.
        let parent_tasks = std::fs::read_to_string(dir.path().join("t10/tasks")).unwrap();
        for tid in ["101", "102", "103"] {
            assert!(parent_tasks.lines().any(|l| l == tid), "missing {tid} in {parent_tasks:?}");
        }
    }

    #[test]
    fn destroy_tolerates_missing_directory() {
        let (_dir, table) = scratch_table();
        let group = JGroup::create(table, None, "t1").unwrap();
        group.destroy();
        group.destroy();
    }
}
