// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::runtime::{ThreadHandle, ThreadKind};
use crate::sched::{VirtualThread, VirtualThreadContainer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// An idle carrier exits after this long without work, as long as the pool
/// stays above its runnable floor.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// How often a waiting carrier re-checks its own liveness (death marks,
/// pool shutdown) while blocked on the run queue.
const POLL: Duration = Duration::from_millis(50);

/// Sizing of one container's carrier pool.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Target number of carriers. Defaults to the number of available CPUs.
    pub parallelism: usize,
    /// Hard cap on carriers, applied on top of `parallelism`.
    pub max_pool: usize,
    /// Carriers kept alive through idle periods so runnable virtual
    /// threads never wait on a cold start.
    pub min_runnable: usize,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        let parallelism = num_cpus::get().max(1);
        SchedulerConfig { parallelism, max_pool: 256, min_runnable: (parallelism / 2).max(1) }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self.min_runnable = (self.parallelism / 2).max(1);
        self
    }

    pub fn with_max_pool(mut self, max_pool: usize) -> Self {
        self.max_pool = max_pool.max(1);
        self
    }

    pub fn with_min_runnable(mut self, min_runnable: usize) -> Self {
        self.min_runnable = min_runnable.max(1);
        self
    }

    pub(crate) fn effective_parallelism(&self) -> usize {
        self.parallelism.min(self.max_pool).max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO pool of OS threads dedicated to one container's virtual threads.
///
/// Carriers are created on demand up to the configured parallelism and are
/// pre-stamped with the container's tenant, so anything they mount runs
/// inside it. The run queue doubles as the keep-alive mechanism: a carrier
/// that sees no work for [`KEEP_ALIVE`] retires unless that would drop the
/// pool below `min_runnable`.
pub(crate) struct CarrierPool {
    container: Weak<VirtualThreadContainer>,
    config: SchedulerConfig,
    sender: Mutex<Option<crossbeam_channel::Sender<Arc<VirtualThread>>>>,
    receiver: crossbeam_channel::Receiver<Arc<VirtualThread>>,
    live: AtomicUsize,
    idle: AtomicUsize,
    next_carrier: AtomicUsize,
    shutdown: AtomicBool,
}

impl CarrierPool {
    pub(crate) fn new(
        container: &Arc<VirtualThreadContainer>,
        config: SchedulerConfig,
    ) -> Arc<CarrierPool> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Arc::new(CarrierPool {
            container: Arc::downgrade(container),
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            next_carrier: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Queues a virtual thread for mounting; grows the pool when every
    /// carrier is busy and there is headroom. Returns whether the thread
    /// was accepted.
    pub(crate) fn submit(self: &Arc<Self>, vthread: Arc<VirtualThread>) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let sent = match &*self.sender.lock() {
            Some(sender) => sender.send(vthread).is_ok(),
            None => false,
        };
        if !sent {
            return false;
        }
        if self.idle.load(Ordering::Acquire) == 0
            && self.live.load(Ordering::Acquire) < self.config.effective_parallelism()
        {
            self.spawn_carrier();
        }
        true
    }

    /// Closes the run queue and returns the virtual threads that never got
    /// mounted, so the container can retire their handles.
    pub(crate) fn shut_down(&self) -> Vec<Arc<VirtualThread>> {
        self.shutdown.store(true, Ordering::Release);
        drop(self.sender.lock().take());
        self.receiver.try_iter().collect()
    }

    fn spawn_carrier(self: &Arc<Self>) {
        let Some(container) = self.container.upgrade() else { return };
        let n = self.next_carrier.fetch_add(1, Ordering::AcqRel);
        let name = format!("carrier-{}-{n}", container.label());
        self.live.fetch_add(1, Ordering::AcqRel);
        let pool = self.clone();
        let spawn_result = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || carrier_main(pool, name));
        if let Err(e) = spawn_result {
            self.live.fetch_sub(1, Ordering::AcqRel);
            log::error!("failed to spawn carrier thread: {e}");
        }
    }
}

fn carrier_main(pool: Arc<CarrierPool>, name: String) {
    let Some(container) = pool.container.upgrade() else {
        pool.live.fetch_sub(1, Ordering::AcqRel);
        return;
    };
    let Some(tenancy) = container.tenancy() else {
        pool.live.fetch_sub(1, Ordering::AcqRel);
        return;
    };

    let handle = ThreadHandle::new(crate::runtime::os_thread_id(), ThreadKind::Carrier, name, false);
    if let Some(tenant) = container.tenant() {
        if container.should_stamp_carrier(&handle, &tenant) {
            handle.set_inherited_tenant(Some(&tenant));
            handle.set_attached_tenant(Some(&tenant));
            if let Some(group) = tenant.jgroup() {
                if let Err(e) = group.attach() {
                    log::warn!("carrier {} could not join tenant cgroup: {e}", handle.name());
                }
            }
        }
    }
    tenancy.thread_table().insert(&handle);
    crate::runtime::adopt_current(handle.clone());
    container.on_start(&handle);

    let _exit = scopeguard::guard((pool.clone(), container.clone(), handle.clone()), |(pool, container, handle)| {
        pool.live.fetch_sub(1, Ordering::AcqRel);
        container.on_exit(&handle);
        handle.mark_terminated();
    });

    let mut idle_since = Instant::now();
    loop {
        // A death mark on the carrier ends it, but not before draining the
        // run queue: once this pool's carriers die, nothing else would
        // mount (or retire) the virtual threads still queued there.
        if handle.death_observable() {
            while let Ok(vthread) = pool.receiver.try_recv() {
                vthread.mount_and_run(&handle, &container);
            }
            break;
        }
        pool.idle.fetch_add(1, Ordering::AcqRel);
        let next = pool.receiver.recv_timeout(POLL);
        pool.idle.fetch_sub(1, Ordering::AcqRel);
        match next {
            Ok(vthread) => {
                vthread.mount_and_run(&handle, &container);
                idle_since = Instant::now();
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if idle_since.elapsed() >= KEEP_ALIVE
                    && pool.live.load(Ordering::Acquire) > pool.config.min_runnable
                {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_defaults_track_cpus() {
        let config = SchedulerConfig::new();
        assert_eq!(config.parallelism, num_cpus::get().max(1));
        assert_eq!(config.min_runnable, (config.parallelism / 2).max(1));
    }

    #[test]
    fn parallelism_is_clamped_by_max_pool() {
        let config = SchedulerConfig::new().with_parallelism(64).with_max_pool(8);
        assert_eq!(config.effective_parallelism(), 8);
    }

    #[test]
    fn min_runnable_follows_parallelism() {
        let config = SchedulerConfig::new().with_parallelism(6);
        assert_eq!(config.min_runnable, 3);
        let config = SchedulerConfig::new().with_parallelism(1);
        assert_eq!(config.min_runnable, 1);
    }
}
