// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tenant termination.
//!
//! `destroy` drives every thread owned by a tenant to a cooperative exit:
//! repeated mark waves stamp the tenant-death condition onto surviving
//! threads (delivered at their next safepoint), interrupt waves break them
//! out of blocking waits, and after enough fruitless intervals the engine
//! escalates to forceful wakeups. A configurable stop-the-world budget
//! bounds how long the caller is held; on breach the remaining work is
//! either failed or handed to a watchdog thread that keeps the same loop
//! running until the tenant drains.

use crate::config::TenancyConfig;
use crate::errors::{Result, TenantError};
use crate::runtime::{PriorityLevel, Tenancy, ThreadHandle};
use crate::tenant::{Tenant, TenantState};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// After this many quiet intervals the loop turns forceful: wake signals
/// and unconditional interrupts.
const FORCEFUL_AFTER_INTERVALS: u32 = 10;

/// Wall-clock budget, as a multiple of the stop-the-world soft limit.
const WALL_BUDGET_FACTOR: u32 = 16;

#[derive(Clone)]
struct KillOptions {
    interval: Duration,
    stw_soft_limit: Option<Duration>,
    print_stacks_delay: Option<Duration>,
    stop_on_timeout: bool,
    debug: bool,
}

impl KillOptions {
    fn from_config(config: &TenancyConfig) -> Self {
        KillOptions {
            interval: config.kill_thread_interval(),
            stw_soft_limit: config.shutdown_stw_soft_limit(),
            print_stacks_delay: config.print_stacks_on_timeout_delay(),
            stop_on_timeout: config.stop_shutdown_on_timeout,
            debug: config.debug_shutdown,
        }
    }
}

enum LoopOutcome {
    /// Every thread collection drained.
    Drained,
    /// The stop-the-world or wall budget was exceeded.
    SoftLimit,
}

pub(crate) fn destroy_tenant(tenant: &Arc<Tenant>) -> Result<bool> {
    let tenancy = tenant.tenancy().ok_or(TenantError::DeadTenant(tenant.id()))?;

    // Destroy is only legal from the root: a caller inside a tenant would
    // be destroying the ground it stands on.
    if let Some(current) =
        crate::runtime::current_thread().and_then(|handle| handle.attached_tenant())
    {
        return Err(TenantError::bad_argument(format!(
            "destroy must be called from the root tenant, but the caller is in tenant {}",
            current.id()
        )));
    }

    if tenant.state() == TenantState::Dead {
        return Ok(true);
    }

    // Taking the write lock stops new `run_thread` entries; moving to
    // Stopping makes the stop visible to entries that raced past us.
    let guard = tenant.destroy_lock.write();
    if tenant.state() == TenantState::Dead {
        return Ok(true);
    }
    if tenant.advance_state(TenantState::Stopping) {
        tenancy.remove_tenant(tenant.id());
    }

    if !tenancy.features().thread_stop_enabled() {
        // Without thread-stop we cannot drive threads out; reclaim the
        // tenant's resources and leave its threads to finish on their own.
        tenant.advance_state(TenantState::Dead);
        cleanup(tenant, &tenancy);
        return Ok(true);
    }

    let options = KillOptions::from_config(tenancy.config());
    let caller_tid = crate::runtime::os_thread_id();
    tenancy.bridge().raise_priority(caller_tid, PriorityLevel::Shutdown);

    let outcome = run_kill_loop(tenant, &tenancy, &options, false);
    tenancy.bridge().restore_priority(caller_tid);
    match outcome {
        LoopOutcome::Drained => {
            tenant.advance_state(TenantState::Dead);
            cleanup(tenant, &tenancy);
            Ok(true)
        }
        LoopOutcome::SoftLimit => {
            if options.stop_on_timeout {
                Err(TenantError::ShutdownTimeout)
            } else {
                // Release the write lock so the watchdog can take it over.
                drop(guard);
                spawn_watchdog(tenant, &tenancy, options);
                Ok(false)
            }
        }
    }
}

/// The mark/wake/interrupt loop. Runs with the destroy write lock held.
/// `watchdog_mode` disables both the soft-limit escalation and the victim
/// priority bump (the watchdog inherited victims that were already bumped).
fn run_kill_loop(
    tenant: &Arc<Tenant>,
    tenancy: &Arc<Tenancy>,
    options: &KillOptions,
    watchdog_mode: bool,
) -> LoopOutcome {
    let bridge = tenancy.bridge();
    let t_begin = Instant::now();
    let mut last_mark: Option<Instant> = None;
    let mut time_stw = Duration::ZERO;
    let mut max_stw = Duration::ZERO;
    let mut dumped = false;

    if !watchdog_mode {
        // Give the victims' unwind and cleanup code a fighting chance
        // against whatever else the process is doing.
        for thread in tenant.platform_threads().into_iter().chain(tenant.carrier_threads()) {
            bridge.raise_priority(thread.tid(), PriorityLevel::Victim);
        }
    }

    loop {
        tenant.purge_dead_threads();
        let platforms = tenant.platform_threads();
        let carriers = tenant.carrier_threads();
        let virtuals = tenant.virtual_threads();
        if platforms.is_empty() && carriers.is_empty() && virtuals.is_empty() {
            if options.debug {
                log::info!(
                    "tenant {} drained after {:?} (stw total {:?}, max {:?})",
                    tenant.id(),
                    t_begin.elapsed(),
                    time_stw,
                    max_stw,
                );
            }
            return LoopOutcome::Drained;
        }

        let forceful = t_begin.elapsed() > options.interval * FORCEFUL_AFTER_INTERVALS;
        let virtual_only = platforms.is_empty() && carriers.is_empty();

        // Mark wave, at most once per interval and only while someone is
        // still unmarked.
        let wave_due = last_mark.map_or(true, |at| at.elapsed() >= options.interval);
        let any_unmarked = platforms
            .iter()
            .chain(&carriers)
            .chain(&virtuals)
            .any(|thread| !bridge.has_tenant_death(thread));
        if wave_due && any_unmarked {
            let stw_begin = Instant::now();
            bridge.prepare_for_destroy(tenant, virtual_only, forceful);
            let stw = stw_begin.elapsed();
            time_stw += stw;
            max_stw = max_stw.max(stw);
            last_mark = Some(Instant::now());
            if options.debug {
                log::info!(
                    "tenant {} mark wave ({} platform, {} carrier, {} virtual survivors, \
                     forceful={forceful})",
                    tenant.id(),
                    platforms.len(),
                    carriers.len(),
                    virtuals.len(),
                );
            }
        }

        if forceful {
            for thread in &platforms {
                bridge.wake_up_tenant_thread(thread);
            }
        }

        // Interrupt wave. While virtual threads remain, only they are
        // interrupted; knocking out carriers first would strand yielded
        // virtual threads with nothing to remount them.
        let targets: Vec<&Arc<ThreadHandle>> = if !virtuals.is_empty() {
            virtuals.iter().collect()
        } else {
            carriers.iter().chain(&platforms).collect()
        };
        for thread in targets {
            if forceful || thread.state().is_waiting() {
                bridge.interrupt(thread);
            }
        }

        if let Some(delay) = options.print_stacks_delay {
            if !dumped && t_begin.elapsed() > delay {
                let survivors: Vec<Arc<ThreadHandle>> = platforms
                    .iter()
                    .chain(&carriers)
                    .chain(&virtuals)
                    .cloned()
                    .collect();
                log::warn!(
                    "tenant {} still has {} threads after {:?}",
                    tenant.id(),
                    survivors.len(),
                    t_begin.elapsed(),
                );
                bridge.dump_threads(&survivors);
                dumped = true;
            }
        }

        if !watchdog_mode {
            if let Some(limit) = options.stw_soft_limit {
                if time_stw > limit || t_begin.elapsed() > limit * WALL_BUDGET_FACTOR {
                    log::warn!(
                        "tenant {} exceeded its shutdown budget (stw {:?}, wall {:?})",
                        tenant.id(),
                        time_stw,
                        t_begin.elapsed(),
                    );
                    return LoopOutcome::SoftLimit;
                }
            }
        }

        std::thread::sleep(pace(options.interval));
    }
}

/// Loop pacing: a fraction of the mark interval, clamped to [1ms, 5ms].
fn pace(interval: Duration) -> Duration {
    (interval / 4).clamp(Duration::from_millis(1), Duration::from_millis(5))
}

/// Spawns the daemon that finishes a destroy the caller gave up on. It
/// re-acquires the write lock and re-runs the same loop without further
/// escalation, then performs cleanup.
fn spawn_watchdog(tenant: &Arc<Tenant>, tenancy: &Arc<Tenancy>, options: KillOptions) {
    let name = format!("WatchDog-{}", tenant.name());
    let tenant_for_thread = tenant.clone();
    let tenancy = tenancy.clone();
    let spawn_result = std::thread::Builder::new().name(name.clone()).spawn(move || {
        let tenant = tenant_for_thread;
        let tid = crate::runtime::os_thread_id();
        tenancy.bridge().raise_priority(tid, PriorityLevel::Shutdown);
        let _guard = tenant.destroy_lock.write();
        if tenant.state() != TenantState::Dead {
            let LoopOutcome::Drained = run_kill_loop(&tenant, &tenancy, &options, true) else {
                unreachable!("watchdog loop cannot hit the soft limit");
            };
            tenant.advance_state(TenantState::Dead);
            cleanup(&tenant, &tenancy);
        }
        log::info!("{name} reclaimed tenant {}", tenant.id());
    });
    if let Err(e) = spawn_result {
        log::error!("failed to spawn watchdog for tenant {}: {e}", tenant.id());
    }
}

/// Releases everything the tenant owns. Idempotent; runs exactly once no
/// matter how many destroy paths reach it.
fn cleanup(tenant: &Arc<Tenant>, tenancy: &Arc<Tenancy>) {
    if !tenant.claim_cleanup() {
        return;
    }
    if let Some(group) = tenant.take_jgroup() {
        group.destroy();
    }
    tenant.clear_thread_collections();
    tenant.drop_parent_link();
    if let Some(container) = tenant.take_container() {
        // shut_down also deregisters the container from the directory.
        container.shut_down();
    }
    tenancy.remove_tenant(tenant.id());
}

#[cfg(test)]
mod tests {
    use crate::errors::TenantError;
    use crate::policy::TenantConfiguration;
    use crate::runtime::{interruptible_sleep, safepoint, Tenancy};
    use crate::tenant::TenantState;
    use crate::Features;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn tenancy_with(config_pairs: &[(&str, &str)]) -> Arc<Tenancy> {
        Tenancy::builder()
            .features(Features::MULTI_TENANT | Features::THREAD_STOP)
            .config(crate::TenancyConfig::from_pairs(config_pairs.iter().copied()))
            .build()
            .unwrap()
    }

    #[test]
    fn destroy_of_idle_tenant_completes() {
        let tenancy = tenancy_with(&[("tenant.kill_thread_interval_ms", "2")]);
        let tenant = tenancy.create_tenant(TenantConfiguration::new().name("idle")).unwrap();
        assert_eq!(tenant.destroy().unwrap(), true);
        assert_eq!(tenant.state(), TenantState::Dead);
        assert!(tenant.thread_sets_empty());
        assert!(tenant.jgroup().is_none());
    }

    #[test]
    fn second_destroy_returns_immediately() {
        let tenancy = tenancy_with(&[]);
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        assert_eq!(tenant.destroy().unwrap(), true);
        let begin = Instant::now();
        assert_eq!(tenant.destroy().unwrap(), true);
        assert!(begin.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn destroy_from_inside_a_tenant_is_rejected() {
        let tenancy = tenancy_with(&[]);
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        let inner = tenant.clone();
        let result = tenant.run(move || inner.destroy()).unwrap();
        assert_matches!(result, Err(TenantError::BadArgument(_)));
        tenant.destroy().unwrap();
    }

    #[test]
    fn destroy_delivers_death_to_looping_thread() {
        let tenancy = tenancy_with(&[("tenant.kill_thread_interval_ms", "2")]);
        let tenant = tenancy.create_tenant(TenantConfiguration::new().name("busy")).unwrap();
        let saw_death = Arc::new(AtomicBool::new(false));

        let worker = {
            let tenant = tenant.clone();
            let saw_death = saw_death.clone();
            std::thread::spawn(move || {
                tenant.run_thread(|| loop {
                    if safepoint().is_err() {
                        saw_death.store(true, Ordering::Release);
                        break;
                    }
                    interruptible_sleep(Duration::from_millis(1));
                });
            })
        };
        // Let the worker get registered before destroying.
        while tenant.platform_threads().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(tenant.destroy().unwrap(), true);
        worker.join().unwrap();
        assert!(saw_death.load(Ordering::Acquire));
        assert_eq!(tenant.state(), TenantState::Dead);
    }

    #[test]
    fn run_thread_after_destroy_does_not_run() {
        let tenancy = tenancy_with(&[]);
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        tenant.destroy().unwrap();
        let ran = tenant.run_thread(|| panic!("must not run"));
        assert!(!ran);
    }

    #[test]
    fn soft_limit_with_stop_on_timeout_fails_the_destroy() {
        let tenancy = tenancy_with(&[
            ("tenant.kill_thread_interval_ms", "2"),
            ("tenant.shutdown_stw_soft_limit_ms", "20"),
            ("tenant.stop_shutdown_when_timeout", "true"),
        ]);
        let tenant = tenancy.create_tenant(TenantConfiguration::new().name("stuck")).unwrap();

        let release = Arc::new(AtomicBool::new(false));
        let worker = {
            let tenant = tenant.clone();
            let release = release.clone();
            std::thread::spawn(move || {
                tenant.run_thread(|| {
                    // Ignore the death condition until released; this thread
                    // simulates one stuck in uncancellable work.
                    while !release.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                });
            })
        };
        while tenant.platform_threads().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_matches!(tenant.destroy(), Err(TenantError::ShutdownTimeout));
        assert_eq!(tenant.state(), TenantState::Stopping);

        release.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn soft_limit_hands_off_to_watchdog() {
        let tenancy = tenancy_with(&[
            ("tenant.kill_thread_interval_ms", "2"),
            ("tenant.shutdown_stw_soft_limit_ms", "10"),
        ]);
        let tenant = tenancy.create_tenant(TenantConfiguration::new().name("slow")).unwrap();

        let worker = {
            let tenant = tenant.clone();
            std::thread::spawn(move || {
                tenant.run_thread(|| {
                    // Survive the caller's budget, then cooperate with the
                    // watchdog.
                    let begin = Instant::now();
                    while begin.elapsed() < Duration::from_secs(5) {
                        if safepoint().is_err() && begin.elapsed() > Duration::from_millis(400) {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                });
            })
        };
        while tenant.platform_threads().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(tenant.destroy().unwrap(), false);
        assert_ne!(tenant.state(), TenantState::Dead);

        // The watchdog finishes the job once the thread cooperates.
        let deadline = Instant::now() + Duration::from_secs(10);
        while tenant.state() != TenantState::Dead {
            assert!(Instant::now() < deadline, "watchdog did not reclaim the tenant");
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.join().unwrap();
        assert!(tenant.thread_sets_empty());
    }

    #[test]
    fn destroy_without_thread_stop_only_cleans_up() {
        let tenancy = Tenancy::builder()
            .features(Features::MULTI_TENANT)
            .build()
            .unwrap();
        let tenant = tenancy.create_tenant(TenantConfiguration::new()).unwrap();
        assert_eq!(tenant.destroy().unwrap(), true);
        assert_eq!(tenant.state(), TenantState::Dead);
    }

    #[test]
    fn masked_thread_defers_death_until_unmask() {
        let tenancy = tenancy_with(&[("tenant.kill_thread_interval_ms", "2")]);
        let tenant = tenancy.create_tenant(TenantConfiguration::new().name("masked")).unwrap();
        let death_seen_at = Arc::new(parking_lot::Mutex::new(None::<Instant>));

        let unmask_at = Instant::now() + Duration::from_millis(150);
        let worker = {
            let tenant = tenant.clone();
            let death_seen_at = death_seen_at.clone();
            std::thread::spawn(move || {
                tenant.run_thread(|| {
                    {
                        let _mask = crate::runtime::ShutdownMask::acquire().unwrap();
                        while Instant::now() < unmask_at {
                            assert!(safepoint().is_ok(), "death delivered under mask");
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }
                    loop {
                        if safepoint().is_err() {
                            *death_seen_at.lock() = Some(Instant::now());
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                });
            })
        };
        while tenant.platform_threads().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(tenant.destroy().unwrap(), true);
        worker.join().unwrap();
        let seen = death_seen_at.lock().expect("death was never observed");
        assert!(seen >= unmask_at, "death observed before unmask");
    }
}
