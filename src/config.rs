// Copyright 2025 The Tenancy Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

/// Default name of the per-runtime cgroup directory under the root group.
pub const DEFAULT_JDK_GROUP: &str = "ajdk_multi_tenant";

/// The recognized process-wide options.
///
/// Options arrive from the embedding runtime as string key/value pairs
/// (system properties); [`TenancyConfig::from_pairs`] parses the recognized
/// keys and ignores the rest. The struct is immutable once the process-wide
/// [`crate::Tenancy`] object is built.
#[derive(Debug, Clone)]
pub struct TenancyConfig {
    /// Cgroup path prefix, relative to each controller mount root, under
    /// which all runtime groups are created. `jgroup.root_group`.
    pub root_group: String,

    /// Name of the per-runtime group under `root_group`. `jgroup.jdk_group`.
    pub jdk_group: String,

    /// Default value of the per-thread "should inherit the creator's
    /// tenant" flag. `tenant.thread_inheritance`.
    pub thread_inheritance: bool,

    /// Whether individual threads may override the inheritance default.
    /// `tenant.allow_per_thread_inheritance`.
    pub allow_per_thread_inheritance: bool,

    /// Emit diagnostic prose while destroying tenants.
    /// `tenant.debug_shutdown`.
    pub debug_shutdown: bool,

    /// Minimum gap between consecutive mark waves during destroy.
    /// `tenant.kill_thread_interval_ms`.
    pub kill_thread_interval_ms: u64,

    /// On soft-limit breach, fail the destroy instead of handing off to a
    /// watchdog. `tenant.stop_shutdown_when_timeout`.
    pub stop_shutdown_on_timeout: bool,

    /// Cumulative stop-the-world budget for one destroy; negative means
    /// unlimited. `tenant.shutdown_stw_soft_limit_ms`.
    pub shutdown_stw_soft_limit_ms: i64,

    /// Wall-time delay after which a destroy with surviving threads dumps
    /// their stacks once; negative disables.
    /// `tenant.print_stacks_on_timeout_delay_ms`.
    pub print_stacks_on_timeout_delay_ms: i64,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        TenancyConfig {
            root_group: "/".to_string(),
            jdk_group: DEFAULT_JDK_GROUP.to_string(),
            thread_inheritance: true,
            allow_per_thread_inheritance: true,
            debug_shutdown: false,
            kill_thread_interval_ms: 20,
            stop_shutdown_on_timeout: false,
            shutdown_stw_soft_limit_ms: -1,
            print_stacks_on_timeout_delay_ms: -1,
        }
    }
}

impl TenancyConfig {
    /// Parses the recognized `jgroup.*` and `tenant.*` keys out of `pairs`.
    ///
    /// Unrecognized keys and unparsable values are skipped with a log line;
    /// the host runtime hands us its entire property bag and most of it is
    /// not ours.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = TenancyConfig::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "jgroup.root_group" => config.root_group = value.to_string(),
                "jgroup.jdk_group" => config.jdk_group = value.to_string(),
                "tenant.thread_inheritance" => {
                    parse_bool(key, value, &mut config.thread_inheritance)
                }
                "tenant.allow_per_thread_inheritance" => {
                    parse_bool(key, value, &mut config.allow_per_thread_inheritance)
                }
                "tenant.debug_shutdown" => parse_bool(key, value, &mut config.debug_shutdown),
                "tenant.kill_thread_interval_ms" => {
                    parse_num(key, value, &mut config.kill_thread_interval_ms)
                }
                "tenant.stop_shutdown_when_timeout" => {
                    parse_bool(key, value, &mut config.stop_shutdown_on_timeout)
                }
                "tenant.shutdown_stw_soft_limit_ms" => {
                    parse_num(key, value, &mut config.shutdown_stw_soft_limit_ms)
                }
                "tenant.print_stacks_on_timeout_delay_ms" => {
                    parse_num(key, value, &mut config.print_stacks_on_timeout_delay_ms)
                }
                _ => log::debug!("ignoring unrecognized tenancy option {key}"),
            }
        }
        config
    }

    pub fn kill_thread_interval(&self) -> Duration {
        Duration::from_millis(self.kill_thread_interval_ms.max(1))
    }

    pub fn shutdown_stw_soft_limit(&self) -> Option<Duration> {
        (self.shutdown_stw_soft_limit_ms > 0)
            .then(|| Duration::from_millis(self.shutdown_stw_soft_limit_ms as u64))
    }

    pub fn print_stacks_on_timeout_delay(&self) -> Option<Duration> {
        (self.print_stacks_on_timeout_delay_ms > 0)
            .then(|| Duration::from_millis(self.print_stacks_on_timeout_delay_ms as u64))
    }
}

fn parse_bool(key: &str, value: &str, out: &mut bool) {
    match value {
        "true" | "1" | "" => *out = true,
        "false" | "0" => *out = false,
        _ => log::warn!("ignoring non-boolean value {value:?} for {key}"),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str, out: &mut T) {
    match value.parse() {
        Ok(v) => *out = v,
        Err(_) => log::warn!("ignoring non-numeric value {value:?} for {key}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TenancyConfig::default();
        assert_eq!(config.root_group, "/");
        assert_eq!(config.jdk_group, DEFAULT_JDK_GROUP);
        assert!(config.thread_inheritance);
        assert!(config.allow_per_thread_inheritance);
        assert_eq!(config.kill_thread_interval_ms, 20);
        assert_eq!(config.shutdown_stw_soft_limit(), None);
        assert_eq!(config.print_stacks_on_timeout_delay(), None);
    }

    #[test]
    fn from_pairs_parses_recognized_keys() {
        let config = TenancyConfig::from_pairs([
            ("jgroup.jdk_group", "my_runtime"),
            ("tenant.kill_thread_interval_ms", "5"),
            ("tenant.shutdown_stw_soft_limit_ms", "250"),
            ("tenant.thread_inheritance", "false"),
            ("some.other.property", "ignored"),
        ]);
        assert_eq!(config.jdk_group, "my_runtime");
        assert_eq!(config.kill_thread_interval(), Duration::from_millis(5));
        assert_eq!(config.shutdown_stw_soft_limit(), Some(Duration::from_millis(250)));
        assert!(!config.thread_inheritance);
    }

    #[test]
    fn from_pairs_skips_bad_values() {
        let config = TenancyConfig::from_pairs([("tenant.kill_thread_interval_ms", "soon")]);
        assert_eq!(config.kill_thread_interval_ms, 20);
    }
}
