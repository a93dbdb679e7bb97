//! Operator identity and engine tuning, read from the environment at startup.

use std::str::FromStr;
use std::time::Duration;

use kiln_core::DEFAULT_PLATFORM_NAME;

fn env_str(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Who this operator is and where it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Value matched against the operator id annotation of resources.
    pub operator_id: Option<String>,
    /// Set for local operators; global operators watch every namespace.
    pub watch_namespace: Option<String>,
    /// Namespace the operator itself runs in.
    pub operator_namespace: Option<String>,
    pub pod_name: Option<String>,
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self {
            operator_id: env_str(&["KILN_OPERATOR_ID"]),
            watch_namespace: env_str(&["KILN_WATCH_NAMESPACE", "WATCH_NAMESPACE"]),
            operator_namespace: env_str(&["KILN_OPERATOR_NAMESPACE", "NAMESPACE"]),
            pod_name: env_str(&["POD_NAME"]),
        }
    }

    pub fn is_global(&self) -> bool { self.watch_namespace.is_none() }

    pub fn operator_id(&self) -> Option<&str> { self.operator_id.as_deref() }

    /// Identity used for leases and the event reporter.
    pub fn identity(&self) -> &str { self.operator_id().unwrap_or(DEFAULT_PLATFORM_NAME) }

    /// Lease name guarding a namespace for the given operator or platform.
    pub fn lock_name(id: &str) -> String { format!("{id}-lock") }
}

/// What to do when a build completes but its kit moved on in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InconsistentPhasePolicy {
    /// Surface an error; the key is retried with backoff.
    #[default]
    Fail,
    /// Drop the pass silently and let the next event resynchronise.
    Resync,
}

impl FromStr for InconsistentPhasePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "resync" => Ok(Self::Resync),
            other => Err(format!("unknown inconsistent phase policy {other:?} (expected fail|resync)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    /// Requeue interval for phases waiting on something external.
    pub requeue_after: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub pass_timeout: Duration,
    pub inconsistent_phase: InconsistentPhasePolicy,
    pub build_attempt_max: u32,
    /// First wait before a failed build is retried; doubles per attempt up to `backoff_max`.
    pub recovery_base: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            requeue_after: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_secs(300),
            pass_timeout: Duration::from_secs(60),
            inconsistent_phase: InconsistentPhasePolicy::Fail,
            build_attempt_max: 5,
            recovery_base: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse::<usize>("KILN_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            requeue_after: env_parse("KILN_REQUEUE_SECS").map(Duration::from_secs).unwrap_or(d.requeue_after),
            backoff_base: env_parse("KILN_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env_parse("KILN_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            pass_timeout: env_parse("KILN_PASS_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.pass_timeout),
            inconsistent_phase: env_parse("KILN_INCONSISTENT_PHASE").unwrap_or(d.inconsistent_phase),
            build_attempt_max: env_parse("KILN_BUILD_ATTEMPT_MAX").unwrap_or(d.build_attempt_max),
            recovery_base: env_parse("KILN_RECOVERY_BASE_MS").map(Duration::from_millis).unwrap_or(d.recovery_base),
        }
    }

    /// `base * 2^n`, capped at `backoff_max`.
    pub fn exponential(&self, base: Duration, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.min(31)).unwrap_or(u32::MAX);
        base.checked_mul(factor).unwrap_or(self.backoff_max).min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("Resync".parse::<InconsistentPhasePolicy>(), Ok(InconsistentPhasePolicy::Resync));
        assert!("maybe".parse::<InconsistentPhasePolicy>().is_err());
    }

    #[test]
    fn exponential_is_capped() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.exponential(Duration::from_secs(1), 0), Duration::from_secs(1));
        assert_eq!(cfg.exponential(Duration::from_secs(1), 3), Duration::from_secs(8));
        assert_eq!(cfg.exponential(Duration::from_secs(1), 40), cfg.backoff_max);
    }

    #[test]
    fn operator_identity_defaults_to_platform_name() {
        let cfg = OperatorConfig::default();
        assert!(cfg.is_global());
        assert_eq!(cfg.identity(), "kiln");
        assert_eq!(OperatorConfig::lock_name("kiln"), "kiln-lock");
    }
}
