//! Worker version ordering and SDK capability detection.

use semver::Version;
use std::cmp::Ordering;

use crate::model::BackgroundWorker;

/// Compare dot-separated integer versions component by component.
///
/// Missing components count as zero, so `1.2` == `1.2.0`. Components that
/// fail to parse sort below every numeric component.
pub fn compare_worker_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<Option<u64>> { s.split('.').map(|p| p.trim().parse::<u64>().ok()).collect() };
    let (pa, pb) = (parse(a), parse(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let x = pa.get(i).copied().unwrap_or(Some(0));
        let y = pb.get(i).copied().unwrap_or(Some(0));
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Most recent non-deprecated worker.
pub fn latest_worker(workers: &[BackgroundWorker]) -> Option<&BackgroundWorker> {
    workers
        .iter()
        .filter(|w| !w.deprecated)
        .max_by(|a, b| compare_worker_versions(&a.version, &b.version))
}

/// Worker to run `locked_to` on: the locked version when set (even if
/// deprecated), otherwise the latest.
pub fn resolve_worker<'a>(workers: &'a [BackgroundWorker], locked_to: Option<&str>) -> Option<&'a BackgroundWorker> {
    match locked_to {
        Some(id) => workers.iter().find(|w| w.id == id),
        None => latest_worker(workers),
    }
}

const RETRY_CHECKPOINTS_SINCE: &str = "3.0.0-beta.22";
const EXIT_DELAY_SINCE: &str = "3.0.0-beta.56";

/// Feature flags derived from the SDK a worker was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerCapabilities {
    pub supports_retry_checkpoints: bool,
    pub supports_exit_delay: bool,
    pub supports_lazy_attempts: bool,
}

impl WorkerCapabilities {
    /// Unparseable SDK versions get no optional capabilities.
    pub fn from_sdk_version(sdk_version: &str) -> Self {
        let Ok(version) = Version::parse(sdk_version.trim_start_matches('v')) else {
            return Self::default();
        };
        let at_least = |min: &str| Version::parse(min).is_ok_and(|min| version >= min);
        Self {
            supports_retry_checkpoints: at_least(RETRY_CHECKPOINTS_SINCE),
            supports_exit_delay: at_least(EXIT_DELAY_SINCE),
            supports_lazy_attempts: false,
        }
    }

    pub fn for_worker(worker: &BackgroundWorker) -> Self {
        Self {
            supports_lazy_attempts: worker.supports_lazy_attempts,
            ..Self::from_sdk_version(&worker.sdk_version)
        }
    }
}
