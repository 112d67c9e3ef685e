//! 接收服务统计

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// 接收统计计数器
#[derive(Debug, Default)]
pub struct ReceiverStats {
    associations_accepted: AtomicU64,
    associations_rejected: AtomicU64,
    echo_requests: AtomicU64,
    objects_received: AtomicU64,
    objects_stored: AtomicU64,
    duplicates: AtomicU64,
    validation_failures: AtomicU64,
    storage_failures: AtomicU64,
    internal_failures: AtomicU64,
    studies_created: AtomicU64,
    bytes_stored: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStatsSnapshot {
    pub associations_accepted: u64,
    pub associations_rejected: u64,
    pub echo_requests: u64,
    pub objects_received: u64,
    pub objects_stored: u64,
    pub duplicates: u64,
    pub validation_failures: u64,
    pub storage_failures: u64,
    pub internal_failures: u64,
    pub studies_created: u64,
    pub bytes_stored: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn association_accepted(&self) {
        self.associations_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn association_rejected(&self) {
        self.associations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn echo(&self) {
        self.echo_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_received(&self) {
        self.objects_received.fetch_add(1, Ordering::Relaxed);
    }

    /// 新对象落盘
    pub fn object_stored(&self, bytes: u64, study_created: bool) {
        self.objects_stored.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
        if study_created {
            self.studies_created.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_failure(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn internal_failure(&self) {
        self.internal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ReceiverStatsSnapshot {
            associations_accepted: load(&self.associations_accepted),
            associations_rejected: load(&self.associations_rejected),
            echo_requests: load(&self.echo_requests),
            objects_received: load(&self.objects_received),
            objects_stored: load(&self.objects_stored),
            duplicates: load(&self.duplicates),
            validation_failures: load(&self.validation_failures),
            storage_failures: load(&self.storage_failures),
            internal_failures: load(&self.internal_failures),
            studies_created: load(&self.studies_created),
            bytes_stored: load(&self.bytes_stored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ReceiverStats::new();
        stats.association_accepted();
        stats.object_received();
        stats.object_stored(1024, true);
        stats.object_received();
        stats.duplicate();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.associations_accepted, 1);
        assert_eq!(snapshot.objects_received, 2);
        assert_eq!(snapshot.objects_stored, 1);
        assert_eq!(snapshot.studies_created, 1);
        assert_eq!(snapshot.bytes_stored, 1024);
        assert_eq!(snapshot.duplicates, 1);
    }
}
