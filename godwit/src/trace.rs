//! Tracing callbacks: error, SQL, performance, and database-operation
//! events, installable globally and per database.
//!
//! Callback sets are copy-on-write: mutation swaps `Arc`s under a mutex, and
//! a handle takes a snapshot at checkout, so an in-flight callback is never
//! torn by concurrent reconfiguration.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;

use godwit_result::Error;

pub type ErrorTraceFn = dyn Fn(&Error) + Send + Sync;
pub type SqlTraceFn = dyn Fn(&str) + Send + Sync;
pub type PerformanceTraceFn = dyn Fn(&str, Duration) + Send + Sync;
pub type OperationTraceFn = dyn Fn(&OperationEvent) + Send + Sync;

/// Database lifecycle points reported to the operation trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseOperation {
    Create,
    SetTag,
    OpenHandle,
}

/// Well-known keys of [`OperationEvent::info`].
pub mod keys {
    pub const HANDLE_COUNT: &str = "HandleCount";
    /// Wall time spent opening the handle, in microseconds.
    pub const HANDLE_OPEN_TIME: &str = "HandleOpenTime";
    /// CPU time spent opening the handle, in microseconds.
    pub const HANDLE_OPEN_CPU_TIME: &str = "HandleOpenCPUTime";
    /// Database size in bytes (page count times page size).
    pub const SCHEMA_USAGE: &str = "SchemaUsage";
    pub const TABLE_COUNT: &str = "TableCount";
    pub const INDEX_COUNT: &str = "IndexCount";
    pub const TRIGGER_COUNT: &str = "TriggerCount";
}

/// Payload of one database-operation trace event.
#[derive(Clone, Debug)]
pub struct OperationEvent {
    pub operation: DatabaseOperation,
    pub path: PathBuf,
    pub tag: i64,
    pub info: FxHashMap<&'static str, i64>,
}

/// One set of callbacks (either the global set or one database's).
#[derive(Clone, Default)]
pub struct TraceSet {
    pub error: Option<Arc<ErrorTraceFn>>,
    pub sql: Option<Arc<SqlTraceFn>>,
    pub performance: Option<Arc<PerformanceTraceFn>>,
    pub operation: Option<Arc<OperationTraceFn>>,
    pub full_sql: bool,
}

/// Mutable holder of a [`TraceSet`] with snapshot reads.
#[derive(Default)]
pub struct TraceHub {
    set: Mutex<TraceSet>,
}

impl TraceHub {
    fn lock(&self) -> std::sync::MutexGuard<'_, TraceSet> {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> TraceSet {
        self.lock().clone()
    }

    pub fn set_error(&self, callback: Option<Arc<ErrorTraceFn>>) {
        self.lock().error = callback;
    }

    pub fn set_sql(&self, callback: Option<Arc<SqlTraceFn>>) {
        self.lock().sql = callback;
    }

    pub fn set_performance(&self, callback: Option<Arc<PerformanceTraceFn>>) {
        self.lock().performance = callback;
    }

    pub fn set_operation(&self, callback: Option<Arc<OperationTraceFn>>) {
        self.lock().operation = callback;
    }

    pub fn set_full_sql(&self, enable: bool) {
        self.lock().full_sql = enable;
    }
}

/// The global and per-database sets captured together at handle checkout.
#[derive(Clone, Default)]
pub struct TraceSnapshot {
    pub global: TraceSet,
    pub local: TraceSet,
}

impl TraceSnapshot {
    pub fn on_error(&self, error: &Error) {
        if let Some(callback) = &self.global.error {
            callback(error);
        }
        if let Some(callback) = &self.local.error {
            callback(error);
        }
    }

    pub fn on_sql(&self, sql: &str) {
        if let Some(callback) = &self.global.sql {
            callback(sql);
        }
        if let Some(callback) = &self.local.sql {
            callback(sql);
        }
    }

    pub fn on_performance(&self, sql: &str, elapsed: Duration) {
        if let Some(callback) = &self.global.performance {
            callback(sql, elapsed);
        }
        if let Some(callback) = &self.local.performance {
            callback(sql, elapsed);
        }
    }

    pub fn on_operation(&self, event: &OperationEvent) {
        if let Some(callback) = &self.global.operation {
            callback(event);
        }
        if let Some(callback) = &self.local.operation {
            callback(event);
        }
    }

    pub fn traces_operations(&self) -> bool {
        self.global.operation.is_some() || self.local.operation.is_some()
    }

    pub fn full_sql(&self) -> bool {
        self.global.full_sql || self.local.full_sql
    }
}

/// CPU time of the calling thread in microseconds; zero where unsupported.
#[cfg(unix)]
pub(crate) fn thread_cpu_time_us() -> i64 {
    let mut spec = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: spec is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut spec) };
    if rc != 0 {
        return 0;
    }
    spec.tv_sec as i64 * 1_000_000 + spec.tv_nsec as i64 / 1_000
}

#[cfg(not(unix))]
pub(crate) fn thread_cpu_time_us() -> i64 {
    0
}
