//! Per-path shared pool of handles.
//!
//! Checkout returns a lease that checks the handle back in on destruction on
//! every exit path. While the blockade is up, checkouts wait; `close` drains
//! the pool behind the blockade and runs its callback against a fully
//! quiesced pool. A handle that reported a fatal engine error is discarded
//! instead of pooled, and corruption codes wake the corruption guard.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Instant;

use rustc_hash::FxHashMap;

use godwit_result::{Code, Result};

use crate::config::ConfigChain;
use crate::global;
use crate::handle::Handle;
use crate::trace::{keys, thread_cpu_time_us, DatabaseOperation, OperationEvent, TraceHub, TraceSnapshot};

struct PoolState {
    idle: Vec<Handle>,
    checked_out: usize,
    blockaded: bool,
    close_pending: bool,
    purge_epoch: u64,
    /// Soft thread-to-handle affinity: a reader thread prefers the handle it
    /// most recently returned, for its warm statement cache.
    affinity: FxHashMap<ThreadId, u64>,
}

type FatalSink = Box<dyn Fn(Code) + Send + Sync>;
type WriteSink = Box<dyn Fn() + Send + Sync>;

pub struct HandlePool {
    path: PathBuf,
    database_id: u64,
    tag: Arc<AtomicI64>,
    config: Arc<ConfigChain>,
    traces: Arc<TraceHub>,
    capacity: usize,
    next_handle_id: AtomicU64,
    state: Mutex<PoolState>,
    available: Condvar,
    close_barrier: Condvar,
    fatal_sink: Mutex<Option<FatalSink>>,
    write_sink: Mutex<Option<WriteSink>>,
}

impl HandlePool {
    pub(crate) fn new(
        path: &Path,
        database_id: u64,
        tag: Arc<AtomicI64>,
        config: Arc<ConfigChain>,
        traces: Arc<TraceHub>,
    ) -> Arc<Self> {
        let capacity = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Arc::new(Self {
            path: path.to_path_buf(),
            database_id,
            tag,
            config,
            traces,
            capacity,
            next_handle_id: AtomicU64::new(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                checked_out: 0,
                blockaded: false,
                close_pending: false,
                purge_epoch: 0,
                affinity: FxHashMap::default(),
            }),
            available: Condvar::new(),
            close_barrier: Condvar::new(),
            fatal_sink: Mutex::new(None),
            write_sink: Mutex::new(None),
        })
    }

    pub(crate) fn set_fatal_sink(&self, sink: FatalSink) {
        *lock_plain(&self.fatal_sink) = Some(sink);
    }

    pub(crate) fn set_write_sink(&self, sink: WriteSink) {
        *lock_plain(&self.write_sink) = Some(sink);
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Draw a handle, waiting while the pool is blockaded or at capacity.
    ///
    /// Readers prefer the handle their thread most recently returned; a
    /// write hint skips that affinity so writers spread across handles.
    pub fn checkout(self: &Arc<Self>, write_hint: bool) -> Result<HandleLease> {
        let mut state = self.lock();
        loop {
            if !state.blockaded && !state.close_pending {
                if let Some(handle) = take_idle(&mut state, write_hint) {
                    state.checked_out += 1;
                    let epoch = state.purge_epoch;
                    drop(state);
                    return self.finish_checkout(handle, epoch);
                }
                if state.checked_out + state.idle.len() < self.capacity {
                    state.checked_out += 1;
                    let epoch = state.purge_epoch;
                    drop(state);
                    return self.open_handle(epoch);
                }
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn snapshot(&self) -> TraceSnapshot {
        TraceSnapshot {
            global: global::traces().snapshot(),
            local: self.traces.snapshot(),
        }
    }

    fn finish_checkout(self: &Arc<Self>, mut handle: Handle, epoch: u64) -> Result<HandleLease> {
        handle.epoch = epoch;
        if let Err(err) = self.config.reconcile(&mut handle) {
            self.discard(handle);
            self.release_slot();
            return Err(err);
        }
        Ok(HandleLease {
            handle: Some(handle),
            pool: Arc::clone(self),
        })
    }

    fn open_handle(self: &Arc<Self>, epoch: u64) -> Result<HandleLease> {
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.snapshot();
        let wall_started = Instant::now();
        let cpu_started = thread_cpu_time_us();
        let opened = Handle::open(
            &self.path,
            id,
            self.database_id,
            Arc::clone(&self.tag),
            epoch,
            snapshot.clone(),
        )
        .and_then(|mut handle| {
            self.config.reconcile(&mut handle)?;
            Ok(handle)
        });
        let mut handle = match opened {
            Ok(handle) => handle,
            Err(err) => {
                self.release_slot();
                return Err(err);
            }
        };
        if snapshot.traces_operations() {
            let mut info = open_stats(&mut handle);
            info.insert(keys::HANDLE_COUNT, self.handle_count() as i64);
            info.insert(
                keys::HANDLE_OPEN_TIME,
                wall_started.elapsed().as_micros().min(i64::MAX as u128) as i64,
            );
            info.insert(
                keys::HANDLE_OPEN_CPU_TIME,
                (thread_cpu_time_us() - cpu_started).max(0),
            );
            snapshot.on_operation(&OperationEvent {
                operation: DatabaseOperation::OpenHandle,
                path: self.path.clone(),
                tag: self.tag.load(Ordering::Relaxed),
                info,
            });
        }
        Ok(HandleLease {
            handle: Some(handle),
            pool: Arc::clone(self),
        })
    }

    /// Undo a checked-out reservation that never produced a lease.
    fn release_slot(&self) {
        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        if state.checked_out == 0 && state.close_pending {
            self.close_barrier.notify_all();
        }
        drop(state);
        self.available.notify_one();
    }

    fn checkin(&self, mut handle: Handle) {
        let fatal = handle.fatal_code();
        if handle.take_wrote() {
            if let Some(sink) = lock_plain(&self.write_sink).as_ref() {
                sink();
            }
        }
        if let Some(code) = fatal {
            if matches!(code, Code::Corrupt | Code::NotADb) {
                if let Some(sink) = lock_plain(&self.fatal_sink).as_ref() {
                    sink(code);
                }
            }
        }

        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        let discard = fatal.is_some()
            || state.close_pending
            || handle.epoch < state.purge_epoch
            || handle.savepoint_depth() > 0;
        if discard {
            drop(state);
            self.discard(handle);
            state = self.lock();
        } else {
            state.affinity.insert(thread::current().id(), handle.id());
            state.idle.push(handle);
        }
        if state.checked_out == 0 && state.close_pending {
            self.close_barrier.notify_all();
        }
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self, mut handle: Handle) {
        self.config.unwind(&mut handle);
    }

    pub fn blockade(&self) {
        self.lock().blockaded = true;
    }

    pub fn unblockade(&self) {
        self.lock().blockaded = false;
        self.available.notify_all();
    }

    pub fn is_blockaded(&self) -> bool {
        self.lock().blockaded
    }

    /// Quiesce and drain the pool:
    /// blockade, wait for every lease to return, finalize the idle handles,
    /// run `on_closed` while still blockaded, then lift the blockade.
    pub fn close(&self, on_closed: impl FnOnce()) {
        let mut state = self.lock();
        state.blockaded = true;
        state.close_pending = true;
        while state.checked_out > 0 {
            state = self
                .close_barrier
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        let drained: Vec<Handle> = state.idle.drain(..).collect();
        state.affinity.clear();
        drop(state);
        for handle in drained {
            self.discard(handle);
        }

        on_closed();

        let mut state = self.lock();
        state.close_pending = false;
        state.blockaded = false;
        drop(state);
        self.available.notify_all();
    }

    /// Finalize every idle handle without blockading. Handles currently
    /// checked out are finalized on their next checkin.
    pub fn purge(&self) {
        let mut state = self.lock();
        let drained: Vec<Handle> = state.idle.drain(..).collect();
        state.purge_epoch += 1;
        state.affinity.clear();
        drop(state);
        for handle in drained {
            self.discard(handle);
        }
    }

    pub fn is_opened(&self) -> bool {
        let state = self.lock();
        !state.idle.is_empty() || state.checked_out > 0
    }

    pub fn handle_count(&self) -> usize {
        let state = self.lock();
        state.idle.len() + state.checked_out
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_plain<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_idle(state: &mut PoolState, write_hint: bool) -> Option<Handle> {
    if !write_hint {
        if let Some(&preferred) = state.affinity.get(&thread::current().id()) {
            if let Some(at) = state.idle.iter().position(|handle| handle.id() == preferred) {
                return Some(state.idle.remove(at));
            }
        }
    }
    state.idle.pop()
}

/// Schema statistics for the OpenHandle operation event. Best effort; a
/// failed query just leaves its key out.
fn open_stats(handle: &mut Handle) -> FxHashMap<&'static str, i64> {
    let mut info = FxHashMap::default();
    let conn = &handle.conn;
    let pages: Option<i64> = conn.query_row("PRAGMA page_count", [], |row| row.get(0)).ok();
    let page_size: Option<i64> = conn.query_row("PRAGMA page_size", [], |row| row.get(0)).ok();
    if let (Some(pages), Some(page_size)) = (pages, page_size) {
        info.insert(keys::SCHEMA_USAGE, pages * page_size);
    }
    let mut counts = |kind: &str, key: &'static str| {
        if let Ok(count) = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = ?1",
            [kind],
            |row| row.get::<_, i64>(0),
        ) {
            info.insert(key, count);
        }
    };
    counts("table", keys::TABLE_COUNT);
    counts("index", keys::INDEX_COUNT);
    counts("trigger", keys::TRIGGER_COUNT);
    info
}

/// RAII lease over one handle. Destruction returns the handle to the pool on
/// every exit path, including unwinding, and never blocks.
pub struct HandleLease {
    handle: Option<Handle>,
    pool: Arc<HandlePool>,
}

impl Deref for HandleLease {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        self.handle.as_ref().expect("lease already returned")
    }
}

impl DerefMut for HandleLease {
    fn deref_mut(&mut self) -> &mut Handle {
        self.handle.as_mut().expect("lease already returned")
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.checkin(handle);
        }
    }
}
