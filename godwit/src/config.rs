//! Ordered, named configuration applied to every handle drawn from the pool.
//!
//! Entries are (invoke, uninvoke) pairs with a priority; smaller priorities
//! run first and cipher configuration owns the minimum so keys are applied
//! before anything else. Replacing or removing an entry bumps the chain
//! generation; a handle checked out with a stale generation first uninvokes
//! what no longer applies (in reverse priority order), then invokes what is
//! missing.

use std::sync::{Arc, Mutex, MutexGuard};

use godwit_result::Result;

use crate::handle::Handle;

/// Priority band of a configuration entry. Smaller runs first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Reserved for cipher configuration.
    Highest,
    High,
    Default,
    Low,
}

impl Priority {
    fn rank(self) -> i32 {
        match self {
            Priority::Highest => -100,
            Priority::High => -50,
            Priority::Default => 0,
            Priority::Low => 50,
        }
    }
}

/// A configuration step applied to a handle.
pub type ConfigFn = Arc<dyn Fn(&mut Handle) -> Result<()> + Send + Sync>;

pub struct ConfigEntry {
    pub(crate) name: String,
    pub(crate) invoke: ConfigFn,
    pub(crate) uninvoke: Option<ConfigFn>,
    priority: Priority,
    seq: u64,
}

#[derive(Default)]
struct ChainState {
    entries: Vec<Arc<ConfigEntry>>,
    generation: u64,
    next_seq: u64,
}

/// The priority-sorted set of configuration entries for one pool.
#[derive(Default)]
pub struct ConfigChain {
    state: Mutex<ChainState>,
}

impl ConfigChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Install or replace the entry called `name`.
    pub fn set(
        &self,
        name: &str,
        invoke: ConfigFn,
        uninvoke: Option<ConfigFn>,
        priority: Priority,
    ) {
        let mut state = self.lock();
        state.entries.retain(|entry| entry.name != name);
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = Arc::new(ConfigEntry {
            name: name.to_string(),
            invoke,
            uninvoke,
            priority,
            seq,
        });
        let at = state
            .entries
            .partition_point(|other| (other.priority.rank(), other.seq) <= (priority.rank(), seq));
        state.entries.insert(at, entry);
        state.generation += 1;
    }

    /// Remove the entry called `name`, if present.
    pub fn remove(&self, name: &str) {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|entry| entry.name != name);
        if state.entries.len() != before {
            state.generation += 1;
        }
    }

    /// Bring `handle` up to date with the chain.
    ///
    /// Stale entries (replaced or removed since the handle last applied the
    /// chain) are uninvoked in reverse priority order using the closures the
    /// handle actually ran, then missing entries are invoked in priority
    /// order. Any invoke failure leaves the handle unusable; the pool
    /// discards it.
    pub(crate) fn reconcile(&self, handle: &mut Handle) -> Result<()> {
        let (entries, generation) = {
            let state = self.lock();
            (state.entries.clone(), state.generation)
        };
        if handle.applied_generation == generation {
            return Ok(());
        }

        let stale: Vec<Arc<ConfigEntry>> = handle
            .applied
            .iter()
            .rev()
            .filter(|applied| !entries.iter().any(|entry| Arc::ptr_eq(entry, applied)))
            .cloned()
            .collect();
        for entry in stale {
            if let Some(uninvoke) = &entry.uninvoke {
                uninvoke(handle)?;
            }
            handle.applied.retain(|applied| !Arc::ptr_eq(applied, &entry));
        }

        for entry in &entries {
            if handle.applied.iter().any(|applied| Arc::ptr_eq(applied, entry)) {
                continue;
            }
            (entry.invoke)(handle)?;
            handle.applied.push(Arc::clone(entry));
        }
        // Keep the applied list in chain order so uninvokes can run reversed.
        handle
            .applied
            .sort_by_key(|entry| (entry.priority.rank(), entry.seq));
        handle.applied_generation = generation;
        Ok(())
    }

    /// Uninvoke everything the handle applied, in reverse priority order.
    /// Used when a handle is finalized.
    pub(crate) fn unwind(&self, handle: &mut Handle) {
        let applied: Vec<Arc<ConfigEntry>> = handle.applied.drain(..).rev().collect();
        for entry in applied {
            if let Some(uninvoke) = &entry.uninvoke {
                if let Err(err) = uninvoke(handle) {
                    tracing::warn!(config = %entry.name, %err, "uninvoke failed during finalize");
                }
            }
        }
        handle.applied_generation = 0;
    }
}
