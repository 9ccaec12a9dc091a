//! The concurrent map from guest addresses to the best routine compiled for them so far.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};
use hashbrown::HashSet;

use glacier_cpu::ExecutionMode;
use glacier_jit::{CalleeResolver, CompiledRoutine, Tier};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub address: u64,
    pub mode: ExecutionMode,
}

impl CacheKey {
    pub fn new(address: u64, mode: ExecutionMode) -> Self {
        Self { address, mode }
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub routine: Arc<CompiledRoutine>,

    /// The routine is queued for promotion every time its use counter reaches a multiple of this.
    pub threshold: u64,
}

impl CacheEntry {
    fn new(routine: CompiledRoutine, promote_op_budget: u64) -> Self {
        let threshold = (promote_op_budget / routine.guest_ops.max(1) as u64).max(1);
        Self { routine: Arc::new(routine), threshold }
    }

    pub fn tier(&self) -> Tier {
        self.routine.tier
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub fast_compiles: AtomicU64,
    pub optimized_compiles: AtomicU64,
    pub invalidated: AtomicU64,
    pub stale_publishes: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Stats {
            hits: load(&self.hits),
            misses: load(&self.misses),
            fast_compiles: load(&self.fast_compiles),
            optimized_compiles: load(&self.optimized_compiles),
            invalidated: load(&self.invalidated),
            stale_publishes: load(&self.stale_publishes),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub fast_compiles: u64,
    pub optimized_compiles: u64,

    /// Number of routines evicted by invalidation, including cascades.
    pub invalidated: u64,

    /// Number of compiled routines dropped because the code changed while they were compiled.
    pub stale_publishes: u64,
}

pub struct TranslationCache {
    map: DashMap<CacheKey, CacheEntry>,

    /// Bumped by every invalidation. Translations sample it before reading guest code and are
    /// only published if it is unchanged.
    generation: AtomicU64,

    promote_op_budget: u64,
    pub(crate) counters: Counters,
}

impl TranslationCache {
    pub fn new(promote_op_budget: u64) -> Self {
        Self {
            map: DashMap::new(),
            generation: AtomicU64::new(0),
            promote_op_budget,
            counters: Counters::default(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn get(&self, key: CacheKey) -> Option<CacheEntry> {
        self.map.get(&key).map(|entry| entry.value().clone())
    }

    pub fn tier(&self, key: CacheKey) -> Option<Tier> {
        self.map.get(&key).map(|entry| entry.tier())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Publishes `routine` if it is a strictly higher tier than the current entry for its key.
    ///
    /// Returns the entry that is current after the call, or `None` if the routine was discarded
    /// because an invalidation happened after `generation` was sampled.
    pub fn publish(&self, routine: CompiledRoutine, generation: u64) -> Option<CacheEntry> {
        let key = CacheKey::new(routine.address, routine.mode);
        // The generation is checked while holding the shard lock, an invalidation bumps it before
        // evicting so it either sees this entry or makes us discard it.
        match self.map.entry(key) {
            Entry::Occupied(mut slot) => {
                if slot.get().tier() >= routine.tier {
                    tracing::trace!(
                        "keeping {:?} routine at {:#x} over {:?}",
                        slot.get().tier(),
                        key.address,
                        routine.tier
                    );
                    return Some(slot.get().clone());
                }
                if self.generation() != generation {
                    return self.discard(key, routine.tier);
                }
                let entry = CacheEntry::new(routine, self.promote_op_budget);
                slot.insert(entry.clone());
                Some(entry)
            }
            Entry::Vacant(slot) => {
                if self.generation() != generation {
                    return self.discard(key, routine.tier);
                }
                let entry = CacheEntry::new(routine, self.promote_op_budget);
                slot.insert(entry.clone());
                Some(entry)
            }
        }
    }

    fn discard(&self, key: CacheKey, tier: Tier) -> Option<CacheEntry> {
        tracing::warn!("discarding stale {tier:?} routine at {:#x}", key.address);
        Counters::bump(&self.counters.stale_publishes);
        None
    }

    /// Evicts every routine translated from code in `[address, address + size)`, then every
    /// routine that calls an evicted routine directly. Returns the number of routines evicted.
    pub fn invalidate_range(&self, address: u64, size: u64) -> usize {
        if size == 0 {
            return 0;
        }
        let end = address.saturating_add(size);
        self.generation.fetch_add(1, Ordering::AcqRel);

        let mut frontier = vec![];
        self.map.retain(|key, entry| {
            let overlaps = entry.routine.overlaps(address, end);
            if overlaps {
                frontier.push(*key);
            }
            !overlaps
        });

        let mut evicted: HashSet<CacheKey> = HashSet::new();
        while !frontier.is_empty() {
            evicted.extend(frontier.iter().copied());
            let mut callers = vec![];
            self.map.retain(|key, entry| {
                let calls_evicted = entry.routine.direct_calls.iter().any(|call| {
                    frontier.contains(&CacheKey::new(call.target, entry.routine.mode))
                });
                if calls_evicted {
                    tracing::trace!("evicting {:#x}, it calls an invalidated routine", key.address);
                    callers.push(*key);
                }
                !calls_evicted
            });
            frontier = callers;
        }

        let count = evicted.len();
        if count != 0 {
            tracing::debug!("invalidated {count} routines for [{address:#x}, {end:#x})");
        }
        self.counters.invalidated.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.map.clear();
    }
}

impl CalleeResolver for TranslationCache {
    fn resolve(&self, address: u64, mode: ExecutionMode) -> Option<Arc<CompiledRoutine>> {
        self.map.get(&CacheKey::new(address, mode)).map(|entry| entry.routine.clone())
    }
}
