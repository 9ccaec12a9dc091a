pub mod cache;
mod env;
mod queue;

#[cfg(test)]
mod tests;

use std::{sync::Arc, thread::JoinHandle};

use parking_lot::Mutex;

use glacier_cpu::{
    graph::GraphBuilder, liveness, Config, Exception, ExceptionCode, ExecutionMode, ThreadState,
    PAUSED_ADDR,
};
use glacier_jit::{CodegenTable, CompiledRoutine, EmitError, EmitterOptions, RoutineEmitter, Tier};
use glacier_mem::GuestMemory;

pub use crate::{
    cache::{CacheEntry, CacheKey, Stats, TranslationCache},
    env::Environment,
    queue::QueueItem,
};
pub use glacier_cpu::VmExit;

use crate::{cache::Counters, queue::Queue};

/// State shared between the execution threads and the compilation worker.
struct Shared {
    config: Config,
    mem: Arc<GuestMemory>,
    codegen: Arc<CodegenTable>,
    cache: TranslationCache,

    /// The backend used for compiling on a cache miss, shared by every execution thread.
    fast: Mutex<RoutineEmitter>,

    queue: Queue,
}

impl Shared {
    /// Returns the cache entry for `key`, compiling a Fast routine on a miss.
    fn lookup(&self, key: CacheKey) -> Result<CacheEntry, EmitError> {
        loop {
            if let Some(entry) = self.cache.get(key) {
                Counters::bump(&self.cache.counters.hits);
                return Ok(entry);
            }
            Counters::bump(&self.cache.counters.misses);

            let generation = self.cache.generation();
            let (routine, _) = self.compile(&mut self.fast.lock(), key, false)?;
            if let Some(entry) = self.cache.publish(routine, generation) {
                return Ok(entry);
            }
            // The code changed while it was being compiled, translate it again.
        }
    }

    /// Builds, analyzes and emits the routine at `key`, returning it together with the targets of
    /// the calls in its graph.
    fn compile(
        &self,
        emitter: &mut RoutineEmitter,
        key: CacheKey,
        full_graph: bool,
    ) -> Result<(CompiledRoutine, Vec<u64>), EmitError> {
        let builder = GraphBuilder::new(&self.config);
        let (graph, liveness) = match full_graph {
            true => {
                let graph = builder.build_graph(&self.mem, key.address, key.mode)?;
                let liveness = liveness::analyze(&graph, self.config.exhaustive_liveness_limit);
                (graph, liveness)
            }
            false => {
                let graph = builder.build_single(&self.mem, key.address, key.mode)?;
                let liveness = liveness::analyze_fast(&graph);
                (graph, liveness)
            }
        };

        let routine = emitter.emit(&graph, &liveness, &self.cache)?;
        let counter = match emitter.tier() {
            Tier::Fast => &self.cache.counters.fast_compiles,
            Tier::Optimized => &self.cache.counters.optimized_compiles,
        };
        Counters::bump(counter);

        tracing::trace!(
            "compiled {:?} routine at {:#x}: {} blocks, {} ops, params={:?}",
            routine.tier,
            routine.address,
            graph.len(),
            routine.guest_ops,
            routine.params
        );
        Ok((routine, graph.call_targets().collect()))
    }

    /// Queues `item` unless the cache already holds a routine of the same or a higher tier.
    fn enqueue(&self, item: QueueItem) -> bool {
        if self.cache.tier(item.key()).map_or(false, |tier| tier >= item.tier) {
            return false;
        }
        self.queue.push(item)
    }

    fn process(&self, optimizer: &mut RoutineEmitter, item: QueueItem) {
        let key = item.key();
        if self.cache.tier(key).map_or(false, |tier| tier >= item.tier) {
            tracing::trace!("skipping {item:x?}, already compiled");
            return;
        }

        let generation = self.cache.generation();
        let result = match item.tier {
            Tier::Fast => self.compile(&mut self.fast.lock(), key, item.full_graph),
            Tier::Optimized => self.compile(optimizer, key, item.full_graph),
        };
        let (routine, call_targets) = match result {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::error!("background compilation of {:#x} failed: {e}", key.address);
                return;
            }
        };

        let inlined: Vec<u64> = routine.direct_calls.iter().map(|call| call.target).collect();
        let Some(entry) = self.cache.publish(routine, generation)
        else {
            return;
        };
        tracing::debug!(
            "{:#x} is now {:?} ({} bytes of code, {} direct calls)",
            key.address,
            entry.tier(),
            entry.routine.code_size,
            entry.routine.direct_calls.len()
        );

        // Calls that went back to the driver are queued so that the next compile of this routine
        // can call them directly.
        if item.tier == Tier::Optimized {
            for target in call_targets.into_iter().filter(|target| !inlined.contains(target)) {
                self.enqueue(QueueItem::optimize(target, key.mode));
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let options = EmitterOptions::from_config(&shared.config);
    let mut optimizer = match RoutineEmitter::new(Tier::Optimized, shared.codegen.clone(), options)
    {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!("failed to create the optimizing backend: {e}");
            shared.queue.abandon();
            return;
        }
    };

    tracing::debug!("compilation worker started");
    while let Some(item) = shared.queue.pop() {
        shared.process(&mut optimizer, item);
        shared.queue.finish(&item);
    }
    tracing::debug!("compilation worker exiting after {} routines", optimizer.compiled);
}

/// Keeps the compilation worker alive while an execution thread is running. See
/// [Translator::register_thread].
pub struct ThreadGuard {
    shared: Arc<Shared>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        if self.shared.queue.remove_thread() {
            tracing::debug!("last execution thread exited, stopped background compilation");
        }
    }
}

/// Translates guest code on demand and drives execution threads through the compiled routines.
pub struct Translator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    write_hook: usize,
}

impl Translator {
    pub fn new(mem: Arc<GuestMemory>, config: Config) -> Result<Self, EmitError> {
        Self::with_codegen(mem, config, Arc::new(glacier_jit::a64::codegen_table()))
    }

    pub fn with_codegen(
        mem: Arc<GuestMemory>,
        config: Config,
        codegen: Arc<CodegenTable>,
    ) -> Result<Self, EmitError> {
        let fast = RoutineEmitter::new(
            Tier::Fast,
            codegen.clone(),
            EmitterOptions::from_config(&config),
        )?;

        let shared = Arc::new(Shared {
            cache: TranslationCache::new(config.promote_op_budget),
            config,
            mem,
            codegen,
            fast: Mutex::new(fast),
            queue: Queue::closed(),
        });

        let weak = Arc::downgrade(&shared);
        let write_hook = shared.mem.add_write_hook(Box::new(move |addr: u64, len: u64| {
            if let Some(shared) = weak.upgrade() {
                shared.cache.invalidate_range(addr, len);
            }
        }));

        Ok(Self { shared, worker: Mutex::new(None), write_hook })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.shared.mem
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.shared.cache
    }

    pub fn stats(&self) -> Stats {
        self.shared.cache.counters.snapshot()
    }

    /// Returns the best routine compiled for `address`, compiling a Fast routine if there is none.
    pub fn get_or_translate(
        &self,
        address: u64,
        mode: ExecutionMode,
    ) -> Result<Arc<CompiledRoutine>, EmitError> {
        self.shared.lookup(CacheKey::new(address, mode)).map(|entry| entry.routine)
    }

    /// Queues a background compilation, starting the worker if needed. Returns `false` if the
    /// request was dropped, which includes every request made while no thread is registered.
    pub fn request(&self, item: QueueItem) -> bool {
        if !self.shared.enqueue(item) {
            return false;
        }
        self.ensure_worker();
        true
    }

    fn ensure_worker(&self) {
        if !self.shared.queue.claim_worker() {
            return;
        }
        let mut worker = self.worker.lock();
        // The previous worker, if any, has already left its queue loop.
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        let shared = self.shared.clone();
        let spawn = std::thread::Builder::new()
            .name("glacier-optimizer".into())
            .spawn(move || worker_loop(shared));
        match spawn {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                tracing::error!("failed to start the compilation worker: {e}");
                self.shared.queue.abandon();
            }
        }
    }

    /// Blocks until every queued compilation has finished.
    pub fn wait_for_background(&self) {
        self.shared.queue.wait_idle();
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker.lock().as_ref().map_or(false, |handle| !handle.is_finished())
    }

    /// Registers an execution thread. Background compilation stops once every returned guard
    /// has been dropped, and resumes when a thread is registered again.
    pub fn register_thread(&self) -> ThreadGuard {
        self.shared.queue.add_thread();
        ThreadGuard { shared: self.shared.clone() }
    }

    pub fn active_threads(&self) -> usize {
        self.shared.queue.threads()
    }

    /// Evicts every routine compiled from `[address, address + size)` and every routine that
    /// calls one of them directly.
    pub fn invalidate_range(&self, address: u64, size: u64) -> usize {
        self.shared.cache.invalidate_range(address, size)
    }

    pub fn execute(&self, state: &mut ThreadState, start: u64) -> VmExit {
        self.execute_with_env(state, start, &mut ())
    }

    /// Runs guest code starting at `start` until the guest halts, an exception is left unhandled
    /// by `env`, the instruction limit is reached or the thread is stopped. On return `state.pc`
    /// is the address execution would resume at.
    pub fn execute_with_env(
        &self,
        state: &mut ThreadState,
        start: u64,
        env: &mut dyn Environment,
    ) -> VmExit {
        let _guard = self.register_thread();
        let config = &self.shared.config;
        let mut addr = start;
        loop {
            state.pc = addr;
            if !state.control().is_running() {
                return VmExit::Stopped;
            }

            let icount = state.icount();
            if icount >= state.icount_limit {
                return VmExit::InstructionLimit;
            }
            state.update_fuel((state.icount_limit - icount).min(config.fuel_quantum));

            let key = CacheKey::new(addr, state.mode);
            let entry = match self.shared.lookup(key) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!("failed to translate {addr:#x}: {e}");
                    state.exception = Exception::new(ExceptionCode::JitError, addr);
                    return VmExit::UnhandledException((ExceptionCode::JitError, addr));
                }
            };

            let uses = entry.routine.record_use();
            if entry.tier() == Tier::Fast
                && config.enable_optimized_tier
                && uses % entry.threshold == 0
            {
                tracing::trace!("{addr:#x} is hot after {uses} uses");
                self.request(QueueItem::optimize(addr, state.mode));
            }

            // Safety: routines are evicted as soon as the code they were compiled from is
            // modified.
            let next = unsafe { entry.routine.call(state) };
            // Clear fuel so `icount` is correct.
            state.update_fuel(0);

            match next {
                PAUSED_ADDR => {
                    addr = state.pc;
                    if state.control().clear_interrupt() {
                        if !state.control().is_running() {
                            return VmExit::Stopped;
                        }
                        match env.handle_interrupt(state) {
                            None | Some(VmExit::Running) => addr = state.pc,
                            Some(exit) => return exit,
                        }
                    }
                    else if state.icount() == icount {
                        // Not enough fuel left to enter the routine.
                        return VmExit::InstructionLimit;
                    }
                }
                0 => match self.handle_exception(state, env) {
                    VmExit::Running => addr = state.pc,
                    exit => return exit,
                },
                next => addr = next,
            }
        }
    }

    fn handle_exception(&self, state: &mut ThreadState, env: &mut dyn Environment) -> VmExit {
        let code = state.exception.kind();
        if code == ExceptionCode::None {
            state.pc = 0;
            return VmExit::Halt;
        }

        if let Some(exit) = env.handle_exception(state) {
            if exit == VmExit::Running {
                state.exception.clear();
            }
            return exit;
        }

        tracing::trace!("unhandled {:?} at {:#x}", state.exception, state.pc);
        match code {
            ExceptionCode::SoftwareBreakpoint => VmExit::Breakpoint,
            code => VmExit::UnhandledException((code, state.exception.value)),
        }
    }
}

impl Drop for Translator {
    fn drop(&mut self) {
        self.shared.mem.remove_write_hook(self.write_hook);
        self.shared.queue.shutdown();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        tracing::debug!("translator stats: {:?}", self.stats());
    }
}
