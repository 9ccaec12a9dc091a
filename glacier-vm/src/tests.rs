use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use glacier_cpu::{
    a64::asm,
    decoder::Cond,
    graph::GraphBuilder,
    liveness,
    regs::{Register, REG_LR},
    ExceptionCode, ThreadControl,
};
use glacier_jit::DirectCall;
use glacier_mem::perm;

use super::*;
use crate::queue::Queue;

const BASE: u64 = 0x1000;
const CALLEE: u64 = 0x2000;
const DATA: u64 = 0x20000;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("GLACIER_LOG"))
        .with_test_writer()
        .try_init();
}

fn test_config() -> Config {
    Config { enable_optimized_tier: false, enable_verifier: true, ..Config::default() }
}

fn setup(config: Config, regions: &[(u64, &[u32])]) -> Translator {
    init_logging();
    let mem = GuestMemory::new();
    for (addr, code) in regions {
        assert!(mem.map_memory_len(*addr, code.len() as u64 * 4, perm::RX));
        mem.write_bytes(*addr, &asm::assemble(code), perm::NONE).unwrap();
    }
    assert!(mem.map_memory_len(DATA, 0x1000, perm::RW));
    Translator::new(Arc::new(mem), config).unwrap()
}

/// A fresh thread whose link register is zero, so returning from the entry routine halts.
fn new_state(translator: &Translator) -> ThreadState {
    ThreadState::new(translator.memory().clone())
}

fn countdown_loop() -> Vec<u32> {
    vec![
        asm::movz(0, 10, 0),
        asm::movz(1, 0, 0),
        // loop:
        asm::add_imm(1, 1, 2),
        asm::subs_imm(0, 0, 1),
        asm::b_cond(BASE + 16, BASE + 8, Cond::NE),
        asm::ret(),
    ]
}

fn call_program() -> Vec<(u64, Vec<u32>)> {
    vec![
        (BASE, vec![
            asm::movz(0, 3, 0),
            asm::movz(1, 4, 0),
            asm::bl(BASE + 8, CALLEE),
            asm::add_reg(2, 0, 0),
            asm::b(BASE + 16, 0),
        ]),
        (CALLEE, vec![asm::add_reg(0, 0, 1), asm::ret()]),
    ]
}

fn setup_owned(config: Config, regions: &[(u64, Vec<u32>)]) -> Translator {
    let regions: Vec<(u64, &[u32])> =
        regions.iter().map(|(addr, code)| (*addr, code.as_slice())).collect();
    setup(config, &regions)
}

/// An infinite loop incrementing x1.
fn spin_loop() -> Vec<u32> {
    vec![asm::add_imm(1, 1, 1), asm::b(BASE + 4, BASE)]
}

#[test]
fn loop_runs_to_completion() {
    let translator = setup(test_config(), &[(BASE, &countdown_loop())]);
    let mut state = new_state(&translator);

    assert_eq!(translator.execute(&mut state, BASE), VmExit::Halt);
    assert_eq!(state.read_int(0), 0);
    assert_eq!(state.read_int(1), 20);
    assert_eq!(state.icount(), 2 + 10 * 3 + 1);
    assert_eq!(state.pc, 0);

    // The entry block, the loop body and the exit block.
    let stats = translator.stats();
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.fast_compiles, 3);
    assert_eq!(stats.hits, 8);
}

#[test]
fn calls_return_through_the_driver() {
    let translator = setup_owned(test_config(), &call_program());
    let mut state = new_state(&translator);

    assert_eq!(translator.execute(&mut state, BASE), VmExit::Halt);
    assert_eq!(state.read_int(0), 7);
    assert_eq!(state.read_int(2), 14);
    assert_eq!(state.read_int(REG_LR), BASE + 12);
}

#[derive(Default)]
struct Syscalls {
    calls: Vec<u64>,
}

impl Environment for Syscalls {
    fn handle_exception(&mut self, state: &mut ThreadState) -> Option<VmExit> {
        if state.exception.kind() != ExceptionCode::Syscall {
            return None;
        }
        self.calls.push(state.read_int(8));
        state.write_int(0, state.read_int(0) * 10);
        Some(VmExit::Running)
    }
}

#[test]
fn syscalls_are_handled_by_the_environment() {
    let code = [
        asm::movz(8, 93, 0),
        asm::movz(0, 5, 0),
        asm::svc(0),
        asm::add_imm(0, 0, 1),
        asm::ret(),
    ];
    let translator = setup(test_config(), &[(BASE, &code)]);

    let mut env = Syscalls::default();
    let mut state = new_state(&translator);
    assert_eq!(translator.execute_with_env(&mut state, BASE, &mut env), VmExit::Halt);
    assert_eq!(env.calls, [93]);
    assert_eq!(state.read_int(0), 51);
    assert_eq!(state.exception.kind(), ExceptionCode::None);

    // Without an environment the syscall is left unhandled, resuming after the `svc`.
    let mut state = new_state(&translator);
    let exit = translator.execute(&mut state, BASE);
    assert_eq!(exit, VmExit::UnhandledException((ExceptionCode::Syscall, 0)));
    assert_eq!(state.pc, BASE + 12);
}

#[test]
fn breakpoints_and_faults_stop_execution() {
    let code = [asm::movz(2, 0x9000, 0), asm::ldr(0, 2, 0), asm::brk(7)];
    let translator = setup(test_config(), &[(BASE, &code), (CALLEE, &[asm::brk(7)])]);

    let mut state = new_state(&translator);
    let exit = translator.execute(&mut state, BASE);
    assert_eq!(exit, VmExit::UnhandledException((ExceptionCode::ReadUnmapped, 0x9000)));
    assert_eq!(state.pc, BASE + 4);
    assert_eq!(state.read_int(2), 0x9000);

    let mut state = new_state(&translator);
    assert_eq!(translator.execute(&mut state, CALLEE), VmExit::Breakpoint);
    assert_eq!(state.pc, CALLEE);
}

#[test]
fn unsupported_mode_raises_invalid_instruction() {
    let translator = setup(test_config(), &[(BASE, &[asm::nop(), asm::ret()])]);
    let mut state = new_state(&translator);
    state.mode = ExecutionMode::Aarch32;
    assert_eq!(
        translator.execute(&mut state, BASE),
        VmExit::UnhandledException((ExceptionCode::InvalidInstruction, BASE))
    );
}

#[test]
fn self_modifying_code_is_retranslated() {
    let translator = setup(test_config(), &[(BASE, &[asm::movz(0, 1, 0), asm::ret()])]);
    let mut state = new_state(&translator);
    assert_eq!(translator.execute(&mut state, BASE), VmExit::Halt);
    assert_eq!(state.read_int(0), 1);
    assert!(translator.memory().is_code(BASE));

    let patch = asm::assemble(&[asm::movz(0, 2, 0)]);
    translator.memory().write_bytes(BASE, &patch, perm::NONE).unwrap();
    assert!(translator.cache().get(CacheKey::new(BASE, ExecutionMode::Aarch64)).is_none());
    assert_eq!(translator.stats().invalidated, 1);

    let mut state = new_state(&translator);
    assert_eq!(translator.execute(&mut state, BASE), VmExit::Halt);
    assert_eq!(state.read_int(0), 2);
}

#[test]
fn invalidation_round_trip() {
    let translator = setup(test_config(), &[(BASE, &countdown_loop())]);
    let mut first = new_state(&translator);
    assert_eq!(translator.execute(&mut first, BASE), VmExit::Halt);

    assert_eq!(translator.invalidate_range(BASE, 24), 3);
    assert!(translator.cache().is_empty());
    // Ranges that do not overlap any routine evict nothing.
    assert_eq!(translator.invalidate_range(0x5000, 0x1000), 0);

    let mut second = new_state(&translator);
    assert_eq!(translator.execute(&mut second, BASE), VmExit::Halt);
    assert_eq!(first.regs, second.regs);
    assert_eq!(first.icount(), second.icount());
}

#[test]
fn optimized_callers_pass_exactly_the_callee_parameters() {
    let translator = setup_owned(test_config(), &call_program());
    let _guard = translator.register_thread();
    let key = |address| CacheKey::new(address, ExecutionMode::Aarch64);

    assert!(translator.request(QueueItem::optimize(CALLEE, ExecutionMode::Aarch64)));
    translator.wait_for_background();
    let callee = translator.cache().get(key(CALLEE)).unwrap();
    assert_eq!(callee.tier(), Tier::Optimized);
    assert_eq!(callee.routine.params, [Register::int(0), Register::int(1), Register::int(REG_LR)]);

    assert!(translator.request(QueueItem::optimize(BASE, ExecutionMode::Aarch64)));
    translator.wait_for_background();
    let caller = translator.cache().get(key(BASE)).unwrap();
    assert_eq!(caller.tier(), Tier::Optimized);
    assert_eq!(caller.routine.direct_calls, [DirectCall {
        target: CALLEE,
        args: vec![Register::int(0), Register::int(1), Register::int(REG_LR)],
    }]);

    let mut state = new_state(&translator);
    assert_eq!(translator.execute(&mut state, BASE), VmExit::Halt);
    assert_eq!(state.read_int(0), 7);
    assert_eq!(state.read_int(2), 14);
    assert_eq!(state.call_depth, 0);

    // Modifying the callee also evicts the routine that calls it directly.
    assert_eq!(translator.invalidate_range(CALLEE, 4), 2);
    assert!(translator.cache().is_empty());

    let mut state = new_state(&translator);
    assert_eq!(translator.execute(&mut state, BASE), VmExit::Halt);
    assert_eq!(state.read_int(2), 14);
}

#[test]
fn optimized_compiles_queue_calls_that_were_not_inlined() {
    let translator = setup_owned(test_config(), &call_program());
    let _guard = translator.register_thread();
    assert!(translator.request(QueueItem::optimize(BASE, ExecutionMode::Aarch64)));
    translator.wait_for_background();

    let caller = translator.cache().get(CacheKey::new(BASE, ExecutionMode::Aarch64)).unwrap();
    assert!(caller.routine.direct_calls.is_empty());
    assert_eq!(
        translator.cache().tier(CacheKey::new(CALLEE, ExecutionMode::Aarch64)),
        Some(Tier::Optimized)
    );
    assert_eq!(translator.stats().optimized_compiles, 2);
}

fn fast_routine(translator: &Translator, address: u64) -> CompiledRoutine {
    let mut emitter = RoutineEmitter::new(
        Tier::Fast,
        Arc::new(glacier_jit::a64::codegen_table()),
        EmitterOptions::default(),
    )
    .unwrap();
    let graph = GraphBuilder::default()
        .build_single(translator.memory(), address, ExecutionMode::Aarch64)
        .unwrap();
    emitter.emit(&graph, &liveness::analyze_fast(&graph), &()).unwrap()
}

#[test]
fn tiers_only_move_up() {
    let translator = setup(test_config(), &[(BASE, &countdown_loop())]);
    let _guard = translator.register_thread();
    let key = CacheKey::new(BASE, ExecutionMode::Aarch64);

    let fast = QueueItem { tier: Tier::Fast, full_graph: false, ..QueueItem::optimize(BASE, key.mode) };
    assert!(translator.request(fast));
    assert!(translator.request(QueueItem::optimize(BASE, key.mode)));
    translator.wait_for_background();
    assert_eq!(translator.cache().tier(key), Some(Tier::Optimized));

    // Requests for a tier that is already present are dropped.
    assert!(!translator.request(fast));
    assert!(!translator.request(QueueItem::optimize(BASE, key.mode)));

    // A later Fast publish keeps the optimized routine.
    let generation = translator.cache().generation();
    let winner = translator.cache().publish(fast_routine(&translator, BASE), generation).unwrap();
    assert_eq!(winner.tier(), Tier::Optimized);
    assert_eq!(translator.cache().tier(key), Some(Tier::Optimized));
}

#[test]
fn stale_publishes_are_discarded() {
    let translator = setup(test_config(), &[(BASE, &countdown_loop())]);
    let generation = translator.cache().generation();
    let routine = fast_routine(&translator, BASE);

    translator.invalidate_range(BASE, 4);
    assert!(translator.cache().publish(routine, generation).is_none());
    assert!(translator.cache().is_empty());
    assert_eq!(translator.stats().stale_publishes, 1);

    let routine = fast_routine(&translator, BASE);
    let entry = translator.cache().publish(routine, translator.cache().generation()).unwrap();
    assert_eq!(entry.tier(), Tier::Fast);
    // 5 operations with the default budget.
    assert_eq!(entry.threshold, 4096 / 5);
}

#[test]
fn hot_routines_are_promoted() {
    let config = Config { enable_optimized_tier: true, promote_op_budget: 3, ..test_config() };
    let translator = setup(config, &[(BASE, &countdown_loop())]);
    let _guard = translator.register_thread();

    let mut state = new_state(&translator);
    assert_eq!(translator.execute(&mut state, BASE), VmExit::Halt);
    translator.wait_for_background();

    let loop_body = CacheKey::new(BASE + 8, ExecutionMode::Aarch64);
    assert_eq!(translator.cache().tier(loop_body), Some(Tier::Optimized));
    assert!(translator.stats().optimized_compiles >= 1);

    // Results do not depend on which tier ran.
    let mut again = new_state(&translator);
    assert_eq!(translator.execute(&mut again, BASE), VmExit::Halt);
    assert_eq!(state.regs, again.regs);
    assert_eq!(state.icount(), again.icount());
}

#[test]
fn tiers_are_transparent() {
    let programs = [
        vec![(BASE, countdown_loop())],
        call_program(),
        vec![(BASE, vec![
            asm::movn(0, 0, 0),
            asm::adds_imm(1, 0, 1),
            asm::cbz(1, BASE + 8, BASE + 16),
            asm::movz(3, 1, 0),
            asm::eor_reg(2, 0, 1),
            asm::ret(),
        ])],
    ];

    for program in programs {
        let fast = setup_owned(test_config(), &program);
        let mut fast_state = new_state(&fast);
        let fast_exit = fast.execute(&mut fast_state, BASE);

        let optimized = setup_owned(test_config(), &program);
        let _guard = optimized.register_thread();
        for (addr, _) in &program {
            optimized.request(QueueItem::optimize(*addr, ExecutionMode::Aarch64));
            optimized.wait_for_background();
        }
        let mut optimized_state = new_state(&optimized);
        let optimized_exit = optimized.execute(&mut optimized_state, BASE);

        assert_eq!(fast_exit, optimized_exit);
        assert_eq!(fast_state.regs, optimized_state.regs, "{program:x?}");
        assert_eq!(fast_state.icount(), optimized_state.icount(), "{program:x?}");
    }
}

#[test]
fn instruction_limit() {
    let translator = setup(test_config(), &[(BASE, &spin_loop())]);

    let mut state = new_state(&translator);
    state.icount_limit = 1000;
    assert_eq!(translator.execute(&mut state, BASE), VmExit::InstructionLimit);
    assert_eq!(state.icount(), 1000);
    assert_eq!(state.read_int(1), 500);
    assert_eq!(state.pc, BASE);

    // A budget smaller than the next routine makes no progress.
    let mut state = new_state(&translator);
    state.icount_limit = 1001;
    assert_eq!(translator.execute(&mut state, BASE), VmExit::InstructionLimit);
    assert_eq!(state.icount(), 1000);
    assert_eq!(state.pc, BASE);
}

struct StopOnInterrupt;

impl Environment for StopOnInterrupt {
    fn handle_exception(&mut self, _: &mut ThreadState) -> Option<VmExit> {
        None
    }

    fn handle_interrupt(&mut self, _: &mut ThreadState) -> Option<VmExit> {
        Some(VmExit::Interrupted)
    }
}

#[test]
fn threads_can_be_interrupted_and_stopped() {
    let config = Config { enable_optimized_tier: true, ..test_config() };
    let translator = setup(config, &[(BASE, &spin_loop())]);
    let control = ThreadControl::new();

    std::thread::scope(|s| {
        let handle = s.spawn(|| {
            let _guard = translator.register_thread();
            let mut state = ThreadState::with_control(translator.memory().clone(), control.clone());
            translator.execute_with_env(&mut state, BASE, &mut StopOnInterrupt)
        });
        std::thread::sleep(Duration::from_millis(20));
        control.interrupt();
        assert_eq!(handle.join().unwrap(), VmExit::Interrupted);
    });

    std::thread::scope(|s| {
        let handle = s.spawn(|| {
            let mut state = ThreadState::with_control(translator.memory().clone(), control.clone());
            let exit = translator.execute(&mut state, BASE);
            (exit, state.read_int(1))
        });
        std::thread::sleep(Duration::from_millis(20));
        control.stop();
        let (exit, _) = handle.join().unwrap();
        assert_eq!(exit, VmExit::Stopped);
    });
}

#[test]
fn replaced_control_is_polled_by_compiled_code() {
    // The driver never regains control on its own, only the routine's checkpoint can stop it.
    let config = Config { fuel_quantum: u64::MAX, ..test_config() };
    let translator = setup(config, &[(BASE, &spin_loop())]);
    let control = ThreadControl::new();

    std::thread::scope(|s| {
        let handle = s.spawn(|| {
            let mut state = new_state(&translator);
            state.set_control(control.clone());
            translator.execute_with_env(&mut state, BASE, &mut StopOnInterrupt)
        });
        std::thread::sleep(Duration::from_millis(20));
        control.interrupt();
        assert_eq!(handle.join().unwrap(), VmExit::Interrupted);
    });
}

#[test]
fn threads_share_the_cache() {
    let config = Config { enable_optimized_tier: true, promote_op_budget: 16, ..test_config() };
    let translator = setup(config, &[(BASE, &countdown_loop())]);

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let _guard = translator.register_thread();
                    let mut results = vec![];
                    for _ in 0..20 {
                        let mut state = new_state(&translator);
                        let exit = translator.execute(&mut state, BASE);
                        results.push((exit, state.read_int(1), state.icount()));
                    }
                    results
                })
            })
            .collect();
        for handle in handles {
            for result in handle.join().unwrap() {
                assert_eq!(result, (VmExit::Halt, 20, 33));
            }
        }
    });
    assert_eq!(translator.active_threads(), 0);
}

#[test]
fn worker_stops_with_the_last_thread() -> anyhow::Result<()> {
    let translator = setup(test_config(), &[(BASE, &countdown_loop())]);
    let first = translator.register_thread();
    let second = translator.register_thread();

    anyhow::ensure!(translator.request(QueueItem::optimize(BASE, ExecutionMode::Aarch64)));
    translator.wait_for_background();
    anyhow::ensure!(translator.is_worker_running());

    drop(first);
    anyhow::ensure!(translator.is_worker_running());
    drop(second);

    let deadline = Instant::now() + Duration::from_secs(10);
    while translator.is_worker_running() {
        anyhow::ensure!(Instant::now() < deadline, "worker did not exit");
        std::thread::sleep(Duration::from_millis(1));
    }
    anyhow::ensure!(!translator.request(QueueItem::optimize(BASE + 8, ExecutionMode::Aarch64)));

    // Registering a thread again restarts background compilation.
    let _guard = translator.register_thread();
    anyhow::ensure!(translator.request(QueueItem::optimize(BASE + 8, ExecutionMode::Aarch64)));
    translator.wait_for_background();
    let tier = translator.cache().tier(CacheKey::new(BASE + 8, ExecutionMode::Aarch64));
    anyhow::ensure!(tier == Some(Tier::Optimized), "unexpected tier: {tier:?}");
    Ok(())
}

#[test]
fn queue_coalesces_pending_requests() {
    let queue = Queue::default();
    let item = QueueItem::optimize(BASE, ExecutionMode::Aarch64);
    let fast = QueueItem { tier: Tier::Fast, ..item };

    assert!(queue.push(item));
    assert!(!queue.push(item));
    assert!(queue.push(fast));
    assert_eq!(queue.len(), 2);

    // Items come out in request order and stay pending until finished.
    assert_eq!(queue.pop(), Some(item));
    assert!(!queue.push(item));
    queue.finish(&item);
    assert!(queue.push(item));

    queue.shutdown();
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.pop(), None);
    assert!(!queue.push(fast));

    queue.add_thread();
    assert!(queue.push(fast));
}

#[test]
fn queue_is_open_while_threads_are_registered() {
    let queue = Queue::closed();
    let item = QueueItem::optimize(BASE, ExecutionMode::Aarch64);
    assert!(!queue.push(item));
    assert!(!queue.claim_worker());

    queue.add_thread();
    queue.add_thread();
    assert!(queue.push(item));
    assert!(!queue.remove_thread());
    assert_eq!(queue.threads(), 1);
    assert_eq!(queue.len(), 1);
    assert!(queue.remove_thread());
    assert_eq!(queue.len(), 0);
    assert!(!queue.push(item));
}

#[test]
fn a_worker_leaving_the_queue_can_be_replaced() {
    let queue = Queue::closed();
    let item = QueueItem::optimize(BASE, ExecutionMode::Aarch64);

    queue.add_thread();
    assert!(queue.claim_worker());
    assert!(!queue.claim_worker());

    // The last thread leaves and a new one arrives before the worker notices.
    assert!(queue.remove_thread());
    queue.add_thread();
    assert!(queue.push(item));
    assert!(!queue.claim_worker());

    // The running worker picks the item up instead of exiting.
    assert_eq!(queue.pop(), Some(item));
    queue.finish(&item);

    // Once the worker has left, a new one must be started.
    assert!(queue.remove_thread());
    assert_eq!(queue.pop(), None);
    queue.add_thread();
    assert!(queue.push(item));
    assert!(queue.claim_worker());
}

#[test]
fn background_compilation_survives_thread_churn() {
    let translator = setup(test_config(), &[(BASE, &countdown_loop())]);
    for i in 0..20 {
        let guard = translator.register_thread();
        let addr = if i % 2 == 0 { BASE } else { BASE + 8 };
        translator.cache().invalidate_range(addr, 4);
        assert!(translator.request(QueueItem::optimize(addr, ExecutionMode::Aarch64)));
        translator.wait_for_background();
        assert_eq!(
            translator.cache().tier(CacheKey::new(addr, ExecutionMode::Aarch64)),
            Some(Tier::Optimized)
        );
        drop(guard);
    }
}

#[test]
fn execution_does_not_keep_the_worker_alive() -> anyhow::Result<()> {
    let config = Config { enable_optimized_tier: true, promote_op_budget: 3, ..test_config() };
    let translator = setup(config, &[(BASE, &countdown_loop())]);

    let mut state = new_state(&translator);
    anyhow::ensure!(translator.execute(&mut state, BASE) == VmExit::Halt);
    anyhow::ensure!(translator.active_threads() == 0);

    let deadline = Instant::now() + Duration::from_secs(10);
    while translator.is_worker_running() {
        anyhow::ensure!(Instant::now() < deadline, "worker outlived the execution thread");
        std::thread::sleep(Duration::from_millis(1));
    }
    anyhow::ensure!(!translator.request(QueueItem::optimize(BASE, ExecutionMode::Aarch64)));
    Ok(())
}
