//! Structured concurrency: fork/join, interruption, masking, scopes and
//! the racing/parallel combinators, exercised through the public API.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use skein_runtime::{
    Cause, Deferred, Effect, Exit, FiberId, FiberRef, FiberStatus, Runtime, Scope, ScopeExit,
};

fn runtime() -> Runtime {
    skein_runtime::log::init_for_tests(&Default::default());
    Runtime::builder().num_workers(4).build().unwrap()
}

fn log() -> Arc<Mutex<Vec<&'static str>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) -> Effect<()> {
    let log = log.clone();
    Effect::sync(move || log.lock().push(entry))
}

// ============================================================================
// Fork / join
// ============================================================================

#[test]
fn test_fork_then_join_matches_running_directly() {
    let rt = runtime();
    let direct: Exit<i32, String> = rt.run_blocking(Effect::succeed(7));
    let forked = rt.run_blocking(Effect::<i32, String>::succeed(7).fork().flat_map(|f| f.join()));
    assert_eq!(direct, forked);

    let failed = rt.run_blocking(
        Effect::<i32, String>::fail("nope".into()).fork().flat_map(|f| f.join()),
    );
    assert_eq!(failed, Exit::fail("nope".to_string()));
}

#[test]
fn test_many_waiters_see_the_same_exit() {
    let rt = runtime();
    let gate: Deferred<u32> = Deferred::new();
    let target = rt.run_fork(gate.await_value().map(|n| n * 2));
    let waiters: Vec<_> = (0..8).map(|_| rt.run_fork(target.await_exit())).collect();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(rt.run_blocking(gate.succeed(21)), Exit::Success(true));
    for waiter in waiters {
        assert_eq!(rt.run_blocking(waiter.join()), Exit::Success(Exit::Success(42)));
    }
}

#[test]
fn test_interrupt_resolves_with_the_interrupter() {
    let rt = runtime();
    let program = Effect::<()>::never().fork().flat_map(|fiber| {
        Effect::fiber_id().flat_map(move |me| fiber.interrupt().map(move |exit| (me, exit)))
    });
    let (me, exit) = rt.run_blocking(program).into_result().unwrap();
    match exit {
        Exit::Failure(cause) => assert!(cause.interruptors().contains(&me)),
        Exit::Success(()) => panic!("interrupted fiber succeeded"),
    }
}

#[test]
fn test_interrupt_as_attributes_the_given_id() {
    let rt = runtime();
    let fiber = rt.run_fork(Effect::<u8>::never());
    let exit = rt.run_blocking(fiber.interrupt_as(FiberId::None));
    assert_eq!(exit, Exit::Success(Exit::interrupt(FiberId::None)));
    assert_eq!(rt.run_blocking(fiber.poll()), Exit::Success(Some(Exit::interrupt(FiberId::None))));
}

#[test]
fn test_children_are_tracked_and_pruned() {
    let rt = runtime();
    let gate: Deferred<()> = Deferred::new();
    let release = gate.clone();
    let program = Effect::<()>::never()
        .fork()
        .zip_right(gate.await_value().fork())
        .zip_right(Effect::<()>::never());
    let parent = rt.run_fork(program);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(parent.children().len(), 2);

    assert!(rt.run_blocking(release.succeed(())).is_success());
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(parent.children().len(), 1);

    let _ = rt.run_blocking(parent.interrupt());
    assert_eq!(parent.status(), FiberStatus::Done);
    assert!(parent.children().is_empty());
}

#[test]
fn test_daemon_outlives_its_parent() {
    let rt = runtime();
    let daemon = rt
        .run_blocking(Effect::<()>::never().fork_daemon())
        .into_result()
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert!(matches!(daemon.status(), FiberStatus::Suspended { .. }));
    rt.shutdown().unwrap();
    assert!(daemon.try_exit().is_some_and(|exit| exit.is_interrupted()));
}

// ============================================================================
// Interruption control
// ============================================================================

#[test]
fn test_mask_restores_interruptibility_inside() {
    let rt = runtime();
    let steps = log();
    let inside = steps.clone();
    let started: Deferred<()> = Deferred::new();
    let signal = started.clone();
    let body: Effect<()> = Effect::uninterruptible_mask(move |restore| {
        signal
            .succeed(())
            .zip_right(restore.apply(Effect::<()>::never()))
            .on_interrupt(record(&inside, "cleanup"))
            .zip_right(record(&inside, "after"))
    });
    let fiber = rt.run_fork(body);
    assert!(rt.run_blocking(started.await_value()).is_success());
    let exit = rt.run_blocking(fiber.interrupt()).into_result().unwrap();
    assert!(exit.is_interrupted());
    assert_eq!(*steps.lock(), vec!["cleanup"]);
}

#[test]
fn test_interruption_inside_mask_is_deferred() {
    let rt = runtime();
    let steps = log();
    let inside = steps.clone();
    let started: Deferred<()> = Deferred::new();
    let signal = started.clone();
    let body: Effect<()> = signal
        .succeed(())
        .zip_right(Effect::sleep(Duration::from_millis(40)))
        .zip_right(record(&inside, "masked work"))
        .uninterruptible()
        .zip_right(record(&inside, "never"));
    let fiber = rt.run_fork(body);
    assert!(rt.run_blocking(started.await_value()).is_success());
    let exit = rt.run_blocking(fiber.interrupt()).into_result().unwrap();
    assert!(exit.is_interrupted());
    assert_eq!(*steps.lock(), vec!["masked work"]);
}

#[test]
fn test_interrupt_effect_fails_with_own_id() {
    let rt = runtime();
    let program = Effect::<u8>::interrupt().exit().zip(Effect::fiber_id());
    let (exit, me) = rt.run_blocking(program).into_result().unwrap();
    assert_eq!(exit, Exit::interrupt(me));
}

// ============================================================================
// Scopes and resources
// ============================================================================

#[test]
fn test_scoped_finalizers_run_lifo_even_when_one_dies() {
    let rt = runtime();
    let steps = log();
    let first = steps.clone();
    let second = steps.clone();
    let program: Effect<()> = Effect::scoped(
        Effect::<()>::add_finalizer(move |_| record(&first, "f1"))
            .zip_right(Effect::add_finalizer(move |_| {
                record(&second, "f2").zip_right(Effect::die_message("f2 died"))
            })),
    );
    let exit = rt.run_blocking(program);
    assert_eq!(*steps.lock(), vec!["f2", "f1"]);
    let cause = exit.cause().cloned().unwrap();
    assert_eq!(cause.defects()[0].message(), "f2 died");
}

#[test]
fn test_finalizers_see_the_scope_exit() {
    let rt = runtime();
    let seen: Arc<Mutex<Option<ScopeExit>>> = Arc::new(Mutex::new(None));
    let slot = seen.clone();
    let program: Effect<(), String> = Effect::scoped(
        Effect::<(), String>::add_finalizer(move |exit: &ScopeExit| {
            *slot.lock() = Some(exit.clone());
            Effect::unit()
        })
        .zip_right(Effect::fail("broken".to_string())),
    );
    assert_eq!(rt.run_blocking(program), Exit::fail("broken".to_string()));
    let exit = seen.lock().take().unwrap();
    let error = exit
        .cause()
        .and_then(|cause| cause.first_failure()?.downcast_ref::<String>().cloned());
    assert_eq!(error, Some("broken".to_string()));
}

#[test]
fn test_acquire_release_runs_on_interruption() {
    let rt = runtime();
    let steps = log();
    let acquire_log = steps.clone();
    let release_log = steps.clone();
    let started: Deferred<()> = Deferred::new();
    let signal = started.clone();
    let body: Effect<()> = Effect::scoped(
        Effect::acquire_release(record(&acquire_log, "acquire"), move |_, exit| {
            assert!(exit.is_interrupted());
            record(&release_log, "release")
        })
        .zip_right(signal.succeed(()))
        .zip_right(Effect::never()),
    );
    let fiber = rt.run_fork(body);
    assert!(rt.run_blocking(started.await_value()).is_success());
    let exit = rt.run_blocking(fiber.interrupt()).into_result().unwrap();
    assert!(exit.is_interrupted());
    assert_eq!(*steps.lock(), vec!["acquire", "release"]);
}

#[test]
fn test_acquire_use_release_releases_once_on_failure() {
    let rt = runtime();
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let program: Effect<u8, String> = Effect::acquire_use_release(
        Effect::succeed(5u8),
        |n| Effect::fail(format!("used {}", n)),
        move |_, exit| {
            assert!(exit.is_failure());
            Effect::sync(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        },
    );
    assert_eq!(rt.run_blocking(program), Exit::fail("used 5".to_string()));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_closing_a_scope_interrupts_its_fibers_with_the_closer_id() {
    let rt = runtime();
    let scope = Scope::new();
    let closing = scope.clone();
    let program = Effect::<u8>::never().fork_in(&scope).flat_map(move |child| {
        Effect::fiber_id().flat_map(move |me| {
            closing
                .close(Exit::Success(()))
                .zip_right(child.poll())
                .map(move |exit| (me, exit))
        })
    });
    let (me, exit) = rt.run_blocking(program).into_result().unwrap();
    // Done before `close` returned.
    assert_eq!(exit, Some(Exit::interrupt(me)));
    assert!(scope.is_closed());
}

#[test]
fn test_fork_scoped_children_end_with_the_region() {
    let rt = runtime();
    let ended = Arc::new(AtomicBool::new(false));
    let flag = ended.clone();
    let program: Effect<FiberStatus> = Effect::scoped(
        Effect::<()>::never()
            .ensuring(Effect::sync(move || flag.store(true, Ordering::SeqCst)))
            .fork_scoped(),
    )
    .map(|fiber| fiber.status());
    assert_eq!(rt.run_blocking(program), Exit::Success(FiberStatus::Done));
    assert!(ended.load(Ordering::SeqCst));
}

#[test]
fn test_on_exit_failure_is_appended() {
    let rt = runtime();
    let program: Effect<i32, String> =
        Effect::succeed(1).on_exit(|_| Effect::die_message("cleanup failed"));
    let exit = rt.run_blocking(program);
    assert!(exit.cause().is_some_and(|cause| cause.is_die()));
}

#[test]
fn test_many_dying_finalizers_all_run() {
    const COUNT: usize = 100_000;
    let rt = runtime();
    let ran = Arc::new(AtomicUsize::new(0));
    let scope = Scope::new();
    let register = Effect::for_each(0..COUNT, {
        let scope = scope.clone();
        let ran = ran.clone();
        move |_| {
            let ran = ran.clone();
            scope.add_finalizer(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Effect::die_message("finalizer died")
            })
        }
    });
    assert!(rt.run_blocking(register).is_success());

    let exit = rt.run_blocking(scope.close(Exit::Success(())));
    assert_eq!(ran.load(Ordering::SeqCst), COUNT);
    let cause = exit.cause().unwrap();
    assert_eq!(cause.defects().len(), COUNT);
    assert!(!cause.is_interrupted());
}

// ============================================================================
// Fiber refs
// ============================================================================

#[test]
fn test_fiber_refs_snapshot_at_fork_and_combine_at_join() {
    let rt = runtime();
    let counter = FiberRef::with_combine(0u32, |v| *v, |parent, child| parent + child);
    let in_child = counter.clone();
    let in_parent = counter.clone();
    let program = counter
        .set(10)
        .zip_right(in_child.update(|n| n + 5).fork())
        .flat_map(move |child| {
            let reader = in_parent.clone();
            // The child's write is invisible until the join.
            in_parent.update(|n| n + 1).zip_right(reader.get()).flat_map(move |before| {
                child.join().zip_right(in_parent.get()).map(move |after| (before, after))
            })
        });
    assert_eq!(rt.run_blocking(program), Exit::Success((11, 26)));
}

#[test]
fn test_locally_restores_the_previous_value() {
    let rt = runtime();
    let name = FiberRef::new("outer");
    let program = name.locally("inner", name.get()).zip(name.get());
    assert_eq!(rt.run_blocking(program), Exit::Success(("inner", "outer")));
}

// ============================================================================
// Scheduling
// ============================================================================

#[test]
fn test_budget_lets_a_second_fiber_progress_on_one_worker() {
    let rt = Runtime::builder().num_workers(1).ops_before_yield(128).build().unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let spin = done.clone();
    let busy = rt.run_fork(Effect::<(), ()>::forever(move || {
        let spin = spin.clone();
        Effect::attempt(move || if spin.load(Ordering::SeqCst) { Err(()) } else { Ok(()) })
    }));
    let flag = done.clone();
    let setter = rt.run_fork(Effect::<()>::sync(move || flag.store(true, Ordering::SeqCst)));
    assert!(rt.run_blocking(setter.join()).is_success());
    assert_eq!(rt.run_blocking(busy.await_exit()), Exit::Success(Exit::fail(())));
}

#[test]
fn test_yield_now_resumes_the_fiber() {
    let rt = Runtime::builder().num_workers(1).build().unwrap();
    let steps = log();
    let ping = steps.clone();
    let pong = steps.clone();
    let program = record(&ping, "a1")
        .zip_right(Effect::yield_now())
        .zip_right(record(&ping, "a2"))
        .zip(
            record(&pong, "b1")
                .zip_right(Effect::yield_now())
                .zip_right(record(&pong, "b2")),
        );
    assert!(rt.run_blocking(program).is_success());
    assert_eq!(steps.lock().len(), 4);
}

// ============================================================================
// Racing and parallelism
// ============================================================================

#[test]
fn test_race_keeps_the_first_success_and_interrupts_the_loser() {
    let rt = runtime();
    let loser_stopped = Arc::new(AtomicBool::new(false));
    let flag = loser_stopped.clone();
    let slow = Effect::<()>::sleep(Duration::from_secs(5))
        .as_value("slow")
        .on_interrupt(Effect::sync(move || flag.store(true, Ordering::SeqCst)));
    let fast = Effect::<()>::sleep(Duration::from_millis(5)).as_value("fast");
    let started = Instant::now();
    assert_eq!(rt.run_blocking(slow.race(fast)), Exit::Success("fast"));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(loser_stopped.load(Ordering::SeqCst));
}

#[test]
fn test_race_fails_only_when_every_racer_fails() {
    let rt = runtime();
    let a: Effect<u8, &'static str> = Effect::fail("a");
    let b: Effect<u8, &'static str> =
        Effect::<()>::sleep(Duration::from_millis(10)).widen_error().as_value(2);
    let quick_failure: Effect<u8, &'static str> = Effect::fail("a");
    assert_eq!(rt.run_blocking(quick_failure.race(b)), Exit::Success(2));

    let exit = rt.run_blocking(a.race(Effect::fail("b")));
    let cause = exit.cause().cloned().unwrap();
    assert_eq!(cause, Cause::fail("a").both(Cause::fail("b")));
}

#[test]
fn test_race_all_of_nothing_dies() {
    let rt = runtime();
    let exit = rt.run_blocking(Effect::<u8>::race_all(Vec::new()));
    assert!(exit.cause().is_some_and(|cause| cause.is_die()));
}

#[test]
fn test_race_all_of_many_failures_keeps_every_one() {
    const COUNT: u32 = 100_000;
    let rt = runtime();
    let racers: Vec<Effect<u8, u32>> = (0..COUNT).map(Effect::fail).collect();
    let exit = rt.run_blocking(Effect::race_all(racers));
    let cause = exit.cause().unwrap();
    let mut failures: Vec<u32> = cause.failures().into_iter().copied().collect();
    failures.sort_unstable();
    assert_eq!(failures, (0..COUNT).collect::<Vec<_>>());
}

#[test]
fn test_race_first_takes_a_failure_too() {
    let rt = runtime();
    let slow: Effect<u8, &'static str> =
        Effect::<()>::sleep(Duration::from_millis(200)).widen_error().as_value(1);
    let exit = rt.run_blocking(slow.race_first(Effect::fail("quick")));
    assert_eq!(exit, Exit::fail("quick"));
}

#[test]
fn test_timeout_interrupts_the_slow_effect() {
    let rt = runtime();
    let slow = Effect::<()>::sleep(Duration::from_secs(5)).as_value(1u8);
    assert_eq!(rt.run_blocking(slow.timeout(Duration::from_millis(20))), Exit::Success(None));
    let quick = Effect::<u8>::succeed(3);
    assert_eq!(rt.run_blocking(quick.timeout(Duration::from_secs(5))), Exit::Success(Some(3)));
}

#[test]
fn test_all_par_keeps_input_order() {
    let rt = runtime();
    let effects: Vec<Effect<u64>> = (0..16u64)
        .map(|i| Effect::<()>::sleep(Duration::from_millis(16 - i)).as_value(i))
        .collect();
    assert_eq!(rt.run_blocking(Effect::all_par(effects)), Exit::Success((0..16).collect()));
    assert_eq!(rt.run_blocking(Effect::<u64>::all_par(Vec::new())), Exit::Success(Vec::new()));
}

#[test]
fn test_all_par_fails_fast_and_interrupts_siblings() {
    let rt = runtime();
    let interrupted = Arc::new(AtomicUsize::new(0));
    let effects: Vec<Effect<u8, String>> = (0..4)
        .map(|i| {
            if i == 2 {
                Effect::<()>::sleep(Duration::from_millis(50))
                    .widen_error()
                    .zip_right(Effect::fail("bad".to_string()))
            } else {
                let seen = interrupted.clone();
                Effect::<u8, String>::never().on_interrupt(Effect::sync(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                }))
            }
        })
        .collect();
    let exit = rt.run_blocking(Effect::all_par(effects));
    assert_eq!(exit, Exit::fail("bad".to_string()));
    assert_eq!(interrupted.load(Ordering::SeqCst), 3);
}

#[test]
fn test_zip_par_and_for_each_par() {
    let rt = runtime();
    let pair = Effect::<u8>::succeed(1).zip_par(Effect::succeed("two"));
    assert_eq!(rt.run_blocking(pair), Exit::Success((1, "two")));
    let squares = Effect::for_each_par(1..=5u32, |n| Effect::<u32>::succeed(n * n));
    assert_eq!(rt.run_blocking(squares), Exit::Success(vec![1, 4, 9, 16, 25]));
}
