//! Whole-program scenarios: several managed threads, one arbiter each.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread as os_thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use tracing_test::traced_test;

use tfc_config::ArbiterConfig;
use tfc_core::time::{ClockId, Timespec};
use tfc_core::{Arbiter, Trap};

use crate::{sleep_for, sleep_until, testcancel, JoinAdvice, Mutex, Semaphore, Thread};

fn test_arbiter() -> Arc<Arbiter> {
    Arbiter::with_config(&ArbiterConfig::for_tests())
}

fn spawn<T, F>(arbiter: &Arc<Arbiter>, name: &str, f: F) -> Thread<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let mut thread = Thread::with_arbiter(arbiter, name);
    thread.start(f).unwrap();
    thread
}

fn elapsed_ns(arbiter: &Arbiter, start: Timespec) -> u64 {
    arbiter
        .now(ClockId::Monotonic)
        .nanos_since(start)
        .unwrap_or_default()
}

fn wait_for_blocked(arbiter: &Arbiter, blocked: usize) {
    while arbiter.snapshot().blocked < blocked {
        os_thread::yield_now();
    }
}

#[test]
fn quiescence_fires_when_last_thread_blocks() {
    let arbiter = test_arbiter();
    let gate = Arc::new(Semaphore::with_arbiter(&arbiter, 0));
    let mut workers = Vec::new();
    for i in 0..3 {
        let gate = Arc::clone(&gate);
        workers.push(spawn(&arbiter, &format!("worker-{i}"), move || gate.wait()));
    }
    wait_for_blocked(&arbiter, 3);
    assert_eq!(arbiter.metrics().quiescence.get(), 0);

    let start = arbiter.now(ClockId::Monotonic);
    sleep_for(&arbiter, Duration::from_millis(1)).unwrap();
    assert_eq!(arbiter.metrics().quiescence.get(), 1);
    assert_eq!(elapsed_ns(&arbiter, start), 1_000_000);

    for _ in 0..3 {
        gate.post().unwrap();
    }
    for mut worker in workers {
        worker.join(JoinAdvice::MayBlock).unwrap().unwrap();
    }
    assert_eq!(arbiter.snapshot().live, 1);
}

#[test]
fn running_thread_holds_back_the_clock() {
    let arbiter = test_arbiter();
    let start = arbiter.now(ClockId::Monotonic);
    let sleeper_arbiter = Arc::clone(&arbiter);
    let mut sleeper = spawn(&arbiter, "sleeper", move || {
        sleep_for(&sleeper_arbiter, Duration::from_millis(50))
    });

    wait_for_blocked(&arbiter, 1);
    os_thread::sleep(Duration::from_millis(20));
    assert_eq!(arbiter.now(ClockId::Monotonic), start);
    assert_eq!(arbiter.snapshot().pending_timeouts, 1);

    sleeper.join(JoinAdvice::MayBlock).unwrap().unwrap();
    assert_eq!(elapsed_ns(&arbiter, start), 50_000_000);
}

#[test]
fn two_sleepers_wake_at_100_and_300_ms() {
    let arbiter = test_arbiter();
    let start = arbiter.now(ClockId::Monotonic);
    let wakeups = Arc::new(Mutex::with_arbiter(&arbiter, Vec::new()));
    let real_start = Instant::now();

    let sleepers: Vec<_> = [("a", 100), ("b", 300)]
        .into_iter()
        .map(|(name, ms)| {
            let arbiter_ref = Arc::clone(&arbiter);
            let wakeups = Arc::clone(&wakeups);
            spawn(&arbiter, name, move || {
                sleep_for(&arbiter_ref, Duration::from_millis(ms)).unwrap();
                let woke_at = elapsed_ns(&arbiter_ref, start);
                wakeups.lock().push((name, woke_at));
            })
        })
        .collect();
    for mut sleeper in sleepers {
        sleeper.join(JoinAdvice::MayBlock).unwrap();
    }

    assert_eq!(
        *wakeups.lock(),
        vec![("a", 100_000_000), ("b", 300_000_000)]
    );
    assert_eq!(elapsed_ns(&arbiter, start), 300_000_000);
    assert_eq!(arbiter.metrics().clock_advances.get(), 2);
    assert!(real_start.elapsed() < Duration::from_secs(5));
}

#[traced_test]
#[test]
fn equal_deadlines_wake_in_one_advance() {
    let arbiter = test_arbiter();
    arbiter.enable_trap(Trap::SameDeadline);
    arbiter.enable_trap(Trap::SimultaneousResume);
    let deadline = arbiter.deadline_after(Duration::from_millis(20)).unwrap();
    let wake_times = Arc::new(Mutex::with_arbiter(&arbiter, Vec::new()));

    let sleepers: Vec<_> = (0..2)
        .map(|i| {
            let arbiter_ref = Arc::clone(&arbiter);
            let wake_times = Arc::clone(&wake_times);
            spawn(&arbiter, &format!("twin-{i}"), move || {
                sleep_until(&arbiter_ref, deadline).unwrap();
                wake_times.lock().push(arbiter_ref.now(ClockId::Monotonic));
            })
        })
        .collect();
    for mut sleeper in sleepers {
        sleeper.join(JoinAdvice::MayBlock).unwrap();
    }

    assert_eq!(*wake_times.lock(), vec![deadline, deadline]);
    assert_eq!(arbiter.metrics().clock_advances.get(), 1);
    assert!(arbiter.take_trap(Trap::SameDeadline));
    assert!(arbiter.take_trap(Trap::SimultaneousResume));
    assert!(logs_contain("managed thread started"));
    assert!(logs_contain("managed thread joined"));
}

#[test]
fn contended_mutex_serializes_and_loses_no_wakeup() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 5;

    let arbiter = test_arbiter();
    let start = arbiter.now(ClockId::Monotonic);
    let counter = Arc::new(Mutex::with_arbiter(&arbiter, 0usize));
    let inside = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let arbiter_ref = Arc::clone(&arbiter);
            let counter = Arc::clone(&counter);
            let inside = Arc::clone(&inside);
            spawn(&arbiter, &format!("contender-{i}"), move || {
                for _ in 0..ROUNDS {
                    let mut guard = counter.lock();
                    assert!(!inside.swap(true, Ordering::SeqCst));
                    // Sleeping with the lock held serializes virtual time too.
                    sleep_for(&arbiter_ref, Duration::from_millis(1)).unwrap();
                    *guard += 1;
                    inside.store(false, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for mut worker in workers {
        worker.join(JoinAdvice::MayBlock).unwrap();
    }

    assert_eq!(*counter.lock(), THREADS * ROUNDS);
    assert_eq!(
        elapsed_ns(&arbiter, start),
        (THREADS * ROUNDS) as u64 * 1_000_000
    );
}

#[test]
fn semaphore_double_post_releases_one_waiter_and_keeps_one_count() {
    let arbiter = test_arbiter();
    let sem = Arc::new(Semaphore::with_arbiter(&arbiter, 0));
    let returns = Arc::new(AtomicUsize::new(0));

    let mut first = {
        let (sem, returns) = (Arc::clone(&sem), Arc::clone(&returns));
        spawn(&arbiter, "first", move || {
            sem.wait().unwrap();
            returns.fetch_add(1, Ordering::SeqCst);
        })
    };
    wait_for_blocked(&arbiter, 1);
    sem.post().unwrap();
    sem.post().unwrap();
    first.join(JoinAdvice::MayBlock).unwrap();
    assert_eq!(returns.load(Ordering::SeqCst), 1);
    assert_eq!(sem.count(), 1);

    let quiescence_before = arbiter.metrics().quiescence.get();
    let mut third = {
        let sem = Arc::clone(&sem);
        spawn(&arbiter, "third", move || sem.wait())
    };
    third.join(JoinAdvice::WillNotBlockPermanently).unwrap().unwrap();
    assert_eq!(sem.count(), 0);
    assert_eq!(arbiter.metrics().quiescence.get(), quiescence_before);
}

#[test]
#[should_panic(expected = "deadlock")]
fn all_threads_waiting_forever_is_a_deadlock() {
    let arbiter = test_arbiter();
    let never = Arc::new(Semaphore::with_arbiter(&arbiter, 0));
    let _workers: Vec<_> = (0..3)
        .map(|i| {
            let never = Arc::clone(&never);
            spawn(&arbiter, &format!("stuck-{i}"), move || never.wait())
        })
        .collect();
    wait_for_blocked(&arbiter, 3);
    let _ = never.wait();
}

#[test]
fn pending_cancellation_suppresses_deadlock() {
    let arbiter = test_arbiter();
    let lock = Arc::new(Mutex::with_arbiter(&arbiter, ()));
    let wakeup = Arc::new(Semaphore::with_arbiter(&arbiter, 0));

    let held = lock.lock();
    let mut victim = {
        let lock = Arc::clone(&lock);
        spawn(&arbiter, "victim", move || {
            // Mutex lock is not a cancellation point.
            drop(lock.lock());
            testcancel().is_err()
        })
    };
    wait_for_blocked(&arbiter, 1);
    assert!(victim.cancel());

    // An unmanaged thread stands in for the cancellation making progress.
    let rescuer = {
        let arbiter = Arc::clone(&arbiter);
        let wakeup = Arc::clone(&wakeup);
        os_thread::spawn(move || {
            while arbiter.metrics().quiescence.get() == 0 {
                os_thread::yield_now();
            }
            wakeup.post().unwrap();
        })
    };
    wakeup.wait().unwrap();
    rescuer.join().unwrap();
    drop(held);

    assert!(victim.join(JoinAdvice::MayBlock).unwrap());
    let snapshot = arbiter.snapshot();
    assert_eq!((snapshot.live, snapshot.cancellations_pending), (1, 0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn sleepers_wake_in_deadline_order(
        millis in proptest::collection::btree_set(1u64..500, 1..6),
    ) {
        let arbiter = test_arbiter();
        let start = arbiter.now(ClockId::Monotonic);
        let order = Arc::new(Mutex::with_arbiter(&arbiter, Vec::new()));

        // Start the longest sleeper first so start order never matches wake order by accident.
        let sleepers: Vec<_> = millis
            .iter()
            .rev()
            .map(|&ms| {
                let arbiter_ref = Arc::clone(&arbiter);
                let order = Arc::clone(&order);
                spawn(&arbiter, &format!("sleep-{ms}"), move || {
                    sleep_for(&arbiter_ref, Duration::from_millis(ms)).unwrap();
                    order.lock().push((ms, elapsed_ns(&arbiter_ref, start)));
                })
            })
            .collect();
        for mut sleeper in sleepers {
            sleeper.join(JoinAdvice::MayBlock).unwrap();
        }

        let expected: Vec<_> = millis.iter().map(|&ms| (ms, ms * 1_000_000)).collect();
        prop_assert_eq!(order.lock().clone(), expected);
        prop_assert_eq!(arbiter.metrics().clock_advances.get(), millis.len() as u64);
    }
}
