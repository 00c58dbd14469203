use std::cell::Cell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use filament::{
    await_promise, Baton, FiberManager, FiberManagerOptions, Promise, SimpleLoopController,
};

fn manager() -> (Arc<SimpleLoopController>, FiberManager) {
    let controller = Arc::new(SimpleLoopController::new());
    let options = FiberManagerOptions::new().with_stack_size(64 * 1024);
    let manager = FiberManager::with_options(controller.clone(), options);
    (controller, manager)
}

// ============================================================================
// Remote task submission
// ============================================================================

#[test]
fn test_concurrent_remote_submission() {
    const THREADS: usize = 4;
    const TASKS: usize = 200;

    let (controller, manager) = manager();
    let remote = manager.remote_handle();
    let executed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let start = Arc::new(Barrier::new(THREADS));

    let producers: Vec<_> = (0..THREADS)
        .map(|t| {
            let remote = remote.clone();
            let executed = executed.clone();
            let seen = seen.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                for i in 0..TASKS {
                    let executed = executed.clone();
                    let seen = seen.clone();
                    remote.add_task_remote(move || {
                        seen.lock().unwrap().push((t, i));
                        executed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();

    let owner = thread::current().id();
    let done = executed.clone();
    controller.run_until(&manager, || {
        assert_eq!(thread::current().id(), owner);
        done.load(Ordering::SeqCst) == THREADS * TASKS
    });
    for producer in producers {
        producer.join().unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), THREADS * TASKS);
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), THREADS * TASKS);

    // Per-producer order is preserved
    for t in 0..THREADS {
        let order: Vec<_> = seen.iter().filter(|(p, _)| *p == t).map(|(_, i)| *i).collect();
        assert_eq!(order, (0..TASKS).collect::<Vec<_>>());
    }
    assert!(controller.remote_schedule_calls() >= 1);
    assert_eq!(manager.stats().fibers_active, 0);
}

#[test]
fn test_remote_tasks_run_on_owner_thread() {
    let (controller, manager) = manager();
    let remote = manager.remote_handle();
    let ran_on = Arc::new(Mutex::new(None));

    let r = ran_on.clone();
    thread::spawn(move || {
        remote.add_task_remote(move || {
            *r.lock().unwrap() = Some((thread::current().id(), filament::on_fiber()));
        });
    })
    .join()
    .unwrap();

    assert_eq!(remote_pending(&manager), 1);
    assert!(controller.run_pending(&manager));
    assert_eq!(
        *ran_on.lock().unwrap(),
        Some((thread::current().id(), true))
    );
}

fn remote_pending(manager: &FiberManager) -> usize {
    manager.remote_handle().pending_tasks()
}

// ============================================================================
// Cross-thread resumption
// ============================================================================

#[test]
fn test_baton_posted_from_other_thread() {
    let (controller, manager) = manager();
    let baton = Arc::new(Baton::new());
    let done = Rc::new(Cell::new(false));

    let (b, d) = (baton.clone(), done.clone());
    manager.add_task(move || {
        b.wait();
        d.set(true);
    });
    assert!(manager.loop_until_no_ready());

    let poster = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        baton.post();
    });
    controller.run_until(&manager, || done.get());
    poster.join().unwrap();

    assert_eq!(manager.stats().fibers_active, 0);
}

#[test]
fn test_thread_waits_for_fiber() {
    let (_, manager) = manager();
    let baton = Arc::new(Baton::new());

    let waiter = {
        let baton = baton.clone();
        thread::spawn(move || {
            baton.wait();
            baton.is_posted()
        })
    };

    let b = baton.clone();
    manager.add_task(move || {
        filament::yield_now().unwrap();
        b.post();
    });
    manager.loop_until_no_ready();

    assert!(waiter.join().unwrap());
}

#[test]
fn test_many_fibers_awaiting_worker_threads() {
    const FIBERS: u64 = 50;

    let (controller, manager) = manager();
    let total = Rc::new(Cell::new(0));
    let finished = Rc::new(Cell::new(0));

    for n in 0..FIBERS {
        let (total, finished) = (total.clone(), finished.clone());
        manager.add_task(move || {
            let doubled = await_promise(|promise: Promise<u64>| {
                thread::spawn(move || promise.set_value(n * 2));
            })
            .unwrap();
            total.set(total.get() + doubled);
            finished.set(finished.get() + 1);
        });
    }

    controller.run_until(&manager, || finished.get() == FIBERS);
    assert_eq!(total.get(), (0..FIBERS).map(|n| n * 2).sum::<u64>());
    assert_eq!(manager.stats().fibers_active, 0);
}
