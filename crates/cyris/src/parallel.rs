//! Bounded worker fan-out for blocking operations
//!
//! The orchestrator runs blocking SSH and hypervisor calls from a
//! fixed-size pool of OS threads. Results are returned in input order
//! regardless of completion order.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Default worker pool size for cross-guest parallelism.
pub const DEFAULT_WORKERS: usize = 8;

/// Run `f` over `items` with at most `concurrency` items in flight.
/// Workers pull from a shared queue, so uneven item durations do not
/// leave threads idle. Results keep the input order.
pub fn run_bounded<T, R, F>(items: Vec<T>, concurrency: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = concurrency.clamp(1, total);

    let queue: Mutex<VecDeque<(usize, T)>> = Mutex::new(items.into_iter().enumerate().collect());
    let results: Mutex<Vec<Option<R>>> =
        Mutex::new((0..total).map(|_| None).collect());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let job = queue.lock().expect("queue poisoned").pop_front();
                let Some((index, item)) = job else { break };
                let result = f(item);
                results.lock().expect("results poisoned")[index] = Some(result);
            });
        }
    });

    results
        .into_inner()
        .expect("results poisoned")
        .into_iter()
        .map(|r| r.expect("worker completed every job"))
        .collect()
}
