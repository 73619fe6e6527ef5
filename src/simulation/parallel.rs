//! Parallel/sequential execution helpers.
//!
//! The `cfg(feature = "parallel")` switch lives here only; call sites pass
//! `force_sequential` to pin execution to one thread at runtime. Budgeted
//! work runs on dedicated worker threads so a slow task can be abandoned
//! at its deadline instead of holding up the caller.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Run `f` on every item, each on its own worker thread, and collect the
/// results that arrive within `budget`. Output order matches input order;
/// a `None` slot is an item whose worker missed its deadline, paired with
/// the time waited for it.
///
/// Late workers are detached and finish in the background; their results
/// are discarded. With `force_sequential` the items are dispatched one at
/// a time, each with a fresh deadline.
pub fn map_with_deadline<T, F, R>(
    items: Vec<T>,
    f: F,
    budget: Duration,
    force_sequential: bool,
) -> Vec<(Option<R>, Duration)>
where
    T: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let f = Arc::new(f);
    let (tx, rx) = crossbeam_channel::unbounded::<(usize, R, Duration)>();
    let count = items.len();
    let mut slots: Vec<(Option<R>, Duration)> = (0..count).map(|_| (None, budget)).collect();

    let dispatch = |index: usize, item: T| {
        let f = Arc::clone(&f);
        let tx = tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("decide-{}", index))
            .spawn(move || {
                let started = Instant::now();
                let result = f(item);
                // The receiver is gone once the deadline has passed.
                let _ = tx.send((index, result, started.elapsed()));
            });
        if let Err(e) = spawned {
            log::warn!("could not start decision worker {}: {}", index, e);
        }
    };

    if force_sequential {
        for (index, item) in items.into_iter().enumerate() {
            dispatch(index, item);
            let deadline = Instant::now() + budget;
            loop {
                match rx.recv_deadline(deadline) {
                    Ok((i, result, elapsed)) if i == index => {
                        slots[i] = (Some(result), elapsed);
                        break;
                    }
                    // A worker that already missed its own deadline.
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
    } else {
        let deadline = Instant::now() + budget;
        for (index, item) in items.into_iter().enumerate() {
            dispatch(index, item);
        }
        let mut received = 0;
        while received < count {
            match rx.recv_deadline(deadline) {
                Ok((i, result, elapsed)) => {
                    slots[i] = (Some(result), elapsed);
                    received += 1;
                }
                Err(_) => break,
            }
        }
    }
    slots
}

/// Run two closures, potentially concurrently, and return both results.
#[inline]
pub fn join<A, B, RA, RB>(a: A, b: B, force_sequential: bool) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    #[cfg(feature = "parallel")]
    {
        if force_sequential {
            (a(), b())
        } else {
            rayon::join(a, b)
        }
    }

    #[cfg(not(feature = "parallel"))]
    {
        let _ = force_sequential;
        (a(), b())
    }
}
