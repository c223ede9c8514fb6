//! Single-shot, rearmable heartbeat timers (spec.md §4.D).
//!
//! Each `HeartbeatTimer` owns one long-lived background thread parked on a
//! `Condvar`, rather than the original's approach of spawning a fresh
//! `threading.Timer` (itself a fresh OS thread) on every tick — a
//! deliberate improvement noted in spec.md's REDESIGN FLAGS territory:
//! the observable contract (single-shot, cancellable, restartable,
//! period-0-disables) is unchanged, only the implementation avoids
//! per-tick thread churn.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct Shared {
    /// `None` disarmed. `Some(deadline)` armed for that instant.
    /// `generation` increments on every rearm/cancel so the worker can
    /// tell a stale wakeup from a current one.
    deadline: Option<Instant>,
    generation: u64,
    stopped: bool,
}

/// A single-shot, rearmable timer that invokes `on_fire` from a dedicated
/// background thread when it expires without being rearmed or cancelled
/// first.
pub struct HeartbeatTimer {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    join: Option<thread::JoinHandle<()>>,
}

impl HeartbeatTimer {
    /// Spawns the background thread. The timer starts disarmed; call
    /// [`HeartbeatTimer::arm`] to schedule the first expiry.
    pub fn new<F>(name: &str, mut on_fire: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new((
            Mutex::new(Shared {
                deadline: None,
                generation: 0,
                stopped: false,
            }),
            Condvar::new(),
        ));

        let worker_shared = Arc::clone(&shared);
        let thread_name = format!("hal-remote-heartbeat-{name}");
        let join = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let (lock, cvar) = &*worker_shared;
                let mut guard = lock.lock().unwrap();
                loop {
                    if guard.stopped {
                        return;
                    }
                    let Some(deadline) = guard.deadline else {
                        guard = cvar.wait(guard).unwrap();
                        continue;
                    };
                    let now = Instant::now();
                    if now >= deadline {
                        let fired_generation = guard.generation;
                        guard.deadline = None;
                        drop(guard);
                        on_fire();
                        guard = lock.lock().unwrap();
                        // If something rearmed us while on_fire() ran
                        // without holding the lock, don't clobber it.
                        if guard.generation != fired_generation {
                            continue;
                        }
                    } else {
                        let (g, _timeout) = cvar.wait_timeout(guard, deadline - now).unwrap();
                        guard = g;
                    }
                }
            })
            .expect("failed to spawn heartbeat timer thread");

        HeartbeatTimer {
            shared,
            join: Some(join),
        }
    }

    /// Arm (or rearm) the timer to fire after `period` from now. A
    /// `period` of zero disarms the timer instead (spec.md: "Period of 0
    /// disables the corresponding timer").
    pub fn arm(&self, period: Duration) {
        let (lock, cvar) = &*self.shared;
        let mut guard = lock.lock().unwrap();
        guard.generation += 1;
        guard.deadline = if period.is_zero() {
            None
        } else {
            Some(Instant::now() + period)
        };
        cvar.notify_all();
    }

    /// Cancel any pending expiry without stopping the worker thread.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.shared;
        let mut guard = lock.lock().unwrap();
        guard.generation += 1;
        guard.deadline = None;
        cvar.notify_all();
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        {
            let (lock, cvar) = &*self.shared;
            let mut guard = lock.lock().unwrap();
            guard.stopped = true;
            guard.deadline = None;
            cvar.notify_all();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn fires_once_after_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cloned = Arc::clone(&count);
        let timer = HeartbeatTimer::new("test", move || {
            count_cloned.fetch_add(1, Ordering::SeqCst);
        });
        timer.arm(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_period_disables_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cloned = Arc::clone(&count);
        let timer = HeartbeatTimer::new("test", move || {
            count_cloned.fetch_add(1, Ordering::SeqCst);
        });
        timer.arm(Duration::from_millis(0));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_prevents_fire() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cloned = Arc::clone(&count);
        let timer = HeartbeatTimer::new("test", move || {
            count_cloned.fetch_add(1, Ordering::SeqCst);
        });
        timer.arm(Duration::from_millis(20));
        timer.cancel();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearm_resets_deadline() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cloned = Arc::clone(&count);
        let timer = HeartbeatTimer::new("test", move || {
            count_cloned.fetch_add(1, Ordering::SeqCst);
        });
        timer.arm(Duration::from_millis(30));
        thread::sleep(Duration::from_millis(15));
        timer.arm(Duration::from_millis(30)); // push deadline back
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
