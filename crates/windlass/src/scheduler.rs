//! Cooperative single-threaded coroutine scheduler
//!
//! Runs inside one workflow task execution. At most one coroutine runs at a
//! time and suspension happens only at await points on workflow futures and
//! channels, which is what makes replay deterministic: given identical
//! history and code, the resumption order is identical across runs.
//!
//! Coroutines are plain local futures polled with a no-op waker. Instead of
//! waker-based wakeups, anything that unblocks a coroutine (resolving a
//! future, sending on a channel, canceling a scope) sets the shared
//! [`WakeSignal`]; the scheduler then re-polls blocked coroutines in FIFO
//! order until a full pass makes no progress.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;

/// Shared progress flag between the scheduler and everything that can
/// unblock a coroutine.
#[derive(Clone, Default)]
pub(crate) struct WakeSignal {
    flag: Rc<Cell<bool>>,
}

impl WakeSignal {
    /// Record that some coroutine may have become unblocked
    pub(crate) fn set(&self) {
        self.flag.set(true);
    }

    /// Consume the flag
    pub(crate) fn take(&self) -> bool {
        self.flag.replace(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoroutineState {
    /// Will be polled in the current or next pass
    Ready,

    /// Last poll returned pending; re-polled after the next wake
    Blocked,

    /// Completed; slot is cleaned up after the drain
    Finished,
}

struct Coroutine {
    future: Option<LocalBoxFuture<'static, ()>>,
    state: CoroutineState,
}

/// Clonable handle for enqueuing coroutines from workflow code.
#[derive(Clone)]
pub(crate) struct Spawner {
    queue: Rc<RefCell<Vec<Coroutine>>>,
    signal: WakeSignal,
}

impl Spawner {
    /// Enqueue a coroutine in `Ready` state. It never starts immediately;
    /// the scheduler picks it up on its next pass.
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.queue.borrow_mut().push(Coroutine {
            future: Some(Box::pin(future)),
            state: CoroutineState::Ready,
        });
        self.signal.set();
    }
}

/// The cooperative scheduler for one workflow task execution.
pub(crate) struct Scheduler {
    queue: Rc<RefCell<Vec<Coroutine>>>,
    signal: WakeSignal,
}

impl Scheduler {
    pub(crate) fn new(signal: WakeSignal) -> Self {
        Self {
            queue: Rc::new(RefCell::new(Vec::new())),
            signal,
        }
    }

    /// Handle for spawning coroutines into this scheduler
    pub(crate) fn spawner(&self) -> Spawner {
        Spawner {
            queue: Rc::clone(&self.queue),
            signal: self.signal.clone(),
        }
    }

    /// Number of coroutines that have not finished
    pub(crate) fn active_count(&self) -> usize {
        self.queue
            .borrow()
            .iter()
            .filter(|c| c.state != CoroutineState::Finished)
            .count()
    }

    /// Resume ready coroutines in FIFO order until every coroutine is
    /// blocked or finished and no wake is pending.
    pub(crate) fn run_until_blocked(&mut self) {
        loop {
            // A wake means some blocked coroutine may be able to progress.
            if self.signal.take() {
                let mut queue = self.queue.borrow_mut();
                for coroutine in queue.iter_mut() {
                    if coroutine.state == CoroutineState::Blocked {
                        coroutine.state = CoroutineState::Ready;
                    }
                }
            }

            let has_ready = self
                .queue
                .borrow()
                .iter()
                .any(|c| c.state == CoroutineState::Ready);
            if !has_ready {
                break;
            }

            let mut index = 0;
            loop {
                // Length re-checked each iteration: coroutines spawned during
                // this pass land at the tail and are polled in FIFO order.
                if index >= self.queue.borrow().len() {
                    break;
                }

                let ready = self.queue.borrow()[index].state == CoroutineState::Ready;
                if ready {
                    let mut future = self.queue.borrow_mut()[index]
                        .future
                        .take()
                        .expect("ready coroutine has a future");

                    let mut cx = Context::from_waker(noop_waker_ref());
                    match future.as_mut().poll(&mut cx) {
                        Poll::Ready(()) => {
                            self.queue.borrow_mut()[index].state = CoroutineState::Finished;
                        }
                        Poll::Pending => {
                            let mut queue = self.queue.borrow_mut();
                            queue[index].future = Some(future);
                            queue[index].state = CoroutineState::Blocked;
                        }
                    }
                }

                index += 1;
            }
        }

        self.queue
            .borrow_mut()
            .retain(|c| c.state != CoroutineState::Finished);
    }
}

/// Future that suspends the current coroutine once, handing control back to
/// the scheduler before resuming.
pub(crate) struct Yield {
    signal: WakeSignal,
    yielded: bool,
}

impl Yield {
    pub(crate) fn new(signal: WakeSignal) -> Self {
        Self {
            signal,
            yielded: false,
        }
    }
}

impl Future for Yield {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            self.signal.set();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test future that stays pending until its cell holds a value
    struct WaitForValue {
        cell: Rc<Cell<Option<i32>>>,
    }

    impl Future for WaitForValue {
        type Output = i32;

        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<i32> {
            match self.cell.get() {
                Some(v) => Poll::Ready(v),
                None => Poll::Pending,
            }
        }
    }

    #[test]
    fn test_runs_spawned_coroutines_in_fifo_order() {
        let signal = WakeSignal::default();
        let mut scheduler = Scheduler::new(signal);
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = Rc::clone(&order);
            scheduler.spawner().spawn(async move {
                order.borrow_mut().push(i);
            });
        }

        scheduler.run_until_blocked();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_spawn_does_not_run_immediately() {
        let signal = WakeSignal::default();
        let scheduler = Scheduler::new(signal);
        let ran = Rc::new(Cell::new(false));

        let flag = Rc::clone(&ran);
        scheduler.spawner().spawn(async move {
            flag.set(true);
        });

        assert!(!ran.get());
    }

    #[test]
    fn test_blocked_coroutine_resumes_after_wake() {
        let signal = WakeSignal::default();
        let mut scheduler = Scheduler::new(signal.clone());
        let cell = Rc::new(Cell::new(None));
        let result = Rc::new(Cell::new(0));

        let wait_cell = Rc::clone(&cell);
        let out = Rc::clone(&result);
        scheduler.spawner().spawn(async move {
            let v = WaitForValue { cell: wait_cell }.await;
            out.set(v);
        });

        scheduler.run_until_blocked();
        assert_eq!(result.get(), 0);
        assert_eq!(scheduler.active_count(), 1);

        cell.set(Some(42));
        signal.set();
        scheduler.run_until_blocked();

        assert_eq!(result.get(), 42);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_coroutine_can_spawn_coroutines() {
        let signal = WakeSignal::default();
        let mut scheduler = Scheduler::new(signal);
        let order = Rc::new(RefCell::new(Vec::new()));

        let spawner = scheduler.spawner();
        let inner_spawner = spawner.clone();
        let outer_order = Rc::clone(&order);
        spawner.spawn(async move {
            outer_order.borrow_mut().push("outer");
            let inner_order = Rc::clone(&outer_order);
            inner_spawner.spawn(async move {
                inner_order.borrow_mut().push("inner");
            });
        });

        scheduler.run_until_blocked();
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_yield_hands_control_back() {
        let signal = WakeSignal::default();
        let mut scheduler = Scheduler::new(signal.clone());
        let order = Rc::new(RefCell::new(Vec::new()));

        let first_order = Rc::clone(&order);
        let first_signal = signal.clone();
        scheduler.spawner().spawn(async move {
            first_order.borrow_mut().push("a1");
            Yield::new(first_signal).await;
            first_order.borrow_mut().push("a2");
        });

        let second_order = Rc::clone(&order);
        scheduler.spawner().spawn(async move {
            second_order.borrow_mut().push("b1");
        });

        scheduler.run_until_blocked();
        assert_eq!(*order.borrow(), vec!["a1", "b1", "a2"]);
    }
}
