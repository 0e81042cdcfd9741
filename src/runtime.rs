//! Futures and the two-priority task pool.
//!
//! All tree algorithms are expressed as trees of short tasks. A task never
//! blocks on an unready future; dependencies are declared by attaching
//! continuations (`on_ready`, `add_when`, `join`) so the pool only runs work
//! whose inputs exist. Blocking `get` is reserved for threads outside the
//! pool.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

/// Scheduling class of a task. High priority is for tasks that themselves
/// communicate or recurse, so that messaging overlaps with compute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// Plain compute work.
    Normal,
    /// Latency-sensitive recursion and communication.
    High,
}

struct FutureInner<T> {
    value: Option<T>,
    callbacks: Vec<Box<dyn FnOnce(T) + Send>>,
}

struct FutureState<T> {
    inner: Mutex<FutureInner<T>>,
    cv: Condvar,
}

/// Single-assignment value shared between producer and consumers.
pub struct Future<T> {
    state: Arc<FutureState<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Unset future.
    pub fn new() -> Self {
        Self {
            state: Arc::new(FutureState {
                inner: Mutex::new(FutureInner {
                    value: None,
                    callbacks: Vec::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Future that is already resolved.
    pub fn ready(value: T) -> Self {
        let f = Self::new();
        f.set(value);
        f
    }

    /// Resolve the future; callbacks run on the calling thread.
    pub fn set(&self, value: T) {
        let callbacks = {
            let mut inner = self.state.inner.lock();
            assert!(inner.value.is_none(), "future assigned twice");
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.callbacks)
        };
        self.state.cv.notify_all();
        for cb in callbacks {
            cb(value.clone());
        }
    }

    /// True once the value is available.
    pub fn probe(&self) -> bool {
        self.state.inner.lock().value.is_some()
    }

    /// Blocking read. Must not be called from inside the pool unless the
    /// future is already resolved.
    pub fn get(&self) -> T {
        let mut inner = self.state.inner.lock();
        loop {
            if let Some(v) = &inner.value {
                return v.clone();
            }
            self.state.cv.wait(&mut inner);
        }
    }

    /// Run `cb` with the value once it exists; immediately if it already
    /// does.
    pub fn on_ready(&self, cb: impl FnOnce(T) + Send + 'static) {
        let mut cb = Some(cb);
        let value = {
            let mut inner = self.state.inner.lock();
            match &inner.value {
                Some(v) => Some(v.clone()),
                None => {
                    let cb = cb.take().expect("callback taken once");
                    inner.callbacks.push(Box::new(cb));
                    None
                }
            }
        };
        if let Some(v) = value {
            (cb.take().expect("callback taken once"))(v);
        }
    }
}

/// Fan a vector of futures into a future of the vector, preserving order.
pub fn join<T: Clone + Send + 'static>(futures: Vec<Future<T>>) -> Future<Vec<T>> {
    let result = Future::new();
    let n = futures.len();
    if n == 0 {
        result.set(Vec::new());
        return result;
    }
    let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; n]));
    let remaining = Arc::new(AtomicUsize::new(n));
    for (i, f) in futures.into_iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let result = result.clone();
        f.on_ready(move |v| {
            slots.lock()[i] = Some(v);
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let collected = slots
                    .lock()
                    .iter_mut()
                    .map(|s| s.take().expect("all slots filled"))
                    .collect();
                result.set(collected);
            }
        });
    }
    result
}

type Task = Box<dyn FnOnce() + Send>;

struct QueueState {
    deque: Mutex<VecDeque<Task>>,
    cv: Condvar,
    outstanding: AtomicUsize,
    quiet_m: Mutex<()>,
    quiet_cv: Condvar,
    shutdown: AtomicBool,
}

/// Shared two-priority task pool.
pub struct TaskQueue {
    state: Arc<QueueState>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TaskQueue {
    /// Pool with `nthreads` workers.
    pub fn new(nthreads: usize) -> Self {
        let state = Arc::new(QueueState {
            deque: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            outstanding: AtomicUsize::new(0),
            quiet_m: Mutex::new(()),
            quiet_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..nthreads.max(1))
            .map(|i| {
                let state = state.clone();
                thread::Builder::new()
                    .name(format!("mw-worker-{i}"))
                    .spawn(move || worker_loop(state))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            state,
            workers: Mutex::new(workers),
        }
    }

    /// Schedule a task.
    pub fn add(&self, priority: Priority, task: impl FnOnce() + Send + 'static) {
        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        {
            let mut deque = self.state.deque.lock();
            match priority {
                Priority::High => deque.push_front(Box::new(task)),
                Priority::Normal => deque.push_back(Box::new(task)),
            }
        }
        self.state.cv.notify_one();
    }

    /// Schedule a task and obtain a future for its result.
    pub fn add_future<R: Clone + Send + 'static>(
        &self,
        priority: Priority,
        task: impl FnOnce() -> R + Send + 'static,
    ) -> Future<R> {
        let future = Future::new();
        let f2 = future.clone();
        self.add(priority, move || f2.set(task()));
        future
    }

    /// Schedule `task` to run once `dep` resolves.
    pub fn add_when<A, R>(
        self: &Arc<Self>,
        priority: Priority,
        dep: Future<A>,
        task: impl FnOnce(A) -> R + Send + 'static,
    ) -> Future<R>
    where
        A: Clone + Send + 'static,
        R: Clone + Send + 'static,
    {
        let future = Future::new();
        let f2 = future.clone();
        let queue = self.clone();
        dep.on_ready(move |v| {
            queue.add(priority, move || f2.set(task(v)));
        });
        future
    }

    /// Number of tasks queued or running.
    pub fn pending(&self) -> usize {
        self.state.outstanding.load(Ordering::Acquire)
    }

    /// Block until no tasks are queued or running.
    pub fn drain(&self) {
        let mut guard = self.state.quiet_m.lock();
        while self.state.outstanding.load(Ordering::Acquire) != 0 {
            self.state.quiet_cv.wait(&mut guard);
        }
    }

    /// Stop the workers after the queue empties.
    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.state.cv.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(state: Arc<QueueState>) {
    loop {
        let task = {
            let mut deque = state.deque.lock();
            loop {
                if let Some(task) = deque.pop_front() {
                    break task;
                }
                if state.shutdown.load(Ordering::Acquire) {
                    return;
                }
                state.cv.wait(&mut deque);
            }
        };
        // A panicking task means a broken invariant; the process must not
        // limp on with a half-finished tree.
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!("task panicked; aborting");
            std::process::abort();
        }
        if state.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = state.quiet_m.lock();
            state.quiet_cv.notify_all();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn futures_resolve_callbacks_and_getters() {
        let f: Future<i32> = Future::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        f.on_ready(move |v| {
            assert_eq!(v, 42);
            h.fetch_add(1, Ordering::SeqCst);
        });
        f.set(42);
        assert_eq!(f.get(), 42);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Late registration fires immediately.
        let h = hits.clone();
        f.on_ready(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn join_preserves_order() {
        let futs: Vec<Future<usize>> = (0..8).map(|_| Future::new()).collect();
        let joined = join(futs.clone());
        for (i, f) in futs.iter().enumerate().rev() {
            f.set(i);
        }
        assert_eq!(joined.get(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn pool_runs_tasks_and_drains() {
        let queue = Arc::new(TaskQueue::new(2));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = counter.clone();
            queue.add(Priority::Normal, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn chained_tasks_run_in_dependency_order() {
        let queue = Arc::new(TaskQueue::new(2));
        let dep: Future<i32> = Future::new();
        let doubled = queue.add_when(Priority::High, dep.clone(), |v| v * 2);
        dep.set(21);
        assert_eq!(doubled.get(), 42);
        queue.drain();
    }
}
