use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: VecDeque<Job>,
    active: usize,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

/// Fixed pool of worker threads. `join` waits for quiescence (queue drained
/// and no job running) but leaves the workers alive, so a pool can be
/// drained, fed more work, and drained again. Workers stop on drop.
pub struct Pool {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        });

        let workers = (0..threads)
            .map(|_| {
                let inner = Arc::clone(&inner);
                thread::spawn(move || worker_loop(&inner))
            })
            .collect();

        Self { inner, workers }
    }

    pub fn add(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        assert!(!state.shutdown, "add after pool shutdown");
        state.queue.push_back(Box::new(job));
        drop(state);
        self.inner.work_cv.notify_one();
    }

    /// Block until every queued job has finished.
    pub fn join(&self) {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        while !state.queue.is_empty() || state.active > 0 {
            state = self
                .inner
                .idle_cv
                .wait(state)
                .expect("pool lock poisoned");
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            state.shutdown = true;
        }
        self.inner.work_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let job = {
            let mut state = inner.state.lock().expect("pool lock poisoned");
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.active += 1;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = inner.work_cv.wait(state).expect("pool lock poisoned");
            }
        };

        job();

        let mut state = inner.state.lock().expect("pool lock poisoned");
        state.active -= 1;
        if state.queue.is_empty() && state.active == 0 {
            inner.idle_cv.notify_all();
        }
        drop(state);
    }
}
