//! Persistent worker pool for relaxing independent blocks in parallel

use crate::matrix::{relax_block, Cell, Chunk, Layout};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Number of blocks handed to a worker at once
pub const THREAD_WORK_SIZE: usize = 8;

#[derive(Clone, Copy)]
struct MatrixPtr(*mut Cell);

// The pool only dereferences the pointer while `run_chunk` blocks the owner of
// the matrix, and every unit touches a distinct destination block.
unsafe impl Send for MatrixPtr {}

#[derive(Clone, Copy)]
struct Unit {
    cells: MatrixPtr,
    layout: Layout,
    round: usize,
    chunk: Chunk,
    first: usize,
    count: usize,
}

impl Unit {
    fn run(&self) {
        for n in self.first..self.first + self.count {
            let (bi, bj) = self.chunk.block(n);
            unsafe { relax_block(self.cells.0, self.layout, self.round, bi, bj) };
        }
    }
}

struct Queue {
    units: VecDeque<Unit>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    work_ready: Condvar,
    outstanding: AtomicUsize,
    done_lock: Mutex<()>,
    done: Condvar,
}

pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                units: VecDeque::new(),
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            outstanding: AtomicUsize::new(0),
            done_lock: Mutex::new(()),
            done: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("route-planner-{}", id))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }
        debug!("Started route planner pool with {} workers", threads);

        Ok(Self { shared, workers })
    }

    /// Relax every block of `chunk` and wait until all of them are done.
    ///
    /// # Safety
    ///
    /// `cells` must be valid for `layout` for the duration of the call and must
    /// not be accessed by anything else until it returns.
    pub unsafe fn run_chunk(&self, cells: *mut Cell, layout: Layout, round: usize, chunk: Chunk) {
        let total = chunk.len();
        if total == 0 {
            return;
        }
        let unit_count = total.div_ceil(THREAD_WORK_SIZE);
        self.shared.outstanding.store(unit_count, Ordering::SeqCst);

        {
            let mut queue = self.shared.queue.lock();
            let mut first = 0;
            while first < total {
                let count = THREAD_WORK_SIZE.min(total - first);
                queue.units.push_back(Unit {
                    cells: MatrixPtr(cells),
                    layout,
                    round,
                    chunk,
                    first,
                    count,
                });
                first += count;
            }
        }
        self.shared.work_ready.notify_all();
        self.shared.wait_idle();
    }
}

impl Shared {
    fn wait_idle(&self) {
        let mut guard = self.done_lock.lock();
        while self.outstanding.load(Ordering::SeqCst) != 0 {
            self.done.wait(&mut guard);
        }
    }
}

/// Marks one unit finished when dropped, including while unwinding
struct Completion<'a>(&'a Shared);

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if self.0.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.0.done_lock.lock();
            self.0.done.notify_all();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.work_ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let unit = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(unit) = queue.units.pop_front() {
                    break unit;
                }
                if queue.shutdown {
                    return;
                }
                shared.work_ready.wait(&mut queue);
            }
        };

        let _done = Completion(shared);
        unit.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shared(outstanding: usize) -> Arc<Shared> {
        Arc::new(Shared {
            queue: Mutex::new(Queue {
                units: VecDeque::new(),
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            outstanding: AtomicUsize::new(outstanding),
            done_lock: Mutex::new(()),
            done: Condvar::new(),
        })
    }

    #[test]
    fn test_panicking_unit_still_completes() {
        let shared = shared(2);

        let finished = Arc::clone(&shared);
        std::thread::spawn(move || {
            let _done = Completion(&finished);
        })
        .join()
        .unwrap();

        let panicked = Arc::clone(&shared);
        let result = std::thread::spawn(move || {
            let _done = Completion(&panicked);
            std::thread::sleep(Duration::from_millis(20));
            panic!("relaxation failed");
        })
        .join();
        assert!(result.is_err());

        shared.wait_idle();
        assert_eq!(shared.outstanding.load(Ordering::SeqCst), 0);
    }
}
