//! Thread pools used by the build pipeline.
//!
//! [`WorkerGroup`] runs fire-and-forget jobs (file content digesting);
//! [`OrderedPool`] runs jobs in parallel while handing results back in
//! submission order (block compression, where blocks must hit the output
//! stream in order).

use std::collections::BTreeMap;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel as mpmc;

type Job = Box<dyn FnOnce() + Send>;

/// A group of worker threads draining a shared job queue.
pub struct WorkerGroup {
    tx: Option<mpmc::Sender<Job>>,
    state: Arc<GroupState>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("threads", &self.handles.len())
            .finish_non_exhaustive()
    }
}

struct GroupState {
    pending: Mutex<usize>,
    idle: Condvar,
    panicked: AtomicBool,
}

impl WorkerGroup {
    /// Spawn `threads` workers named `{name}-{i}`.
    pub fn new(name: &str, threads: NonZero<usize>) -> std::io::Result<Self> {
        let (tx, rx) = mpmc::unbounded::<Job>();
        let state = Arc::new(GroupState {
            pending: Mutex::new(0),
            idle: Condvar::new(),
            panicked: AtomicBool::new(false),
        });
        let handles = (0..threads.get())
            .map(|i| {
                let rx = rx.clone();
                let state = Arc::clone(&state);
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || Self::worker(&rx, &state))
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self {
            tx: Some(tx),
            state,
            handles,
        })
    }

    fn worker(rx: &mpmc::Receiver<Job>, state: &GroupState) {
        while let Ok(job) = rx.recv() {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                state.panicked.store(true, Ordering::Relaxed);
            }
            let mut pending = state.pending.lock().expect("not poisoned");
            *pending -= 1;
            if *pending == 0 {
                state.idle.notify_all();
            }
        }
    }

    /// Queue a job.
    pub fn add_job(&self, job: impl FnOnce() + Send + 'static) {
        *self.state.pending.lock().expect("not poisoned") += 1;
        self.tx
            .as_ref()
            .expect("group is running")
            .send(Box::new(job))
            .expect("workers are alive");
    }

    /// Block until every queued job has finished.
    ///
    /// # Panics
    ///
    /// Panics if any job panicked.
    pub fn wait(&self) {
        let mut pending = self.state.pending.lock().expect("not poisoned");
        while *pending != 0 {
            pending = self.state.idle.wait(pending).expect("not poisoned");
        }
        drop(pending);
        if self.state.panicked.load(Ordering::Relaxed) {
            panic!("a worker job panicked");
        }
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.tx = None;
        let worker_panicked = std::mem::take(&mut self.handles)
            .into_iter()
            .fold(false, |p, j| p | j.join().is_err());
        if worker_panicked && !thread::panicking() {
            panic!("a worker thread panicked");
        }
    }
}

type OrderedJob<R> = (u64, Box<dyn FnOnce() -> R + Send>);

/// Run jobs in parallel, yielding results in submission order.
///
/// At most `queue_cap` jobs are in flight; a further submission blocks until
/// the oldest outstanding job completes, which is the backpressure the
/// ordering worker paces itself on.
pub struct OrderedPool<R> {
    injector: Option<mpmc::Sender<OrderedJob<R>>>,
    collector: mpmc::Receiver<(u64, thread::Result<R>)>,
    next_submit: u64,
    next_emit: u64,
    done: BTreeMap<u64, R>,
    threads: Vec<thread::JoinHandle<()>>,
    queue_cap: usize,
}

impl<R: Send + 'static> std::fmt::Debug for OrderedPool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedPool")
            .field("threads", &self.threads.len())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl<R: Send + 'static> OrderedPool<R> {
    pub fn new(name: &str, threads: NonZero<usize>, queue_cap: NonZero<usize>) -> std::io::Result<Self> {
        let queue_cap = queue_cap.get().max(threads.get());
        let (injector, rx) = mpmc::bounded::<OrderedJob<R>>(queue_cap);
        let (tx, collector) = mpmc::unbounded();
        let threads = (0..threads.get())
            .map(|i| {
                let rx = rx.clone();
                let tx = tx.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok((seq, job)) = rx.recv() {
                            let ret = panic::catch_unwind(AssertUnwindSafe(job));
                            if tx.send((seq, ret)).is_err() {
                                break;
                            }
                        }
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self {
            injector: Some(injector),
            collector,
            next_submit: 0,
            next_emit: 0,
            done: BTreeMap::new(),
            threads,
            queue_cap,
        })
    }

    /// Jobs submitted but not yet emitted.
    pub fn in_flight(&self) -> usize {
        (self.next_submit - self.next_emit) as usize
    }

    fn absorb(&mut self, (seq, ret): (u64, thread::Result<R>)) {
        let v = ret.unwrap_or_else(|_| panic!("an ordered job panicked"));
        self.done.insert(seq, v);
    }

    fn take_ready(&mut self, out: &mut Vec<R>) {
        while let Some(v) = self.done.remove(&self.next_emit) {
            out.push(v);
            self.next_emit += 1;
        }
    }

    /// Submit a job and collect all results that are ready, in order.
    ///
    /// Blocks while the queue is full.
    pub fn submit(&mut self, job: impl FnOnce() -> R + Send + 'static) -> Vec<R> {
        while self.in_flight() >= self.queue_cap {
            let ret = self.collector.recv().expect("workers are alive");
            self.absorb(ret);
        }
        self.injector
            .as_ref()
            .expect("pool is running")
            .send((self.next_submit, Box::new(job)))
            .expect("workers are alive");
        self.next_submit += 1;

        while let Ok(ret) = self.collector.try_recv() {
            self.absorb(ret);
        }
        let mut out = Vec::new();
        self.take_ready(&mut out);
        out
    }

    /// Wait for everything outstanding and return the tail of the results,
    /// in order.
    pub fn finish(&mut self) -> Vec<R> {
        self.injector = None;
        let mut out = Vec::new();
        while self.next_emit + (self.done.len() as u64) < self.next_submit {
            let ret = self.collector.recv().expect("workers are alive");
            self.absorb(ret);
        }
        self.take_ready(&mut out);
        debug_assert_eq!(self.next_emit, self.next_submit);
        out
    }
}

impl<R> Drop for OrderedPool<R> {
    fn drop(&mut self) {
        self.injector = None;
        let worker_panicked = std::mem::take(&mut self.threads)
            .into_iter()
            .fold(false, |p, j| p | j.join().is_err());
        if worker_panicked && !thread::panicking() {
            panic!("a worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_group_waits() {
        let wg = WorkerGroup::new("test", NonZero::new(3).unwrap()).unwrap();
        let sum = Arc::new(std::sync::atomic::AtomicU64::new(0));
        for i in 0..100u64 {
            let sum = Arc::clone(&sum);
            wg.add_job(move || {
                sum.fetch_add(i, Ordering::Relaxed);
            });
        }
        wg.wait();
        assert_eq!(sum.load(Ordering::Relaxed), 4950);
    }

    #[test]
    fn ordered_pool_preserves_order() {
        let mut pool =
            OrderedPool::new("test", NonZero::new(4).unwrap(), NonZero::new(4).unwrap()).unwrap();
        let mut got = Vec::new();
        for i in 0..64u64 {
            got.extend(pool.submit(move || {
                // Make late submissions finish early.
                std::thread::sleep(std::time::Duration::from_micros(500 - i % 32 * 7));
                i
            }));
        }
        got.extend(pool.finish());
        assert_eq!(got, (0..64).collect::<Vec<_>>());
    }
}
