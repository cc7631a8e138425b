//! Process-wide server state.
//!
//! Connection handlers share one [`SharedState`] through an [`Arc`]. It owns a
//! single lock guarding both the activity [`Counters`] and the image engine, so
//! engine calls are serialized across every connection. The lock is only ever
//! held for a counter update or one engine call, never around socket I/O.
//!
//! Every counter change goes through one method that also pushes the new
//! values to a [`CounterMirror`] while the lock is still held, so an observer
//! never sees a half-applied update.
use std::{
    fmt::Display,
    fs,
    path::PathBuf,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use log::{trace, warn};

use crate::engine::ImageEngine;

pub const TOTAL_THREADS_FILE: &str = "totalthreadcount.txt";
pub const ACTIVE_THREADS_FILE: &str = "activethreadcount.txt";
pub const ACTIVE_SOCKETS_FILE: &str = "activesocketcount.txt";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Handler threads started since the process began.
    pub total_threads: u64,
    /// Handler threads currently running.
    pub active_threads: usize,
    /// Accepted sockets not yet closed.
    pub active_sockets: usize,
}

/// Observable surface the counters are copied to after every change.
pub trait CounterMirror: Send {
    fn mirror(&mut self, counters: &Counters);
}

impl CounterMirror for () {
    fn mirror(&mut self, _: &Counters) {}
}

/// Mirrors each counter into its own text file inside a status directory.
#[derive(Debug, Clone)]
pub struct StatusFiles {
    dir: PathBuf,
}

impl StatusFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write(&self, name: &str, value: impl Display) {
        let path = self.dir.join(name);
        if let Err(e) = fs::write(&path, format!("{value}\n")) {
            warn!("failed to update status file {path:?}: {e}");
        }
    }
}

impl CounterMirror for StatusFiles {
    fn mirror(&mut self, counters: &Counters) {
        self.write(TOTAL_THREADS_FILE, counters.total_threads);
        self.write(ACTIVE_THREADS_FILE, counters.active_threads);
        self.write(ACTIVE_SOCKETS_FILE, counters.active_sockets);
    }
}

struct Guarded {
    counters: Counters,
    mirror: Box<dyn CounterMirror>,
    engine: Box<dyn ImageEngine>,
}

pub struct SharedState {
    guarded: Mutex<Guarded>,
    vacancy: Condvar,
}

impl SharedState {
    pub fn new(engine: impl ImageEngine + 'static) -> Self {
        Self::with_mirror(engine, ())
    }

    /// Creates the state and publishes the initial, all-zero counters.
    pub fn with_mirror(
        engine: impl ImageEngine + 'static,
        mirror: impl CounterMirror + 'static,
    ) -> Self {
        let counters = Counters::default();
        let mut mirror: Box<dyn CounterMirror> = Box::new(mirror);
        mirror.mirror(&counters);

        Self {
            guarded: Mutex::new(Guarded {
                counters,
                mirror,
                engine: Box::new(engine),
            }),
            vacancy: Condvar::new(),
        }
    }

    // A panic inside an engine call must not take the counters down with it.
    fn lock(&self) -> MutexGuard<'_, Guarded> {
        self.guarded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The only place counters are modified.
    fn update(&self, change: impl FnOnce(&mut Counters)) -> Counters {
        let mut guarded = self.lock();
        let Guarded {
            counters, mirror, ..
        } = &mut *guarded;

        change(counters);
        mirror.mirror(counters);
        trace!("counters now {counters:?}");
        *counters
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    /// Runs `job` with exclusive access to the engine.
    pub fn run_engine<R>(&self, job: impl FnOnce(&mut dyn ImageEngine) -> R) -> R {
        let mut guarded = self.lock();
        job(&mut *guarded.engine)
    }

    /// Blocks until fewer than `limit` sockets are open. A limit of zero
    /// never blocks.
    pub fn wait_for_vacancy(&self, limit: usize) {
        if limit == 0 {
            return;
        }
        let guarded = self.lock();
        let _guarded = self
            .vacancy
            .wait_while(guarded, |g| g.counters.active_sockets >= limit)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Counts a newly accepted socket. The returned guard releases it, and
    /// the handler thread if one was started, when dropped.
    pub fn open_socket(self: &Arc<Self>) -> ConnectionGuard {
        self.update(|c| c.active_sockets += 1);
        ConnectionGuard {
            state: Arc::clone(self),
            thread: None,
        }
    }
}

/// Tracks one connection from accept to close.
///
/// Dropping the guard is the single exit path for a connection, whichever
/// way the handler ends.
pub struct ConnectionGuard {
    state: Arc<SharedState>,
    thread: Option<u64>,
}

impl ConnectionGuard {
    /// Counts the handler thread now serving this connection and returns its
    /// sequence number, which is unique for the life of the process.
    pub fn start_thread(&mut self) -> u64 {
        if let Some(id) = self.thread {
            return id;
        }
        let counters = self.state.update(|c| {
            c.total_threads += 1;
            c.active_threads += 1;
        });
        self.thread = Some(counters.total_threads);
        counters.total_threads
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let running = self.thread.is_some();
        self.state.update(|c| {
            debug_assert!(c.active_sockets > 0);
            if running {
                debug_assert!(c.active_threads > 0);
                c.active_threads = c.active_threads.saturating_sub(1);
            }
            c.active_sockets = c.active_sockets.saturating_sub(1);
        });
        self.state.vacancy.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::atomic::Ordering, thread, time::Duration};

    use tempdir::TempDir;

    use crate::engine::testing::StubEngine;

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingMirror(Arc<Mutex<Vec<Counters>>>);

    impl CounterMirror for RecordingMirror {
        fn mirror(&mut self, counters: &Counters) {
            self.0.lock().unwrap().push(*counters);
        }
    }

    #[test]
    fn guard_releases_socket_and_thread_once() {
        let state = Arc::new(SharedState::new(StubEngine::default()));

        let mut guard = state.open_socket();
        assert_eq!(guard.start_thread(), 1);
        assert_eq!(guard.start_thread(), 1);
        assert_eq!(
            state.counters(),
            Counters {
                total_threads: 1,
                active_threads: 1,
                active_sockets: 1
            }
        );

        drop(guard);
        assert_eq!(
            state.counters(),
            Counters {
                total_threads: 1,
                active_threads: 0,
                active_sockets: 0
            }
        );
    }

    #[test]
    fn guard_without_thread_only_releases_socket() {
        let state = Arc::new(SharedState::new(StubEngine::default()));

        let running = {
            let mut guard = state.open_socket();
            guard.start_thread();
            guard
        };
        drop(state.open_socket());

        assert_eq!(state.counters().active_threads, 1);
        assert_eq!(state.counters().active_sockets, 1);
        drop(running);
        assert_eq!(state.counters().active_sockets, 0);
    }

    #[test]
    fn every_change_is_mirrored() {
        let mirror = RecordingMirror::default();
        let state = Arc::new(SharedState::with_mirror(
            StubEngine::default(),
            mirror.clone(),
        ));

        let mut guard = state.open_socket();
        guard.start_thread();
        drop(guard);

        let seen = mirror.0.lock().unwrap();
        let sockets: Vec<usize> = seen.iter().map(|c| c.active_sockets).collect();
        let threads: Vec<usize> = seen.iter().map(|c| c.active_threads).collect();
        assert_eq!(sockets, vec![0, 1, 1, 0]);
        assert_eq!(threads, vec![0, 0, 1, 0]);
    }

    #[test]
    fn status_files_hold_counters() {
        let temp = TempDir::new("status").unwrap();
        let state = Arc::new(SharedState::with_mirror(
            StubEngine::default(),
            StatusFiles::new(temp.path()),
        ));

        let mut guard = state.open_socket();
        guard.start_thread();

        let read = |name: &str| fs::read_to_string(temp.path().join(name)).unwrap();
        assert_eq!(read(TOTAL_THREADS_FILE), "1\n");
        assert_eq!(read(ACTIVE_THREADS_FILE), "1\n");
        assert_eq!(read(ACTIVE_SOCKETS_FILE), "1\n");

        drop(guard);
        assert_eq!(read(TOTAL_THREADS_FILE), "1\n");
        assert_eq!(read(ACTIVE_SOCKETS_FILE), "0\n");
    }

    #[test]
    fn vacancy_waits_for_a_release() {
        let state = Arc::new(SharedState::new(StubEngine::default()));
        let guard = state.open_socket();

        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_for_vacancy(1))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().unwrap();
    }

    #[test]
    fn engine_calls_never_overlap() {
        let engine = StubEngine::default();
        let state = Arc::new(SharedState::new(engine.clone()));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..20 {
                        state.run_engine(|engine| {
                            engine.detect(Path::new("/nonexistent/image"))
                        });
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(engine.calls.load(Ordering::SeqCst), 160);
        assert_eq!(engine.overlapped.load(Ordering::SeqCst), 0);
    }
}
