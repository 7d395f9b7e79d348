use crate::error::{Error, Result};
use crate::milter::Milter;
use crate::session::Session;
use log::{debug, error, info};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socket2::{SockAddr, Socket};
use std::any::Any;
use std::io;
use std::os::fd::AsFd as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Called with the error that ended a session.
pub type ErrorObserver = Box<dyn Fn(&Error) + Send + Sync>;

/// Produces the callbacks and negotiation flags (`SMFIF_*` actions,
/// `SMFIP_*` protocol) for a new connection.
type Factory<M> = Arc<dyn Fn() -> (M, u32, u32) + Send + Sync>;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Activity {
    accepting: bool,
    sessions: usize,
}

#[derive(Default)]
struct Tracker {
    shutdown: AtomicBool,
    activity: Mutex<Activity>,
    changed: Condvar,
}

impl Tracker {
    fn lock(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
        self.changed.notify_all();
    }

    fn session_started(self: &Arc<Self>) -> SessionGuard {
        self.lock().sessions += 1;
        SessionGuard(Arc::clone(self))
    }

    /// Waits up to `timeout` for fewer than `max` sessions to be running.
    fn wait_for_slot(&self, max: usize, timeout: Duration) -> bool {
        let (activity, _) = self
            .changed
            .wait_timeout_while(self.lock(), timeout, |a| a.sessions >= max)
            .unwrap_or_else(PoisonError::into_inner);
        activity.sessions < max
    }

    fn wait_idle(&self) {
        let _idle = self
            .changed
            .wait_while(self.lock(), |a| a.accepting || a.sessions > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Counts a running session until dropped.
struct SessionGuard(Arc<Tracker>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.lock().sessions -= 1;
        self.0.changed.notify_all();
    }
}

/// Accepts MTA connections and serves each on its own thread.
///
/// Build with [`Server::builder`], run [`Server::serve`] on one thread and call
/// [`Server::shutdown`] from another (wrap the server in an [`Arc`]).
pub struct Server<M> {
    listener: Mutex<Option<Socket>>,
    factory: Factory<M>,
    observers: Arc<Vec<ErrorObserver>>,
    max_sessions: Option<usize>,
    poll_interval: Duration,
    tracker: Arc<Tracker>,
    started: AtomicBool,
}

pub struct ServerBuilder<M> {
    listener: Socket,
    factory: Factory<M>,
    observers: Vec<ErrorObserver>,
    max_sessions: Option<usize>,
    poll_interval: Duration,
}

impl<M: Milter + 'static> ServerBuilder<M> {
    /// Registers an observer for session failures. May be called repeatedly.
    pub fn observer(mut self, observer: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Caps the number of concurrent sessions; 0 means unlimited.
    pub fn max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = (max_sessions > 0).then_some(max_sessions);
        self
    }

    /// How long the accept loop blocks before rechecking for shutdown.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn build(self) -> Server<M> {
        Server {
            listener: Mutex::new(Some(self.listener)),
            factory: self.factory,
            observers: Arc::new(self.observers),
            max_sessions: self.max_sessions,
            poll_interval: self.poll_interval,
            tracker: Arc::default(),
            started: AtomicBool::new(false),
        }
    }
}

impl<M: Milter + 'static> Server<M> {
    /// `listener` must already be bound and listening.
    pub fn builder<F>(listener: Socket, factory: F) -> ServerBuilder<M>
    where
        F: Fn() -> (M, u32, u32) + Send + Sync + 'static,
    {
        ServerBuilder {
            listener,
            factory: Arc::new(factory),
            observers: Vec::new(),
            max_sessions: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn new<F>(listener: Socket, factory: F) -> Self
    where
        F: Fn() -> (M, u32, u32) + Send + Sync + 'static,
    {
        Self::builder(listener, factory).build()
    }

    /// Accepts connections until [`Server::shutdown`] is called or the listener
    /// fails. Sessions still running when this returns keep running.
    ///
    /// Returns `Ok(())` right away if shutdown came first. A server serves at
    /// most once; later calls fail with [`Error::ServerStopped`].
    pub fn serve(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::ServerStopped);
        }
        let listener = {
            let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(listener) = slot.take() else {
                // shutdown() already closed the listener
                return Ok(());
            };
            self.tracker.set_accepting(true);
            listener
        };
        if let Ok(addr) = listener.local_addr() {
            info!("milter server listening on {}", describe(&addr));
        }

        let mut next_id: u64 = 0;
        let result = loop {
            if self.tracker.shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            if let Some(max) = self.max_sessions
                && !self.tracker.wait_for_slot(max, self.poll_interval)
            {
                continue;
            }
            match wait_readable(&listener, self.poll_interval) {
                Ok(true) => (),
                Ok(false) | Err(Errno::EINTR) => continue,
                Err(e) => break Err(Error::Io(e.into())),
            }
            match listener.accept() {
                Ok((socket, addr)) => {
                    next_id += 1;
                    self.spawn_session(next_id, socket, &addr);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::ConnectionAborted
                    ) => {}
                Err(e) => {
                    error!("accept: {e}");
                    break Err(Error::Io(e));
                }
            }
        };

        drop(listener);
        self.tracker.set_accepting(false);
        info!("milter server stopped accepting connections");
        result
    }

    /// Stops accepting connections and waits for running sessions to finish.
    /// Calling it again only waits.
    pub fn shutdown(&self) {
        if !self.tracker.shutdown.swap(true, Ordering::SeqCst) {
            info!("milter server shutting down");
        }
        // closes the listener if serve() never took it
        drop(
            self.listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.tracker.wait_idle();
    }

    pub fn is_shutdown(&self) -> bool {
        self.tracker.shutdown.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.tracker.lock().sessions
    }

    fn spawn_session(&self, id: u64, socket: Socket, peer: &SockAddr) {
        let peer = describe(peer);
        let factory = Arc::clone(&self.factory);
        let observers = Arc::clone(&self.observers);
        let guard = self.tracker.session_started();
        let spawned = thread::Builder::new()
            .name(format!("milter-{id}"))
            .spawn(move || {
                let _guard = guard;
                debug!("session {id}: connection from {peer}");
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let (milter, actions, protocol) = factory();
                    Session::new(milter, actions, protocol, socket).handle_commands()
                }));
                let err = match outcome {
                    Ok(Ok(end)) => {
                        debug!("session {id}: finished ({end:?})");
                        return;
                    }
                    Ok(Err(e)) => e,
                    Err(payload) => {
                        let e = Error::Panic(panic_message(payload.as_ref()));
                        error!("session {id}: {e}");
                        e
                    }
                };
                for observer in observers.iter() {
                    observer(&err);
                }
            });
        if let Err(e) = spawned {
            error!("cannot start session thread: {e}");
        }
    }
}

fn wait_readable(listener: &Socket, timeout: Duration) -> nix::Result<bool> {
    let timeout = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
    Ok(poll(&mut fds, PollTimeout::from(timeout))? > 0)
}

fn describe(addr: &SockAddr) -> String {
    if let Some(addr) = addr.as_socket() {
        addr.to_string()
    } else if let Some(path) = addr.as_pathname() {
        path.display().to_string()
    } else {
        "unnamed socket".to_string()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[test]
fn test_panic_message() {
    let payload = panic::catch_unwind(|| -> u8 { panic!("boom {}", 1) }).unwrap_err();
    assert_eq!(panic_message(payload.as_ref()), "boom 1");
    let payload = panic::catch_unwind(|| -> u8 { panic::panic_any(7u8) }).unwrap_err();
    assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
}

#[test]
fn test_session_guard_counts() {
    let tracker = Arc::new(Tracker::default());
    let a = tracker.session_started();
    let b = tracker.session_started();
    assert_eq!(tracker.lock().sessions, 2);
    assert!(!tracker.wait_for_slot(2, Duration::from_millis(10)));
    drop(a);
    assert!(tracker.wait_for_slot(2, Duration::from_millis(10)));
    drop(b);
    tracker.wait_idle();
}
