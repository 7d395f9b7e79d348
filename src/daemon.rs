use crate::milter::Milter;
use crate::server::Server;
use log::{info, warn};
use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::error::Error;
use std::fs;
use std::net::SocketAddr;
#[cfg(feature = "systemd")]
use std::os::fd::FromRawFd as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

static FLAG_SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(clap::Args, Debug)]
pub struct DaemonArgs {
    /// TCP address to listen on
    #[arg(default_value = "127.0.0.1:7044")]
    pub address: String,
    /// Listen on a Unix socket at this path instead
    #[arg(long)]
    pub unix: Option<PathBuf>,
    /// Maximum number of concurrent sessions (0: unlimited)
    #[arg(long = "max-sessions", default_value_t = 0)]
    pub max_sessions: usize,
    /// Milliseconds between shutdown checks
    #[arg(long = "poll-ms", default_value_t = 100)]
    pub poll_ms: u64,
}

extern "C" fn handlerfunc(_signum: c_int) {
    FLAG_SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handler() -> nix::Result<()> {
    // no SA_RESTART: a blocked poll() returns EINTR and the flag is seen
    let action = SigAction::new(
        SigHandler::Handler(handlerfunc),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}

/// Returns the listen socket and, for Unix sockets we created, its path.
fn listen_socket(args: &DaemonArgs) -> Result<(Socket, Option<&Path>), Box<dyn Error>> {
    #[cfg(feature = "systemd")]
    if let Some(fd) = systemd::daemon::listen_fds(false)?.iter().next() {
        info!("using listen socket passed by systemd");
        return Ok((unsafe { Socket::from_raw_fd(fd) }, None));
    }

    if let Some(path) = &args.unix {
        if path.exists() {
            fs::remove_file(path)?;
        }
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(128)?;
        return Ok((socket, Some(path.as_path())));
    }

    let address: SocketAddr = args.address.parse()?;
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(128)?;
    Ok((socket, None))
}

/// Serves `factory`'s filters until SIGTERM or SIGINT, then waits for running
/// sessions to finish.
pub fn daemon<M, F>(args: &DaemonArgs, factory: F) -> Result<(), Box<dyn Error>>
where
    M: Milter + 'static,
    F: Fn() -> (M, u32, u32) + Send + Sync + 'static,
{
    let (listener, socket_path) = listen_socket(args)?;
    let poll_interval = Duration::from_millis(args.poll_ms);
    let failures = Arc::new(AtomicU64::new(0));
    let server = {
        let failures = Arc::clone(&failures);
        Server::builder(listener, factory)
            .max_sessions(args.max_sessions)
            .poll_interval(poll_interval)
            .observer(move |_| {
                failures.fetch_add(1, Ordering::Relaxed);
            })
            .build()
    };
    let server = Arc::new(server);

    install_signal_handler()?;
    let serving = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.serve())
    };
    while !FLAG_SHUTDOWN.load(Ordering::Relaxed) && !serving.is_finished() {
        thread::sleep(poll_interval);
    }

    let active = server.active_sessions();
    if active > 0 {
        info!("waiting for {active} sessions to complete");
    }
    server.shutdown();
    let result = serving.join().map_err(|_| "server thread panicked")?;

    if let Some(path) = socket_path
        && let Err(e) = fs::remove_file(path)
    {
        warn!("cannot remove {}: {e}", path.display());
    }
    let failures = failures.load(Ordering::Relaxed);
    if failures > 0 {
        warn!("{failures} sessions ended with an error");
    }
    Ok(result?)
}
