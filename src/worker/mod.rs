//! Privileged worker
//!
//! All kernel and OVS work runs on one dedicated OS thread. Namespace
//! membership (`setns`) is a per-thread attribute, so a single thread that owns
//! every namespace handle is the only place where the active namespace is
//! known. Requests arrive in submission order over an unbounded channel; the
//! first failure is latched and every later request is refused until a
//! resetting [`Command::Join`].

mod command;
mod ops;

pub use command::{
    client_mac, ClientFlows, ClientHost, ClientRoutes, Command, EdgeIface, HostSpec, InternalRoute, LinkSpec, Reply,
};
pub use ops::{names, Worker, BRIDGE_NAME, PING_ATTEMPTS};

use crate::{Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info_span};

pub const THREAD_NAME: &str = "netmirage-worker";

/// Worker settings fixed at startup
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub netns_dir: PathBuf,
    pub netns_prefix: String,
    pub ovs_dir: PathBuf,
    pub ovs_schema: PathBuf,
    /// Bytes of memory the namespace context cache may use
    pub mem_budget: usize,
    pub psched_path: PathBuf,
}

/// A command and, unless fire-and-forget, where to send its outcome
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub reply: Option<oneshot::Sender<Result<Reply>>>,
}

/// Something that carries out commands on the worker thread
pub trait Execute: Send + 'static {
    fn execute(&mut self, command: Command) -> Result<Reply>;

    /// Called once the request channel closes
    fn shutdown(&mut self) {}
}

/// Start a worker thread around `setup`, which runs on the new thread. The
/// outcome of `setup` is reported through `ready`.
pub fn spawn<E, F>(
    setup: F,
    requests: mpsc::UnboundedReceiver<Request>,
    ready: oneshot::Sender<Result<()>>,
) -> std::io::Result<JoinHandle<()>>
where
    E: Execute,
    F: FnOnce() -> Result<E> + Send + 'static,
{
    std::thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            let span = info_span!("worker");
            let _entered = span.enter();
            match setup() {
                Ok(executor) => {
                    let _ = ready.send(Ok(()));
                    serve(executor, requests);
                }
                Err(e) => {
                    let _ = ready.send(Err(e));
                }
            }
        })
}

/// Process requests until every sender is gone
pub fn serve<E: Execute>(mut executor: E, mut requests: mpsc::UnboundedReceiver<Request>) {
    let mut latched: Option<Arc<Error>> = None;

    while let Some(Request { command, reply }) = requests.blocking_recv() {
        let result = match command {
            Command::Join { reset } => {
                let result = match &latched {
                    Some(e) => Err(Error::Latched(e.clone())),
                    None => Ok(Reply::Done),
                };
                if reset {
                    latched = None;
                }
                result
            }
            command => match latched.clone() {
                Some(e) => {
                    debug!("Skipping {} after an earlier failure", command.name());
                    Err(Error::Latched(e))
                }
                None => {
                    let name = command.name();
                    let outcome = catch_unwind(AssertUnwindSafe(|| executor.execute(command)))
                        .unwrap_or_else(|_| Err(Error::Internal(format!("worker panicked during {}", name))));
                    outcome.map_err(|e| {
                        error!("{} failed: {}", name, e);
                        let e = Arc::new(e);
                        latched = Some(e.clone());
                        Error::Latched(e)
                    })
                }
            },
        };
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    debug!("Request channel closed; worker exiting");
    executor.shutdown();
}
