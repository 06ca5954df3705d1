//! Front-end handle to the worker thread
//!
//! Commands are executed strictly in submission order. [`WorkQueue::submit`]
//! does not wait; [`WorkQueue::query`] waits for the reply of one command and
//! [`WorkQueue::join`] waits for everything submitted so far. Once a command
//! fails, every later one is refused with the same error until a resetting
//! join.

use crate::worker::{self, Command, Execute, Reply, Request, Worker, WorkerConfig};
use crate::{Error, Result};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub struct WorkQueue {
    tx: Option<mpsc::UnboundedSender<Request>>,
    latched: Option<Arc<Error>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkQueue {
    /// Start the privileged worker
    pub async fn start(config: WorkerConfig) -> Result<Self> {
        Self::spawn_with(move || Worker::new(config)).await
    }

    /// Start a worker thread running whatever `setup` builds on it
    pub async fn spawn_with<E, F>(setup: F) -> Result<Self>
    where
        E: Execute,
        F: FnOnce() -> Result<E> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread = worker::spawn(setup, rx, ready_tx)?;
        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                tx: Some(tx),
                latched: None,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(Error::WorkerGone),
        }
    }

    fn refuse(&self) -> Result<()> {
        match &self.latched {
            Some(e) => Err(Error::Latched(e.clone())),
            None => Ok(()),
        }
    }

    fn send(&self, command: Command, reply: Option<oneshot::Sender<Result<Reply>>>) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::WorkerGone)?;
        tx.send(Request { command, reply }).map_err(|_| Error::WorkerGone)
    }

    fn remember(&mut self, result: &Result<Reply>) {
        if let Err(Error::Latched(e)) = result {
            self.latched = Some(e.clone());
        }
    }

    /// Queue a command without waiting for it
    pub fn submit(&mut self, command: Command) -> Result<()> {
        self.refuse()?;
        self.send(command, None)
    }

    /// Run a command and wait for its reply
    pub async fn query(&mut self, command: Command) -> Result<Reply> {
        self.refuse()?;
        let (tx, rx) = oneshot::channel();
        self.send(command, Some(tx))?;
        let result = rx.await.map_err(|_| Error::WorkerGone)?;
        self.remember(&result);
        result
    }

    /// Wait until every queued command has run. Reports the first failure
    /// since the last reset; `reset` clears it so new work is accepted again.
    pub async fn join(&mut self, reset: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Join { reset }, Some(tx))?;
        let result = rx.await.map_err(|_| Error::WorkerGone)?;
        if reset {
            self.latched = None;
        } else {
            self.remember(&result);
        }
        result.map(|_| ())
    }

    /// Close the queue and wait for the worker thread to finish
    pub async fn shutdown(mut self) -> Result<()> {
        self.tx = None;
        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            if joined.is_err() {
                return Err(Error::Internal("worker thread panicked".into()));
            }
        }
        debug!("Work queue shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records the ARP sizes it is asked for and fails on one of them
    struct Recorder {
        seen: Arc<Mutex<Vec<u64>>>,
        fail_on: Option<u64>,
    }

    impl Execute for Recorder {
        fn execute(&mut self, command: Command) -> Result<Reply> {
            match command {
                Command::TuneArp { expected } => {
                    self.seen.lock().push(expected);
                    if self.fail_on == Some(expected) {
                        return Err(Error::Exhausted(format!("entries for {}", expected)));
                    }
                    Ok(Reply::Port(expected as u32))
                }
                _ => Ok(Reply::Done),
            }
        }
    }

    async fn recorder(fail_on: Option<u64>) -> (WorkQueue, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let shared = seen.clone();
        let queue = WorkQueue::spawn_with(move || {
            Ok(Recorder {
                seen: shared,
                fail_on,
            })
        })
        .await
        .unwrap();
        (queue, seen)
    }

    fn tune(expected: u64) -> Command {
        Command::TuneArp { expected }
    }

    #[tokio::test]
    async fn test_commands_run_in_submission_order() {
        let (mut queue, seen) = recorder(None).await;
        for i in 0..100 {
            queue.submit(tune(i)).unwrap();
        }
        assert_eq!(queue.query(tune(100)).await.unwrap(), Reply::Port(100));
        queue.join(false).await.unwrap();
        assert_eq!(*seen.lock(), (0..=100).collect::<Vec<_>>());
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_latches_until_reset() {
        let (mut queue, seen) = recorder(Some(2)).await;
        for i in 0..5 {
            queue.submit(tune(i)).unwrap();
        }
        let err = queue.join(false).await.unwrap_err();
        assert!(err.to_string().contains("entries for 2"), "{}", err);
        // Commands queued behind the failure never ran
        assert_eq!(*seen.lock(), vec![0, 1, 2]);

        // The front end now refuses work without touching the worker
        assert!(matches!(queue.submit(tune(9)), Err(Error::Latched(_))));
        assert!(matches!(queue.query(tune(9)).await, Err(Error::Latched(_))));

        assert!(queue.join(true).await.is_err());
        queue.submit(tune(7)).unwrap();
        queue.join(false).await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 7]);
    }

    #[tokio::test]
    async fn test_query_reports_its_own_failure() {
        let (mut queue, _) = recorder(Some(1)).await;
        assert!(queue.query(tune(1)).await.is_err());
        assert!(matches!(queue.submit(tune(2)), Err(Error::Latched(_))));
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported() {
        let result = WorkQueue::spawn_with(|| -> Result<Recorder> { Err(Error::Capability("CAP_NET_ADMIN")) }).await;
        assert!(matches!(result, Err(Error::Capability("CAP_NET_ADMIN"))));
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        struct Panicker;
        impl Execute for Panicker {
            fn execute(&mut self, _: Command) -> Result<Reply> {
                panic!("boom");
            }
        }
        let mut queue = WorkQueue::spawn_with(|| Ok(Panicker)).await.unwrap();
        let err = queue.query(Command::Destroy).await.unwrap_err();
        assert!(err.to_string().contains("destroy"), "{}", err);
        queue.shutdown().await.unwrap();
    }
}
