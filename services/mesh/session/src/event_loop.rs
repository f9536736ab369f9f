//! Background event loop.
//!
//! A single-threaded tokio runtime driven by one dedicated OS thread. All
//! socket work of a registry runs here while the foreground thread stays free
//! for the interactive menu.

use futures::future::join_all;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::runtime::{EnterGuard, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;

struct StopRequest {
    drain: Vec<JoinHandle<()>>,
    grace: Duration,
}

/// Handle to a running event loop thread
pub struct EventLoop {
    name: String,
    handle: Handle,
    thread_id: ThreadId,
    stop_tx: Mutex<Option<oneshot::Sender<StopRequest>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventLoop {
    /// Build the runtime and start its thread
    pub fn start(name: &str) -> Result<Self, SessionError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<StopRequest>();

        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("Event loop {} running", thread_name);
                // A dropped sender means the owner went away without a stop request.
                if let Ok(request) = runtime.block_on(stop_rx) {
                    runtime.block_on(async {
                        let pending = request.drain.len();
                        if tokio::time::timeout(request.grace, join_all(request.drain))
                            .await
                            .is_err()
                        {
                            warn!(
                                "Event loop {}: {} writer(s) still busy after {:?}, abandoning",
                                thread_name, pending, request.grace
                            );
                        }
                    });
                }
                runtime.shutdown_background();
                debug!("Event loop {} stopped", thread_name);
            })?;

        Ok(Self {
            name: name.to_string(),
            handle,
            thread_id: thread.thread().id(),
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Spawn a task onto the loop
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SessionError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_stopped() {
            return Err(SessionError::EventLoopStopped);
        }
        Ok(self.handle.spawn(future))
    }

    /// Enter the loop's runtime context on the calling thread, so sockets
    /// created there register with the loop's reactor.
    pub fn enter(&self) -> Result<EnterGuard<'_>, SessionError> {
        if self.is_stopped() {
            return Err(SessionError::EventLoopStopped);
        }
        Ok(self.handle.enter())
    }

    /// Whether `stop` has been requested
    pub fn is_stopped(&self) -> bool {
        lock(&self.stop_tx).is_none()
    }

    /// Whether the caller runs on the loop thread
    pub fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop the loop after waiting up to `grace` for `drain` to finish. Every
    /// other pending task is abandoned. Joins the thread unless called from it.
    pub fn stop(&self, drain: Vec<JoinHandle<()>>, grace: Duration) {
        let Some(stop_tx) = lock(&self.stop_tx).take() else {
            return;
        };
        let _ = stop_tx.send(StopRequest { drain, grace });

        if self.on_loop_thread() {
            return;
        }
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                warn!("Event loop {} thread panicked", self.name);
            }
        }
        info!("Event loop {} stopped", self.name);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Dropping the sender releases the thread; never join here, the last
        // owner may live on the loop thread itself.
        lock(&self.stop_tx).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_spawned_tasks_run_on_loop_thread() {
        let event_loop = EventLoop::start("test-loop").unwrap();
        let (tx, rx) = mpsc::channel();

        event_loop
            .spawn(async move {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            })
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("test-loop"));
        event_loop.stop(Vec::new(), Duration::ZERO);
    }

    #[test]
    fn test_stop_rejects_new_work() {
        let event_loop = EventLoop::start("test-loop-stop").unwrap();
        event_loop.stop(Vec::new(), Duration::ZERO);

        assert!(event_loop.is_stopped());
        assert!(matches!(
            event_loop.spawn(async {}),
            Err(SessionError::EventLoopStopped)
        ));
        // Second stop is a no-op.
        event_loop.stop(Vec::new(), Duration::ZERO);
    }

    #[test]
    fn test_stop_waits_for_drain_tasks() {
        let event_loop = EventLoop::start("test-loop-drain").unwrap();
        let (tx, rx) = mpsc::channel();

        let task = event_loop
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                tx.send(()).unwrap();
            })
            .unwrap();

        event_loop.stop(vec![task], Duration::from_secs(2));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_stop_abandons_slow_drain_after_grace() {
        let event_loop = EventLoop::start("test-loop-grace").unwrap();
        let task = event_loop
            .spawn(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
            })
            .unwrap();

        let started = std::time::Instant::now();
        event_loop.stop(vec![task], Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
