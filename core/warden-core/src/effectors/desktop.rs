//! The desktop thread: the one thread allowed to install input hooks.
//!
//! Hooks must be installed and removed from the thread that pumps the
//! interactive session's messages. The agent dedicates a thread to that and
//! every input-affecting capability is marshalled onto it.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use tracing::debug;

use super::Capability;
use crate::error::{Result, WardenError};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Quit,
}

/// Owns the desktop thread. Dropping it closes the queue and joins the thread.
pub struct DesktopThread {
    handle: DesktopHandle,
    join: Option<JoinHandle<()>>,
}

impl DesktopThread {
    pub fn spawn() -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Message>();
        let join = thread::Builder::new()
            .name("desktop".to_string())
            .spawn(move || pump(rx))
            .map_err(|err| WardenError::io("Failed to spawn desktop thread", err))?;
        let thread_id = join.thread().id();
        Ok(Self {
            handle: DesktopHandle { tx, thread_id },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> DesktopHandle {
        self.handle.clone()
    }

    /// Stops accepting work and waits for queued jobs to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.tx.send(Message::Quit);
        if let Some(join) = self.join.take() {
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for DesktopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump(rx: Receiver<Message>) {
    for message in rx {
        match message {
            Message::Run(job) => job(),
            Message::Quit => break,
        }
    }
    debug!("Desktop thread exiting");
}

#[derive(Clone)]
pub struct DesktopHandle {
    tx: Sender<Message>,
    thread_id: ThreadId,
}

impl DesktopHandle {
    /// Runs `f` on the desktop thread and waits for its result.
    pub fn run<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if thread::current().id() == self.thread_id {
            return Ok(f());
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Message::Run(Box::new(move || {
                let _ = reply_tx.send(f());
            })))
            .map_err(|_| desktop_gone())?;
        reply_rx.recv().map_err(|_| desktop_gone())
    }
}

fn desktop_gone() -> WardenError {
    WardenError::EffectorUnsupported("desktop thread is not running".to_string())
}

/// Marshals a capability's calls onto the desktop thread.
pub struct OnDesktop<C: ?Sized + Capability = dyn Capability> {
    inner: Arc<C>,
    desktop: DesktopHandle,
}

impl<C: ?Sized + Capability + 'static> OnDesktop<C> {
    pub fn new(inner: Arc<C>, desktop: DesktopHandle) -> Self {
        Self { inner, desktop }
    }
}

impl<C: ?Sized + Capability + 'static> Capability for OnDesktop<C> {
    fn activate(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.desktop.run(move || inner.activate())?
    }

    fn deactivate(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.desktop.run(move || inner.deactivate())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ThreadProbe {
        seen: Mutex<Vec<Option<String>>>,
    }

    impl Capability for ThreadProbe {
        fn activate(&self) -> Result<()> {
            let name = thread::current().name().map(str::to_string);
            self.seen.lock().unwrap().push(name);
            Ok(())
        }

        fn deactivate(&self) -> Result<()> {
            self.activate()
        }
    }

    #[test]
    fn capability_runs_on_desktop_thread() {
        let desktop = DesktopThread::spawn().unwrap();
        let probe = Arc::new(ThreadProbe {
            seen: Mutex::new(Vec::new()),
        });
        let wrapped = OnDesktop::new(probe.clone(), desktop.handle());
        wrapped.activate().unwrap();
        wrapped.deactivate().unwrap();
        assert_eq!(
            *probe.seen.lock().unwrap(),
            vec![Some("desktop".to_string()), Some("desktop".to_string())]
        );
        drop(wrapped);
        desktop.shutdown();
    }

    #[test]
    fn nested_calls_run_inline() {
        let desktop = DesktopThread::spawn().unwrap();
        let handle = desktop.handle();
        let inner = handle.clone();
        let value = handle.run(move || inner.run(|| 7)).unwrap().unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn stopped_desktop_rejects_work() {
        let desktop = DesktopThread::spawn().unwrap();
        let handle = desktop.handle();
        desktop.shutdown();
        assert!(handle.run(|| 1).is_err());
    }
}
