//! Command queue, command buffers and completion handles
//!
//! Work is encoded into a [`CommandBuffer`], committed to a [`CommandQueue`]
//! and executed by one of the queue's worker threads. Completion handlers run
//! on the worker right after the kernel, before waiters are released.

use crate::error::{EngineError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    End,
}

/// Lifecycle of a committed command unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    Submitted,
    Completed,
    Failed,
}

#[derive(Debug)]
struct Status {
    state: CommandState,
    error: Option<String>,
}

#[derive(Debug)]
struct Completion {
    status: Mutex<Status>,
    done: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            status: Mutex::new(Status {
                state: CommandState::Idle,
                error: None,
            }),
            done: Condvar::new(),
        }
    }

    fn set(&self, state: CommandState, error: Option<String>) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.state = state;
        status.error = error;
        if matches!(state, CommandState::Completed | CommandState::Failed) {
            self.done.notify_all();
        }
    }
}

/// Handle to a committed command unit.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    id: u64,
    completion: Arc<Completion>,
}

impl CommandHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> CommandState {
        self.completion
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Block until the unit has completed or failed. Completion handlers have
    /// already run when this returns.
    pub fn wait_until_completed(&self) -> CommandState {
        let mut status = self
            .completion
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !matches!(status.state, CommandState::Completed | CommandState::Failed) {
            status = self
                .completion
                .done
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
        status.state
    }

    /// Failure message of a failed unit.
    pub fn error(&self) -> Option<String> {
        self.completion
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .clone()
    }
}

type Kernel<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;
type Handler<T> = Box<dyn FnOnce(&Result<T>) + Send + 'static>;

/// One unit of work being encoded.
pub struct CommandBuffer<'q, T> {
    queue: &'q CommandQueue,
    label: String,
    kernel: Option<Kernel<T>>,
    handlers: Vec<Handler<T>>,
}

impl<'q, T: Send + 'static> CommandBuffer<'q, T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Set the work this unit performs.
    pub fn encode<F>(&mut self, kernel: F)
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.kernel = Some(Box::new(kernel));
    }

    /// Register a callback that receives the kernel result on the worker thread.
    pub fn add_completed_handler<F>(&mut self, handler: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Submit the unit. Handlers are dropped unrun if the unit is never submitted.
    pub fn commit(self) -> Result<CommandHandle> {
        let CommandBuffer {
            queue,
            label,
            kernel,
            handlers,
        } = self;
        let kernel = kernel.ok_or_else(|| {
            EngineError::GraphEncoding(format!("{}: committed without encoded work", label))
        })?;

        let id = queue.next_id.fetch_add(1, Ordering::Relaxed);
        let completion = Arc::new(Completion::new());
        let handle = CommandHandle {
            id,
            completion: completion.clone(),
        };

        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(kernel)).unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "kernel panicked".to_string());
                Err(EngineError::DeviceExecution(format!("{}: {}", label, message)))
            });
            for handler in handlers {
                if panic::catch_unwind(AssertUnwindSafe(|| handler(&result))).is_err() {
                    log::error!("{}: completion handler panicked", label);
                }
            }
            match &result {
                Ok(_) => completion.set(CommandState::Completed, None),
                Err(err) => completion.set(CommandState::Failed, Some(err.to_string())),
            }
        });

        handle.completion.set(CommandState::Submitted, None);
        queue.submit(job)?;
        Ok(handle)
    }
}

/// Submission queue backed by a fixed pool of worker threads.
pub struct CommandQueue {
    sender: mpsc::Sender<Message>,
    workers: Vec<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl CommandQueue {
    pub fn new(worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(EngineError::ResourceAcquisition(
                "command queue needs at least one worker".into(),
            ));
        }

        let (sender, receiver) = mpsc::channel::<Message>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("command-worker-{}", index))
                .spawn(move || run_worker(receiver))
                .map_err(|err| {
                    EngineError::ResourceAcquisition(format!("cannot spawn worker: {}", err))
                })?;
            workers.push(worker);
        }

        log::debug!("command queue started with {} workers", worker_count);
        Ok(Self {
            sender,
            workers,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn make_command_buffer<T: Send + 'static>(&self, label: impl Into<String>) -> CommandBuffer<'_, T> {
        CommandBuffer {
            queue: self,
            label: label.into(),
            kernel: None,
            handlers: Vec::new(),
        }
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.sender
            .send(Message::Run(job))
            .map_err(|_| EngineError::ResourceAcquisition("command queue is shut down".into()))
    }
}

fn run_worker(receiver: Arc<Mutex<mpsc::Receiver<Message>>>) {
    loop {
        let message = {
            let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            guard.recv()
        };
        match message {
            Ok(Message::Run(job)) => job(),
            Ok(Message::End) | Err(_) => return,
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Message::End);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("command worker exited by panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_wait() {
        let queue = CommandQueue::new(2).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let mut buffer = queue.make_command_buffer::<u32>("sum");
        buffer.encode(|| Ok(40 + 2));
        let seen_in_handler = seen.clone();
        buffer.add_completed_handler(move |result| {
            *seen_in_handler.lock().unwrap() = result.as_ref().ok().copied();
        });

        let handle = buffer.commit().unwrap();
        assert_eq!(handle.wait_until_completed(), CommandState::Completed);
        assert_eq!(*seen.lock().unwrap(), Some(42));
        assert!(handle.error().is_none());
    }

    #[test]
    fn test_panic_becomes_failure() {
        let queue = CommandQueue::new(1).unwrap();
        let mut buffer = queue.make_command_buffer::<()>("boom");
        buffer.encode(|| panic!("bad kernel"));
        let handled = Arc::new(Mutex::new(false));
        let flag = handled.clone();
        buffer.add_completed_handler(move |result| {
            *flag.lock().unwrap() = result.is_err();
        });

        let handle = buffer.commit().unwrap();
        assert_eq!(handle.wait_until_completed(), CommandState::Failed);
        assert!(*handled.lock().unwrap());
        assert!(handle.error().unwrap().contains("bad kernel"));
    }

    #[test]
    fn test_commit_without_kernel_is_encoding_error() {
        let queue = CommandQueue::new(1).unwrap();
        let buffer = queue.make_command_buffer::<()>("empty");
        assert!(matches!(buffer.commit(), Err(EngineError::GraphEncoding(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            CommandQueue::new(0),
            Err(EngineError::ResourceAcquisition(_))
        ));
    }
}
