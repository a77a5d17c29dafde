//! Runs a [`TcpStack`] on its own tokio task.
//!
//! The task owns the stack. It ticks the coarse and fine timers on their
//! intervals and runs the closures sent through a [`TcpHandle`] one at a
//! time, so application calls, timer ticks and arriving segments never
//! overlap.

use crate::tcp::TcpStack;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

/// The number of commands that may wait for the driver before callers block.
const COMMAND_BACKLOG: usize = 64;

type Command = Box<dyn FnOnce(&mut TcpStack) + Send>;

/// Sends work to a running driver. Cloning a handle is cheap. Once every
/// handle is gone the driver stops and its task yields the stack back.
#[derive(Debug, Clone)]
pub struct TcpHandle {
    commands: mpsc::Sender<Command>,
}

impl TcpHandle {
    /// Runs `f` on the stack and returns its result.
    pub async fn call<F, R>(&self, f: F) -> Result<R, DriverError>
    where
        F: FnOnce(&mut TcpStack) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let command: Command = Box::new(move |stack| {
            // The caller may have given up waiting
            let _ = reply.send(f(stack));
        });
        self.commands
            .send(command)
            .await
            .map_err(|_| DriverError::Stopped)?;
        result.await.map_err(|_| DriverError::Stopped)
    }

    /// Whether the driver task is still accepting work.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Moves `stack` onto a new task. Must be called from within a tokio runtime.
pub fn spawn(stack: TcpStack) -> (TcpHandle, JoinHandle<TcpStack>) {
    let (commands, receiver) = mpsc::channel(COMMAND_BACKLOG);
    let task = tokio::spawn(run(stack, receiver));
    (TcpHandle { commands }, task)
}

async fn run(mut stack: TcpStack, mut commands: mpsc::Receiver<Command>) -> TcpStack {
    let mut slow = time::interval(Duration::from_millis(stack.config().slow_interval_ms));
    let mut fast = time::interval(Duration::from_millis(stack.config().fast_interval_ms));
    slow.set_missed_tick_behavior(MissedTickBehavior::Delay);
    fast.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // An interval's first tick completes immediately
    slow.tick().await;
    fast.tick().await;

    tracing::debug!("driver: started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command(&mut stack),
                None => break,
            },
            _ = slow.tick() => stack.slow_tmr(),
            _ = fast.tick() => stack.fast_tmr(),
        }
    }
    tracing::debug!("driver: every handle dropped, stopping");
    stack
}

/// An error at the boundary between callers and the driver task.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("The TCP driver has stopped")]
    Stopped,
}
