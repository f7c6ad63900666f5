//! Emulation of the pipeline's concurrent engines.
//!
//! Every DMA channel, every compute core and the host command processor
//! is an independent engine. All of them are written as the same small
//! state machine:
//!
//! ```text
//!          ┌──────────────────────────────────────────┐
//!          ▼                                          │
//!   Idle ─► WaitLock ──(acquired)──► Run ──► Signal ──┘
//!                                            │
//!                                            └──► Done
//! ```
//!
//! - `WaitLock`: try the acquire; stay here while it would block.
//! - `Run`: move or compute one tile (may also block on a flow).
//! - `Signal`: release the paired lock and advance the program.
//!
//! Engines never block inside a step. A step either advances the state
//! machine or reports what it is blocked on; the [`Engine`] retries on the
//! next scheduling round.
//!
//! # Example
//!
//! ```ignore
//! use xdna_pipeline::emu::{Engine, Schedule};
//!
//! let mut engine = Engine::new(topology, program, Schedule::Shuffled { seed: 7 });
//! engine.start();
//! engine.run(10_000, None)?;
//! ```

pub mod core;
pub mod channel;
pub mod command;
pub mod engine;

pub use self::core::{AddKernel, ComputeCoreProgram, CoreExecutor, CoreStats, ElementwiseKernel};
pub use channel::{ChannelExecutor, ChannelStats};
pub use command::CommandProcessor;
pub use engine::{Engine, EngineStatus, Schedule, Scheduler};

use crate::device::dma::ChannelId;
use crate::device::{DeviceState, LockId};
use crate::error::RunError;

/// Position of an engine in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing to do (shim channel with no queued descriptor, or not
    /// started).
    Idle,
    /// Waiting to acquire a lock.
    WaitLock,
    /// Moving or computing one tile.
    Run,
    /// Releasing the paired lock.
    Signal,
    /// Program complete.
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "Idle",
            Phase::WaitLock => "WaitLock",
            Phase::Run => "Run",
            Phase::Signal => "Signal",
            Phase::Done => "Done",
        };
        write!(f, "{}", name)
    }
}

/// What an engine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Lock acquire condition not met.
    Lock(LockId),
    /// Outbound flow is occupied.
    FlowFull(ChannelId),
    /// Inbound flow has nothing to deliver.
    FlowEmpty(ChannelId),
    /// Shim channel has no queued descriptor.
    NoDescriptor(ChannelId),
    /// Host waiting for a shim channel to drain.
    Sync(ChannelId),
    /// Host program not started yet.
    NotStarted,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Lock(lock) => write!(f, "waiting on {}", lock),
            BlockReason::FlowFull(ch) => write!(f, "{} back-pressured", ch),
            BlockReason::FlowEmpty(ch) => write!(f, "{} starved", ch),
            BlockReason::NoDescriptor(ch) => write!(f, "{} has no descriptor", ch),
            BlockReason::Sync(ch) => write!(f, "sync on {}", ch),
            BlockReason::NotStarted => write!(f, "not started"),
        }
    }
}

/// Outcome of one scheduling turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// State changed.
    Advanced,
    /// Nothing changed; retry later.
    Blocked(BlockReason),
    /// Program finished; nothing more will happen.
    Finished,
}

/// One independently scheduled engine.
pub trait Executor: std::fmt::Debug {
    /// Display name, e.g. `(0,1)MM2S0` or `core(0,2)`.
    fn name(&self) -> String;

    /// Current state machine position.
    fn phase(&self) -> Phase;

    /// Take one turn.
    fn step(&mut self, state: &mut DeviceState) -> Result<Progress, RunError>;

    /// Locks acquired and not yet signalled.
    fn held_locks(&self) -> Vec<LockId>;

    /// Return to the initial state.
    fn reset(&mut self);
}
