//! Main emulation engine.
//!
//! The engine owns the device state and one executor per DMA channel,
//! per compute core, plus the host command processor. Execution proceeds
//! in scheduling rounds: every executor takes exactly one turn per round,
//! in an order chosen by the [`Scheduler`].
//!
//! - `InOrder` steps executors in a fixed order (channels, cores, host).
//! - `Shuffled { seed }` draws a fresh permutation every round from a
//!   seeded RNG, so any interleaving bug reproduces from its seed.
//!
//! A round in which no executor advances can never be followed by one
//! that does (every wait depends only on device state), so it is reported
//! as [`EngineStatus::Stalled`] immediately.
//!
//! # Usage
//!
//! ```ignore
//! let mut engine = Engine::new(topology, program, Schedule::InOrder);
//! engine.start();
//! let status = engine.run(10_000, None)?;
//! ```

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{BlockReason, ChannelExecutor, CommandProcessor, CoreExecutor, Executor, Progress};
use crate::device::{DeviceState, LockId};
use crate::error::RunError;
use crate::npu::HostProgram;
use crate::topology::PipelineTopology;

/// Executor ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// Fixed order every round.
    #[default]
    InOrder,
    /// Random permutation every round.
    Shuffled { seed: u64 },
}

/// Produces the executor order for each round.
#[derive(Debug)]
pub struct Scheduler {
    schedule: Schedule,
    rng: Option<StdRng>,
}

impl Scheduler {
    pub fn new(schedule: Schedule) -> Self {
        let rng = match schedule {
            Schedule::InOrder => None,
            Schedule::Shuffled { seed } => Some(StdRng::seed_from_u64(seed)),
        };
        Self { schedule, rng }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Order in which `n` executors take their turns this round.
    pub fn order(&mut self, n: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..n).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }
        order
    }

    /// Restart the random sequence from the seed.
    pub fn reset(&mut self) {
        *self = Self::new(self.schedule);
    }
}

/// Engine execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Not started.
    Idle,
    /// Host program still executing.
    Running,
    /// Host program retired every instruction.
    Completed,
    /// No executor can make progress.
    Stalled,
}

/// Main emulation engine.
#[derive(Debug)]
pub struct Engine {
    /// Device state being emulated.
    pub state: DeviceState,
    channels: Vec<ChannelExecutor>,
    cores: Vec<CoreExecutor>,
    host: CommandProcessor,
    scheduler: Scheduler,
    /// Current engine status.
    pub status: EngineStatus,
    /// Scheduling rounds executed.
    pub rounds: u64,
    /// Check the handshake invariant after every turn.
    pub check_invariants: bool,
    /// Blocked executors from the last round.
    blocked: Vec<(String, BlockReason)>,
}

impl Engine {
    /// Create an engine with one executor per channel and core.
    pub fn new(topology: Arc<PipelineTopology>, program: HostProgram, schedule: Schedule) -> Self {
        let channels = topology.channels().map(|c| ChannelExecutor::new(c.clone())).collect();
        let cores = topology.cores().iter().map(|c| CoreExecutor::new(c.clone())).collect();

        Self {
            state: DeviceState::new(topology),
            channels,
            cores,
            host: CommandProcessor::new(program),
            scheduler: Scheduler::new(schedule),
            status: EngineStatus::Idle,
            rounds: 0,
            check_invariants: true,
            blocked: Vec::new(),
        }
    }

    /// Start the host program.
    pub fn start(&mut self) {
        log::info!(
            "Starting pipeline: {} channels, {} cores, {} host instructions, {:?}",
            self.channels.len(),
            self.cores.len(),
            self.host.program().len(),
            self.scheduler.schedule()
        );
        self.host.start();
        self.status = EngineStatus::Running;
    }

    /// Reset executors and tile state. Host memory is kept.
    pub fn reset(&mut self) {
        self.state.reset();
        self.channels.iter_mut().for_each(|c| c.reset());
        self.cores.iter_mut().for_each(|c| c.reset());
        self.host.reset();
        self.scheduler.reset();
        self.status = EngineStatus::Idle;
        self.rounds = 0;
        self.blocked.clear();
    }

    fn executor_count(&self) -> usize {
        self.channels.len() + self.cores.len() + 1
    }

    /// Every lock currently held by an executor.
    pub fn held_locks(&self) -> Vec<LockId> {
        let channels = self.channels.iter().flat_map(|c| c.held_locks());
        let cores = self.cores.iter().flat_map(|c| c.held_locks());
        channels.chain(cores).collect()
    }

    /// Give every executor one turn.
    pub fn step_round(&mut self) -> Result<EngineStatus, RunError> {
        if self.status != EngineStatus::Running {
            return Ok(self.status);
        }

        let count = self.executor_count();
        let order = self.scheduler.order(count);
        let mut advanced = false;
        self.blocked.clear();

        for index in order {
            let executor = pick(&mut self.channels, &mut self.cores, &mut self.host, index);
            match executor.step(&mut self.state)? {
                Progress::Advanced => advanced = true,
                Progress::Blocked(reason) => self.blocked.push((executor.name(), reason)),
                Progress::Finished => {}
            }

            if self.check_invariants {
                self.state.check_invariants(&self.held_locks())?;
            }
        }
        self.rounds += 1;

        if self.host.is_finished() {
            log::info!("Pipeline completed after {} rounds", self.rounds);
            self.status = EngineStatus::Completed;
        } else if !advanced {
            log::warn!("Pipeline stalled after {} rounds: {}", self.rounds, self.blocked_summary());
            self.status = EngineStatus::Stalled;
        }
        Ok(self.status)
    }

    /// Run for up to `max_rounds` rounds or until `deadline`.
    ///
    /// Stops early on completion or a stall. Returns the status reached;
    /// `Running` means the budget ran out.
    pub fn run(&mut self, max_rounds: u64, deadline: Option<Instant>) -> Result<EngineStatus, RunError> {
        let limit = self.rounds.saturating_add(max_rounds);

        while self.status == EngineStatus::Running && self.rounds < limit {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                log::warn!("Wall-clock deadline reached after {} rounds", self.rounds);
                break;
            }
            self.step_round()?;
        }
        Ok(self.status)
    }

    /// One line per blocked executor from the last round.
    pub fn blocked_summary(&self) -> String {
        self.blocked
            .iter()
            .map(|(name, reason)| format!("{}: {}", name, reason))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn channels(&self) -> &[ChannelExecutor] {
        &self.channels
    }

    pub fn cores(&self) -> &[CoreExecutor] {
        &self.cores
    }

    pub fn host(&self) -> &CommandProcessor {
        &self.host
    }

    /// Print engine status.
    pub fn print_status(&self) {
        println!("Engine Status: {:?}", self.status);
        println!("Rounds: {}", self.rounds);
        println!("Host instructions retired: {}", self.host.executed);

        println!();
        println!("Channels:");
        for ch in &self.channels {
            println!(
                "  {:<12} {:<8} transfers={} elements={} lock_wait={} flow_wait={}",
                ch.name(),
                ch.phase().to_string(),
                ch.stats.transfers,
                ch.stats.elements,
                ch.stats.lock_wait_turns,
                ch.stats.flow_wait_turns
            );
        }

        println!("Cores:");
        for core in &self.cores {
            println!(
                "  {:<12} {:<8} iterations={} lock_wait={}",
                core.name(),
                core.phase().to_string(),
                core.stats.iterations,
                core.stats.lock_wait_turns
            );
        }

        println!("Guards:");
        let topology = self.state.topology();
        for (guard, cycles) in topology.guards().iter().zip(self.state.guard_cycles()) {
            println!("  {} {:<4} cycles={}", guard.buffer.tile, guard.name, cycles);
        }
    }
}

/// Executor `index` in scheduling order: channels, then cores, then host.
fn pick<'a>(
    channels: &'a mut [ChannelExecutor],
    cores: &'a mut [CoreExecutor],
    host: &'a mut CommandProcessor,
    index: usize,
) -> &'a mut dyn Executor {
    if index < channels.len() {
        &mut channels[index]
    } else if index < channels.len() + cores.len() {
        &mut cores[index - channels.len()]
    } else {
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::{BufferDescriptor, ChannelDirection, ChannelId};
    use crate::device::{DataDirection, MatrixShape, TileCoord};
    use crate::npu::NpuInstruction;
    use crate::topology::{StepSpec, TopologyBuilder};

    const SHIM: TileCoord = TileCoord::new(0, 0);
    const MEM: TileCoord = TileCoord::new(0, 1);

    /// Shim -> mem tile -> shim loopback, double-buffered in the mem tile.
    fn topology() -> Arc<PipelineTopology> {
        let mut b = TopologyBuilder::new();
        b.tile(SHIM).tile(MEM);
        for name in ["ping", "pong"] {
            b.buffer(MEM, name, MatrixShape::new(2, 2));
            b.lock(MEM, &format!("{}_empty", name), 1).lock(MEM, &format!("{}_full", name), 0);
            b.guard(MEM, name, &format!("{}_empty", name), &format!("{}_full", name));
        }
        let fill = |n: &str| StepSpec::new(n).acquire(&format!("{}_empty", n), 1).release(&format!("{}_full", n), 1);
        let drain = |n: &str| StepSpec::new(n).acquire(&format!("{}_full", n), 1).release(&format!("{}_empty", n), 1);
        b.shim_channel(SHIM, ChannelDirection::MM2S, 0);
        b.shim_channel(SHIM, ChannelDirection::S2MM, 0);
        b.s2mm(MEM, 0, vec![fill("ping"), fill("pong")]);
        b.mm2s(MEM, 0, vec![drain("ping"), drain("pong")]);
        b.flow_mm2s_to_s2mm((SHIM, 0), (MEM, 0));
        b.flow_mm2s_to_s2mm((MEM, 0), (SHIM, 0));
        Arc::new(b.build().unwrap())
    }

    /// Move a 4x4 matrix through the loopback as four contiguous tiles.
    fn program() -> HostProgram {
        let mut program = HostProgram::new();
        let mm2s = ChannelId::mm2s(SHIM, 0);
        let s2mm = ChannelId::s2mm(SHIM, 0);
        for i in 0..4u32 {
            let desc = BufferDescriptor::new(i as usize * 4, 1, 4, 4, 1);
            program.enqueue(mm2s, 0, i, &desc).unwrap();
            program.enqueue(s2mm, 1, 4 + i, &desc).unwrap();
            program.push(NpuInstruction::sync(s2mm));
        }
        program
    }

    fn engine(schedule: Schedule) -> Engine {
        let mut engine = Engine::new(topology(), program(), schedule);
        let input = engine.state.host.allocate(MatrixShape::new(4, 4), DataDirection::Input);
        engine.state.host.get_mut(input).unwrap().data = (0..16).collect();
        engine.state.host.allocate(MatrixShape::new(4, 4), DataDirection::Output);
        engine
    }

    #[test]
    fn test_idle_until_started() {
        let mut engine = engine(Schedule::InOrder);
        assert_eq!(engine.step_round().unwrap(), EngineStatus::Idle);
        assert_eq!(engine.rounds, 0);
    }

    #[test]
    fn test_loopback_completes_in_order() {
        let mut engine = engine(Schedule::InOrder);
        engine.start();
        assert_eq!(engine.run(1_000, None).unwrap(), EngineStatus::Completed);
        assert_eq!(engine.state.host.get(1).unwrap().data, (0..16).collect::<Vec<i32>>());
        assert_eq!(engine.state.guard_cycles(), &[2, 2]);
    }

    #[test]
    fn test_loopback_completes_under_shuffled_schedules() {
        for seed in 0..64 {
            let mut engine = engine(Schedule::Shuffled { seed });
            engine.start();
            let status = engine.run(10_000, None).unwrap();
            assert_eq!(status, EngineStatus::Completed, "seed {}", seed);
            assert_eq!(engine.state.host.get(1).unwrap().data, (0..16).collect::<Vec<i32>>(), "seed {}", seed);
        }
    }

    #[test]
    fn test_same_seed_same_schedule() {
        let mut a = Scheduler::new(Schedule::Shuffled { seed: 42 });
        let mut b = Scheduler::new(Schedule::Shuffled { seed: 42 });
        let first = a.order(8);
        assert_eq!(first, b.order(8));
        for _ in 0..10 {
            assert_eq!(a.order(8), b.order(8));
        }

        a.reset();
        assert_eq!(a.order(8), first);

        let mut sorted = first;
        sorted.sort();
        assert_eq!(sorted, (0..8).collect::<Vec<_>>());

        let mut in_order = Scheduler::new(Schedule::InOrder);
        assert_eq!(in_order.order(4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_missing_input_stalls() {
        // Sync on the output without ever feeding the input.
        let mut program = HostProgram::new();
        let s2mm = ChannelId::s2mm(SHIM, 0);
        program.enqueue(s2mm, 1, 0, &BufferDescriptor::contiguous(4)).unwrap();
        program.push(NpuInstruction::sync(s2mm));

        let mut engine = Engine::new(topology(), program, Schedule::InOrder);
        engine.state.host.allocate(MatrixShape::new(4, 4), DataDirection::Input);
        engine.state.host.allocate(MatrixShape::new(4, 4), DataDirection::Output);
        engine.start();

        assert_eq!(engine.run(1_000, None).unwrap(), EngineStatus::Stalled);
        assert!(engine.rounds < 1_000);
        assert!(engine.blocked_summary().contains("sync on"));
    }

    #[test]
    fn test_round_budget() {
        let mut engine = engine(Schedule::InOrder);
        engine.start();
        assert_eq!(engine.run(2, None).unwrap(), EngineStatus::Running);
        assert_eq!(engine.rounds, 2);
    }

    #[test]
    fn test_expired_deadline() {
        let mut engine = engine(Schedule::InOrder);
        engine.start();
        assert_eq!(engine.run(1_000, Some(Instant::now())).unwrap(), EngineStatus::Running);
        assert_eq!(engine.rounds, 0);
    }

    #[test]
    fn test_reset_allows_rerun() {
        let mut engine = engine(Schedule::Shuffled { seed: 3 });
        engine.start();
        engine.run(10_000, None).unwrap();
        let rounds = engine.rounds;

        engine.reset();
        assert_eq!(engine.status, EngineStatus::Idle);
        assert!(engine.held_locks().is_empty());
        engine.start();
        assert_eq!(engine.run(10_000, None).unwrap(), EngineStatus::Completed);
        assert_eq!(engine.rounds, rounds);
    }
}
