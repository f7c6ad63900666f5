//! Compute core executor.
//!
//! Each compute tile runs one core program: a fixed number of iterations
//! of
//!
//! ```text
//!   acquire A-full, B-full, C-empty   (in order, AcquireGreaterEqual)
//!   C = 0; C += kernel(A, B)          (elementwise)
//!   release A-empty, B-empty, C-full
//! ```
//!
//! The joint wait is performed as a sequence of acquires. Locks already
//! taken stay held while the core waits for the next one.

use std::sync::Arc;

use smallvec::SmallVec;

use super::{BlockReason, Executor, Phase, Progress};
use crate::device::{BufferId, DeviceState, LockId, LockResult, LockUse, TileCoord};
use crate::error::{ConfigError, RunError};

/// Elementwise binary operation applied by the core.
pub trait ElementwiseKernel: Send + Sync + std::fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Combine one element of each operand.
    fn combine(&self, a: i32, b: i32) -> i32;
}

/// `c = a + b` with two's-complement wraparound.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddKernel;

impl ElementwiseKernel for AddKernel {
    fn name(&self) -> &'static str {
        "add"
    }

    #[inline]
    fn combine(&self, a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }
}

/// Resolved core program.
#[derive(Debug, Clone)]
pub struct ComputeCoreProgram {
    pub tile: TileCoord,
    /// Joint wait, taken in order.
    pub acquires: SmallVec<[LockUse; 4]>,
    /// Operand buffers.
    pub inputs: [BufferId; 2],
    /// Result buffer.
    pub output: BufferId,
    /// Released in order after computing.
    pub releases: SmallVec<[LockUse; 4]>,
    /// Tiles processed before halting.
    pub iterations: u32,
    pub kernel: Arc<dyn ElementwiseKernel>,
}

/// Core execution statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStats {
    /// Iterations completed.
    pub iterations: u32,
    /// Turns spent blocked on a lock.
    pub lock_wait_turns: u64,
}

/// Core executor state.
#[derive(Debug)]
pub struct CoreExecutor {
    program: ComputeCoreProgram,
    phase: Phase,
    /// Number of joint-wait locks currently held.
    acquired: usize,
    pub stats: CoreStats,
}

impl CoreExecutor {
    pub fn new(program: ComputeCoreProgram) -> Self {
        Self { program, phase: Phase::WaitLock, acquired: 0, stats: CoreStats::default() }
    }

    pub fn program(&self) -> &ComputeCoreProgram {
        &self.program
    }

    /// Whether the core has run all its iterations.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn wait_locks(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        let mut advanced = false;

        while let Some(&lock_use) = self.program.acquires.get(self.acquired) {
            if state.apply_lock(lock_use)? == LockResult::WouldBlock {
                if advanced {
                    return Ok(Progress::Advanced);
                }
                self.stats.lock_wait_turns += 1;
                return Ok(Progress::Blocked(BlockReason::Lock(lock_use.lock)));
            }
            self.acquired += 1;
            advanced = true;
        }

        log::debug!("core{} acquired inputs for iteration {}", self.program.tile, self.stats.iterations);
        self.phase = Phase::Run;
        Ok(Progress::Advanced)
    }

    fn compute(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        let [a_id, b_id] = self.program.inputs;
        let a = read_buffer(state, a_id)?.to_vec();
        let b = read_buffer(state, b_id)?.to_vec();

        let out = state.buffer_mut(self.program.output).ok_or_else(|| missing(self.program.output))?;
        out.fill(0);
        for ((c, &x), &y) in out.iter_mut().zip(&a).zip(&b) {
            *c = c.wrapping_add(self.program.kernel.combine(x, y));
        }

        log::trace!("core{} {} over {} elements", self.program.tile, self.program.kernel.name(), out.len());
        self.phase = Phase::Signal;
        Ok(Progress::Advanced)
    }

    fn signal(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        for &lock_use in &self.program.releases {
            state.apply_lock(lock_use)?;
        }
        self.acquired = 0;
        self.stats.iterations += 1;

        if self.stats.iterations >= self.program.iterations {
            log::debug!("core{} done after {} iterations", self.program.tile, self.stats.iterations);
            self.phase = Phase::Done;
        } else {
            self.phase = Phase::WaitLock;
        }
        Ok(Progress::Advanced)
    }
}

impl Executor for CoreExecutor {
    fn name(&self) -> String {
        format!("core{}", self.program.tile)
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn step(&mut self, state: &mut DeviceState) -> Result<Progress, RunError> {
        match self.phase {
            Phase::Idle | Phase::WaitLock => {
                self.phase = Phase::WaitLock;
                self.wait_locks(state)
            }
            Phase::Run => self.compute(state),
            Phase::Signal => self.signal(state),
            Phase::Done => Ok(Progress::Finished),
        }
    }

    fn held_locks(&self) -> Vec<LockId> {
        let held = match self.phase {
            Phase::Run | Phase::Signal => self.program.acquires.len(),
            _ => self.acquired,
        };
        self.program.acquires[..held].iter().map(|u| u.lock).collect()
    }

    fn reset(&mut self) {
        self.phase = Phase::WaitLock;
        self.acquired = 0;
        self.stats = CoreStats::default();
    }
}

fn missing(id: BufferId) -> ConfigError {
    ConfigError::MissingBuffer { tile: id.tile, name: id.to_string() }
}

fn read_buffer(state: &DeviceState, id: BufferId) -> Result<&[i32], ConfigError> {
    state.buffer(id).ok_or_else(|| missing(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{LockAction, MatrixShape};
    use crate::topology::{PipelineTopology, TopologyBuilder};
    use smallvec::smallvec;

    const COMPUTE: TileCoord = TileCoord::new(0, 2);

    /// Compute tile with three guarded buffers and no programs.
    fn topology() -> Arc<PipelineTopology> {
        let mut b = TopologyBuilder::new();
        b.tile(COMPUTE);
        for name in ["a", "b", "c"] {
            b.buffer(COMPUTE, name, MatrixShape::new(2, 2));
            b.lock(COMPUTE, &format!("{}_empty", name), 1);
            b.lock(COMPUTE, &format!("{}_full", name), 0);
            b.guard(COMPUTE, name, &format!("{}_empty", name), &format!("{}_full", name));
        }
        Arc::new(b.build().unwrap())
    }

    fn lock(topo: &PipelineTopology, name: &str) -> LockId {
        topo.lock_id(COMPUTE, name).unwrap()
    }

    fn buffer(topo: &PipelineTopology, name: &str) -> BufferId {
        topo.tile(COMPUTE).unwrap().buffer(name).unwrap().id
    }

    fn program(topo: &PipelineTopology, iterations: u32) -> ComputeCoreProgram {
        let acq = |n: &str| LockUse::new(lock(topo, n), LockAction::AcquireGreaterEqual(1));
        let rel = |n: &str| LockUse::new(lock(topo, n), LockAction::Release(1));
        ComputeCoreProgram {
            tile: COMPUTE,
            acquires: smallvec![acq("a_full"), acq("b_full"), acq("c_empty")],
            inputs: [buffer(topo, "a"), buffer(topo, "b")],
            output: buffer(topo, "c"),
            releases: smallvec![rel("a_empty"), rel("b_empty"), rel("c_full")],
            iterations,
            kernel: Arc::new(AddKernel),
        }
    }

    /// Play the producer side of a guard: fill the buffer and mark it full.
    fn produce(state: &mut DeviceState, topo: &PipelineTopology, name: &str, data: &[i32]) {
        let empty = lock(topo, &format!("{}_empty", name));
        let full = lock(topo, &format!("{}_full", name));
        state.apply_lock(LockUse::new(empty, LockAction::AcquireGreaterEqual(1))).unwrap();
        state.buffer_mut(buffer(topo, name)).unwrap().copy_from_slice(data);
        state.apply_lock(LockUse::new(full, LockAction::Release(1))).unwrap();
    }

    #[test]
    fn test_add_kernel() {
        assert_eq!(AddKernel.combine(2, 3), 5);
        assert_eq!(AddKernel.combine(i32::MAX, 1), i32::MIN);
    }

    #[test]
    fn test_core_blocks_until_inputs_full() {
        let topo = topology();
        let mut state = DeviceState::new(Arc::clone(&topo));
        let mut core = CoreExecutor::new(program(&topo, 1));

        let progress = core.step(&mut state).unwrap();
        assert_eq!(progress, Progress::Blocked(BlockReason::Lock(lock(&topo, "a_full"))));
        assert_eq!(core.stats.lock_wait_turns, 1);
        assert!(core.held_locks().is_empty());
    }

    #[test]
    fn test_partial_acquire_is_held() {
        let topo = topology();
        let mut state = DeviceState::new(Arc::clone(&topo));
        let mut core = CoreExecutor::new(program(&topo, 1));

        produce(&mut state, &topo, "a", &[1, 2, 3, 4]);
        assert_eq!(core.step(&mut state).unwrap(), Progress::Advanced);
        assert_eq!(core.phase(), Phase::WaitLock);
        assert_eq!(core.held_locks(), vec![lock(&topo, "a_full")]);
        state.check_invariants(&core.held_locks()).unwrap();

        // Still waiting on B; A stays held.
        assert!(matches!(core.step(&mut state).unwrap(), Progress::Blocked(_)));
        assert_eq!(core.held_locks().len(), 1);
    }

    #[test]
    fn test_core_iteration() {
        let topo = topology();
        let mut state = DeviceState::new(Arc::clone(&topo));
        let mut core = CoreExecutor::new(program(&topo, 1));

        produce(&mut state, &topo, "a", &[1, 2, 3, 4]);
        produce(&mut state, &topo, "b", &[10, 20, 30, 40]);
        state.buffer_mut(buffer(&topo, "c")).unwrap().copy_from_slice(&[99; 4]);

        assert_eq!(core.step(&mut state).unwrap(), Progress::Advanced);
        assert_eq!(core.phase(), Phase::Run);
        state.check_invariants(&core.held_locks()).unwrap();

        assert_eq!(core.step(&mut state).unwrap(), Progress::Advanced);
        assert_eq!(state.buffer(buffer(&topo, "c")).unwrap(), &[11, 22, 33, 44]);

        assert_eq!(core.step(&mut state).unwrap(), Progress::Advanced);
        assert!(core.is_done());
        assert_eq!(core.step(&mut state).unwrap(), Progress::Finished);

        // Inputs handed back empty, output marked full.
        assert_eq!(state.lock(lock(&topo, "a_empty")).unwrap().value, 1);
        assert_eq!(state.lock(lock(&topo, "b_empty")).unwrap().value, 1);
        assert_eq!(state.lock(lock(&topo, "c_full")).unwrap().value, 1);
        state.check_invariants(&core.held_locks()).unwrap();
    }

    #[test]
    fn test_core_runs_configured_iterations() {
        let topo = topology();
        let mut state = DeviceState::new(Arc::clone(&topo));
        let mut core = CoreExecutor::new(program(&topo, 2));
        let c_full = lock(&topo, "c_full");
        let c_empty = lock(&topo, "c_empty");

        for i in 0..2 {
            produce(&mut state, &topo, "a", &[i; 4]);
            produce(&mut state, &topo, "b", &[1; 4]);
            for _ in 0..3 {
                core.step(&mut state).unwrap();
            }
            assert_eq!(state.buffer(buffer(&topo, "c")).unwrap(), &[i + 1; 4]);
            // Drain C so the next iteration can claim it.
            state.apply_lock(LockUse::new(c_full, LockAction::AcquireGreaterEqual(1))).unwrap();
            state.apply_lock(LockUse::new(c_empty, LockAction::Release(1))).unwrap();
        }

        assert!(core.is_done());
        assert_eq!(core.stats.iterations, 2);
        assert_eq!(state.guard_cycles(), &[2, 2, 2]);
    }

    #[test]
    fn test_reset() {
        let topo = topology();
        let mut state = DeviceState::new(Arc::clone(&topo));
        let mut core = CoreExecutor::new(program(&topo, 1));
        produce(&mut state, &topo, "a", &[0; 4]);
        core.step(&mut state).unwrap();

        core.reset();
        assert_eq!(core.phase(), Phase::WaitLock);
        assert!(core.held_locks().is_empty());
        assert_eq!(core.stats, CoreStats::default());
    }
}
