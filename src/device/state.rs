//! Runtime state of the emulated device.
//!
//! [`DeviceState`] owns everything that changes while a pipeline runs:
//!
//! - lock values, one table per tile, created from the topology's initial
//!   values
//! - tile buffer memory, allocated once per declared buffer
//! - one [`FlowQueue`] per flow route
//! - host memory reached by the shim DMAs
//! - shim buffer descriptors written by the host and the per-channel
//!   queues they are pushed onto
//! - per-guard bookkeeping for the handshake invariant
//!
//! The topology itself is shared and never changes.
//!
//! # Handshake Invariant
//!
//! Every guarded buffer has an empty lock (init 1) and a full lock
//! (init 0). An engine that acquires either becomes a holder until it
//! releases the other one, so at all times:
//!
//! ```text
//! empty.value + full.value + holders == 1
//! ```
//!
//! Holders are reported by the engines themselves (the locks they have
//! acquired and not yet signalled), so a program that releases the wrong
//! lock or releases twice shows up as a violation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use super::dma::{BufferDescriptor, ChannelId};
use super::{BufferId, FlowQueue, HostMemory, Lock, LockAction, LockId, LockResult, LockUse, TileCoord};
use crate::error::{ConfigError, RunError};
use crate::topology::PipelineTopology;

/// A buffer descriptor written to a shim tile's descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShimBd {
    /// Host buffer index (runtime argument).
    pub ddr_id: usize,
    /// Region of the host buffer moved.
    pub descriptor: BufferDescriptor,
}

/// Descriptors pushed onto one shim channel.
#[derive(Debug, Clone, Default)]
struct ShimQueue {
    pending: VecDeque<ShimBd>,
    /// A descriptor has been taken and not yet completed.
    active: bool,
    /// Descriptors completed so far.
    completed: u64,
}

/// Device state for one pipeline.
#[derive(Debug)]
pub struct DeviceState {
    topology: Arc<PipelineTopology>,
    locks: BTreeMap<TileCoord, Vec<Lock>>,
    memory: HashMap<BufferId, Vec<i32>>,
    flows: Vec<FlowQueue>,
    outbound: HashMap<ChannelId, usize>,
    inbound: HashMap<ChannelId, usize>,
    /// Host buffers, indexed by ddr id.
    pub host: HostMemory,
    shim_queues: BTreeMap<ChannelId, ShimQueue>,
    shim_bds: BTreeMap<(u8, u32), ShimBd>,
    /// Times each guarded buffer was handed back empty.
    guard_cycles: Vec<u64>,
    guard_of: HashMap<LockId, usize>,
}

impl DeviceState {
    /// Allocate state for a topology. Locks start at their declared
    /// values and all buffers are zeroed.
    pub fn new(topology: Arc<PipelineTopology>) -> Self {
        let mut outbound = HashMap::new();
        let mut inbound = HashMap::new();
        for (i, route) in topology.flows().iter().enumerate() {
            outbound.insert(route.source, i);
            inbound.insert(route.dest, i);
        }

        let mut guard_of = HashMap::new();
        for (i, guard) in topology.guards().iter().enumerate() {
            guard_of.insert(guard.empty, i);
            guard_of.insert(guard.full, i);
        }

        let shim_queues = topology
            .channels()
            .filter(|ch| ch.is_host_queued())
            .map(|ch| (ch.id, ShimQueue::default()))
            .collect();

        let mut state = Self {
            flows: vec![FlowQueue::default(); topology.flows().len()],
            guard_cycles: vec![0; topology.guards().len()],
            locks: BTreeMap::new(),
            memory: HashMap::new(),
            outbound,
            inbound,
            host: HostMemory::new(),
            shim_queues,
            shim_bds: BTreeMap::new(),
            guard_of,
            topology,
        };
        state.reset();
        state
    }

    /// Return every tile-side resource to its initial state. Host memory
    /// is left alone.
    pub fn reset(&mut self) {
        self.locks = self.topology.tiles().map(|t| (t.coord, t.locks.instantiate())).collect();
        self.memory = self
            .topology
            .tiles()
            .flat_map(|t| t.buffers.iter())
            .map(|b| (b.id, vec![0; b.len()]))
            .collect();
        self.flows.iter_mut().for_each(|f| *f = FlowQueue::default());
        self.shim_queues.values_mut().for_each(|q| *q = ShimQueue::default());
        self.shim_bds.clear();
        self.guard_cycles.iter_mut().for_each(|c| *c = 0);
    }

    pub fn topology(&self) -> &Arc<PipelineTopology> {
        &self.topology
    }

    /// Current lock state.
    pub fn lock(&self, id: LockId) -> Option<&Lock> {
        self.locks.get(&id.tile)?.get(id.index as usize)
    }

    /// Apply a lock operation. A blocked acquire changes nothing.
    ///
    /// Releasing the empty lock of a guarded buffer counts one handshake
    /// cycle for that buffer.
    pub fn apply_lock(&mut self, lock_use: LockUse) -> Result<LockResult, RunError> {
        let id = lock_use.lock;
        let lock = self
            .locks
            .get_mut(&id.tile)
            .and_then(|table| table.get_mut(id.index as usize))
            .ok_or_else(|| ConfigError::MissingLock { tile: id.tile, name: id.to_string() })?;

        let result = lock.apply(lock_use.action);
        let value = lock.value;

        if result == LockResult::WouldBlock {
            return Ok(result);
        }
        if let LockAction::Release(_) = lock_use.action {
            if result == LockResult::WouldOverflow {
                log::warn!("{} saturated at {} on release", id, value);
            }
            if let Some(&g) = self.guard_of.get(&id) {
                if self.topology.guards()[g].empty == id {
                    self.guard_cycles[g] += 1;
                }
            }
        }

        log::trace!("{} {:?} -> {}", id, lock_use.action, value);
        Ok(result)
    }

    /// Tile buffer contents.
    pub fn buffer(&self, id: BufferId) -> Option<&[i32]> {
        self.memory.get(&id).map(Vec::as_slice)
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Option<&mut [i32]> {
        self.memory.get_mut(&id).map(Vec::as_mut_slice)
    }

    /// Flow fed by an MM2S channel.
    pub fn outbound_flow(&mut self, channel: ChannelId) -> Result<&mut FlowQueue, RunError> {
        let index = *self.outbound.get(&channel).ok_or(ConfigError::UnconnectedChannel(channel))?;
        Ok(&mut self.flows[index])
    }

    /// Flow draining into an S2MM channel.
    pub fn inbound_flow(&mut self, channel: ChannelId) -> Result<&mut FlowQueue, RunError> {
        let index = *self.inbound.get(&channel).ok_or(ConfigError::UnconnectedChannel(channel))?;
        Ok(&mut self.flows[index])
    }

    /// Flow queues in route order.
    pub fn flows(&self) -> &[FlowQueue] {
        &self.flows
    }

    /// Store a descriptor in a shim column's table.
    pub fn write_shim_bd(&mut self, column: u8, bd_id: u32, bd: ShimBd) {
        log::debug!("Shim column {} bd {} <- ddr {} {}", column, bd_id, bd.ddr_id, bd.descriptor);
        self.shim_bds.insert((column, bd_id), bd);
    }

    pub fn shim_bd(&self, column: u8, bd_id: u32) -> Option<ShimBd> {
        self.shim_bds.get(&(column, bd_id)).copied()
    }

    /// Queue a descriptor on a host-driven shim channel.
    pub fn push_shim_bd(&mut self, channel: ChannelId, bd: ShimBd) -> Result<(), RunError> {
        let queue = self.shim_queues.get_mut(&channel).ok_or(ConfigError::UnknownShimChannel(channel))?;
        queue.pending.push_back(bd);
        log::debug!("{} queued ddr {} {} ({} pending)", channel, bd.ddr_id, bd.descriptor, queue.pending.len());
        Ok(())
    }

    /// Take the next queued descriptor and mark the channel busy.
    pub fn take_shim_bd(&mut self, channel: ChannelId) -> Option<ShimBd> {
        let queue = self.shim_queues.get_mut(&channel)?;
        let bd = queue.pending.pop_front()?;
        queue.active = true;
        Some(bd)
    }

    /// Mark the channel's active descriptor complete.
    pub fn complete_shim_bd(&mut self, channel: ChannelId) {
        if let Some(queue) = self.shim_queues.get_mut(&channel) {
            queue.active = false;
            queue.completed += 1;
        }
    }

    /// Whether a shim channel has finished everything pushed onto it.
    pub fn shim_channel_idle(&self, channel: ChannelId) -> Result<bool, RunError> {
        let queue = self.shim_queues.get(&channel).ok_or(ConfigError::UnknownShimChannel(channel))?;
        Ok(queue.pending.is_empty() && !queue.active)
    }

    /// Descriptors completed on a shim channel.
    pub fn shim_completed(&self, channel: ChannelId) -> u64 {
        self.shim_queues.get(&channel).map(|q| q.completed).unwrap_or(0)
    }

    /// Times each guarded buffer was handed back empty, in guard order.
    pub fn guard_cycles(&self) -> &[u64] {
        &self.guard_cycles
    }

    /// Check `empty + full + holders == 1` for every guarded buffer.
    ///
    /// `held` lists every lock some engine has acquired and not yet
    /// signalled.
    pub fn check_invariants(&self, held: &[LockId]) -> Result<(), RunError> {
        let mut holders = vec![0u32; self.guard_cycles.len()];
        for lock in held {
            if let Some(&g) = self.guard_of.get(lock) {
                holders[g] += 1;
            }
        }

        for (guard, &holders) in self.topology.guards().iter().zip(&holders) {
            let empty = self.lock(guard.empty).map(|l| l.value).unwrap_or(0);
            let full = self.lock(guard.full).map(|l| l.value).unwrap_or(0);
            if empty as u32 + full as u32 + holders != 1 {
                return Err(RunError::InvariantViolation {
                    tile: guard.buffer.tile,
                    buffer: guard.name.clone(),
                    empty,
                    full,
                    holders,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::ChannelDirection;
    use crate::device::{MatrixShape, TilePacket};
    use crate::topology::{StepSpec, TopologyBuilder};

    const SHIM: TileCoord = TileCoord::new(0, 0);
    const MEM: TileCoord = TileCoord::new(0, 1);

    fn state() -> DeviceState {
        let mut b = TopologyBuilder::new();
        b.tile(SHIM).tile(MEM);
        b.lock(MEM, "empty", 1).lock(MEM, "full", 0);
        b.buffer(MEM, "buf", MatrixShape::new(2, 2));
        b.guard(MEM, "buf", "empty", "full");
        b.shim_channel(SHIM, ChannelDirection::MM2S, 0);
        b.shim_channel(SHIM, ChannelDirection::S2MM, 0);
        b.s2mm(MEM, 0, vec![StepSpec::new("buf").acquire("empty", 1).release("full", 1)]);
        b.mm2s(MEM, 0, vec![StepSpec::new("buf").acquire("full", 1).release("empty", 1)]);
        b.flow_mm2s_to_s2mm((SHIM, 0), (MEM, 0));
        b.flow_mm2s_to_s2mm((MEM, 0), (SHIM, 0));
        DeviceState::new(Arc::new(b.build().unwrap()))
    }

    #[test]
    fn test_locks_start_at_declared_values() {
        let state = state();
        assert_eq!(state.lock(LockId::new(MEM, 0)).unwrap().value, 1);
        assert_eq!(state.lock(LockId::new(MEM, 1)).unwrap().value, 0);
        assert_eq!(state.buffer(BufferId { tile: MEM, index: 0 }).unwrap(), &[0, 0, 0, 0]);
        state.check_invariants(&[]).unwrap();
    }

    #[test]
    fn test_handshake_keeps_invariant_and_counts_cycles() {
        let mut state = state();
        let empty = LockId::new(MEM, 0);
        let full = LockId::new(MEM, 1);

        // (operation, locks held afterwards)
        let steps: [(LockUse, &[LockId]); 4] = [
            (LockUse::new(empty, LockAction::AcquireGreaterEqual(1)), &[empty]),
            (LockUse::new(full, LockAction::Release(1)), &[]),
            (LockUse::new(full, LockAction::AcquireGreaterEqual(1)), &[full]),
            (LockUse::new(empty, LockAction::Release(1)), &[]),
        ];
        for (step, held) in steps {
            assert_eq!(state.apply_lock(step).unwrap(), LockResult::Success);
            state.check_invariants(held).unwrap();
        }
        assert_eq!(state.guard_cycles(), &[1]);
    }

    #[test]
    fn test_blocked_acquire_changes_nothing() {
        let mut state = state();
        let full = LockId::new(MEM, 1);
        let result = state.apply_lock(LockUse::new(full, LockAction::AcquireGreaterEqual(1))).unwrap();
        assert_eq!(result, LockResult::WouldBlock);
        state.check_invariants(&[]).unwrap();
    }

    #[test]
    fn test_stray_release_breaks_invariant() {
        let mut state = state();
        state.apply_lock(LockUse::new(LockId::new(MEM, 1), LockAction::Release(1))).unwrap();
        assert!(matches!(
            state.check_invariants(&[]),
            Err(RunError::InvariantViolation { empty: 1, full: 1, holders: 0, .. })
        ));
    }

    #[test]
    fn test_shim_queue_lifecycle() {
        let mut state = state();
        let ch = ChannelId::mm2s(SHIM, 0);
        let bd = ShimBd { ddr_id: 0, descriptor: BufferDescriptor::contiguous(4) };

        assert!(state.shim_channel_idle(ch).unwrap());
        state.push_shim_bd(ch, bd).unwrap();
        assert!(!state.shim_channel_idle(ch).unwrap());

        assert_eq!(state.take_shim_bd(ch), Some(bd));
        assert!(!state.shim_channel_idle(ch).unwrap(), "active descriptor keeps the channel busy");
        state.complete_shim_bd(ch);
        assert!(state.shim_channel_idle(ch).unwrap());
        assert_eq!(state.shim_completed(ch), 1);

        let tile_channel = ChannelId::mm2s(MEM, 0);
        assert!(state.push_shim_bd(tile_channel, bd).is_err());
    }

    #[test]
    fn test_flow_lookup_and_reset() {
        let mut state = state();
        state.outbound_flow(ChannelId::mm2s(SHIM, 0)).unwrap().push(TilePacket { data: vec![1; 4] }).unwrap();
        assert!(state.inbound_flow(ChannelId::s2mm(MEM, 0)).unwrap().is_full());
        assert!(state.inbound_flow(ChannelId::s2mm(MEM, 3)).is_err());

        state.reset();
        assert!(state.flows().iter().all(FlowQueue::is_empty));
    }
}
