//! Pipeline topology: tiles, locks, buffers, channel programs, flows and
//! core programs assembled into one frozen configuration.
//!
//! Declarations refer to locks and buffers by purpose name. [`build`]
//! resolves every name, assigns per-tile lock ids in declaration order and
//! validates the whole configuration before anything runs:
//!
//! - every lock a program uses exists on that program's tile
//! - every flow joins an existing MM2S channel to an existing S2MM channel
//! - every guarded buffer has exactly one empty-class lock (init 1) and
//!   one full-class lock (init 0)
//! - every buffer touched by two or more programs is guarded, and every
//!   access to a guarded buffer takes one side of its pair and gives the
//!   other
//! - every acquired lock is released by some other program and every
//!   released lock is acquired by some program
//! - every descriptor stays inside its buffer and moves one whole tile
//!
//! [`build`]: TopologyBuilder::build
//!
//! # Example
//!
//! ```
//! use xdna_pipeline::device::{MatrixShape, TileCoord};
//! use xdna_pipeline::topology::{StepSpec, TopologyBuilder};
//!
//! let shim = TileCoord::new(0, 0);
//! let mem = TileCoord::new(0, 1);
//!
//! let mut b = TopologyBuilder::new();
//! b.tile(shim).tile(mem);
//! b.lock(mem, "empty", 1).lock(mem, "full", 0);
//! b.buffer(mem, "buf", MatrixShape::new(8, 8));
//! b.guard(mem, "buf", "empty", "full");
//! b.shim_channel(shim, xdna_pipeline::device::dma::ChannelDirection::MM2S, 0);
//! b.shim_channel(shim, xdna_pipeline::device::dma::ChannelDirection::S2MM, 0);
//! b.s2mm(mem, 0, vec![StepSpec::new("buf").acquire("empty", 1).release("full", 1)]);
//! b.mm2s(mem, 0, vec![StepSpec::new("buf").acquire("full", 1).release("empty", 1)]);
//! b.flow_mm2s_to_s2mm((shim, 0), (mem, 0));
//! b.flow_mm2s_to_s2mm((mem, 0), (shim, 0));
//!
//! let topology = b.build().unwrap();
//! assert_eq!(topology.flows().len(), 2);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::device::dma::{BufferDescriptor, ChannelDirection, ChannelId, ChannelProgram, DmaChannel, DmaStep};
use crate::device::lock::LockDecl;
use crate::device::{
    Buffer, BufferId, ElementType, FlowRoute, LockAction, LockId, LockTable, LockUse, MatrixShape, TileCoord,
    TileKind,
};
use crate::emu::core::{ComputeCoreProgram, ElementwiseKernel};
use crate::error::ConfigError;

/// Name-level lock operation, resolved at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRef {
    pub name: String,
    pub action: LockAction,
}

impl LockRef {
    fn new(name: &str, action: LockAction) -> Self {
        Self { name: name.to_string(), action }
    }
}

/// Declaration of one channel step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub buffer: String,
    /// Region moved; defaults to the whole buffer.
    pub descriptor: Option<BufferDescriptor>,
    pub acquire: Option<LockRef>,
    pub release: Option<LockRef>,
}

impl StepSpec {
    /// Step moving the whole of `buffer` with no locks.
    pub fn new(buffer: &str) -> Self {
        Self { buffer: buffer.to_string(), descriptor: None, acquire: None, release: None }
    }

    /// Use an explicit descriptor instead of the whole buffer.
    pub fn descriptor(mut self, descriptor: BufferDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Acquire `lock` with `AcquireGreaterEqual(n)` before the transfer.
    pub fn acquire(mut self, lock: &str, n: u8) -> Self {
        self.acquire = Some(LockRef::new(lock, LockAction::AcquireGreaterEqual(n)));
        self
    }

    /// Acquire `lock` with an exact acquire before the transfer.
    pub fn acquire_exact(mut self, lock: &str) -> Self {
        self.acquire = Some(LockRef::new(lock, LockAction::Acquire));
        self
    }

    /// Release `lock` by `n` after the transfer.
    pub fn release(mut self, lock: &str, n: u8) -> Self {
        self.release = Some(LockRef::new(lock, LockAction::Release(n)));
        self
    }
}

/// Declaration of a compute core program.
#[derive(Debug, Clone)]
pub struct CoreSpec {
    pub tile: TileCoord,
    pub acquires: Vec<LockRef>,
    pub inputs: [String; 2],
    pub output: String,
    pub releases: Vec<LockRef>,
    pub iterations: u32,
    pub kernel: Arc<dyn ElementwiseKernel>,
}

impl CoreSpec {
    pub fn new(tile: TileCoord, kernel: Arc<dyn ElementwiseKernel>) -> Self {
        Self {
            tile,
            acquires: Vec::new(),
            inputs: [String::new(), String::new()],
            output: String::new(),
            releases: Vec::new(),
            iterations: 1,
            kernel,
        }
    }

    /// Add a lock to the joint wait (`AcquireGreaterEqual(n)`).
    pub fn acquire(mut self, lock: &str, n: u8) -> Self {
        self.acquires.push(LockRef::new(lock, LockAction::AcquireGreaterEqual(n)));
        self
    }

    /// Kernel operands.
    pub fn inputs(mut self, a: &str, b: &str) -> Self {
        self.inputs = [a.to_string(), b.to_string()];
        self
    }

    /// Kernel result buffer.
    pub fn output(mut self, c: &str) -> Self {
        self.output = c.to_string();
        self
    }

    /// Release `lock` by `n` after computing.
    pub fn release(mut self, lock: &str, n: u8) -> Self {
        self.releases.push(LockRef::new(lock, LockAction::Release(n)));
        self
    }

    /// Number of tiles processed before the core halts.
    pub fn iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }
}

#[derive(Debug, Clone)]
struct GuardSpec {
    tile: TileCoord,
    buffer: String,
    empty: String,
    full: String,
}

#[derive(Debug, Clone)]
enum ProgramSpec {
    Looping(Vec<StepSpec>),
    HostQueued,
}

/// Collects declarations; nothing is checked until [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    tiles: Vec<TileCoord>,
    locks: Vec<(TileCoord, String, u8)>,
    buffers: Vec<(TileCoord, String, MatrixShape)>,
    guards: Vec<GuardSpec>,
    channels: Vec<(ChannelId, ProgramSpec)>,
    flows: Vec<(ChannelId, ChannelId)>,
    cores: Vec<CoreSpec>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a tile. Its kind follows from the row.
    pub fn tile(&mut self, coord: TileCoord) -> &mut Self {
        self.tiles.push(coord);
        self
    }

    /// Declare a lock with a purpose name and initial value.
    pub fn lock(&mut self, tile: TileCoord, name: &str, init: u8) -> &mut Self {
        self.locks.push((tile, name.to_string(), init));
        self
    }

    /// Declare an `i32` buffer.
    pub fn buffer(&mut self, tile: TileCoord, name: &str, shape: MatrixShape) -> &mut Self {
        self.buffers.push((tile, name.to_string(), shape));
        self
    }

    /// Pair a buffer with its empty-class and full-class locks.
    pub fn guard(&mut self, tile: TileCoord, buffer: &str, empty: &str, full: &str) -> &mut Self {
        self.guards.push(GuardSpec {
            tile,
            buffer: buffer.to_string(),
            empty: empty.to_string(),
            full: full.to_string(),
        });
        self
    }

    /// Declare an inbound channel with a looping program.
    pub fn s2mm(&mut self, tile: TileCoord, index: u8, steps: Vec<StepSpec>) -> &mut Self {
        self.channels.push((ChannelId::s2mm(tile, index), ProgramSpec::Looping(steps)));
        self
    }

    /// Declare an outbound channel with a looping program.
    pub fn mm2s(&mut self, tile: TileCoord, index: u8, steps: Vec<StepSpec>) -> &mut Self {
        self.channels.push((ChannelId::mm2s(tile, index), ProgramSpec::Looping(steps)));
        self
    }

    /// Declare a shim channel driven by host-queued descriptors.
    pub fn shim_channel(&mut self, tile: TileCoord, direction: ChannelDirection, index: u8) -> &mut Self {
        self.channels.push((ChannelId::new(tile, direction, index), ProgramSpec::HostQueued));
        self
    }

    /// Connect two channel endpoints.
    pub fn flow(&mut self, source: ChannelId, dest: ChannelId) -> &mut Self {
        self.flows.push((source, dest));
        self
    }

    /// Connect `(tile, MM2S index)` to `(tile, S2MM index)`.
    pub fn flow_mm2s_to_s2mm(&mut self, source: (TileCoord, u8), dest: (TileCoord, u8)) -> &mut Self {
        self.flow(ChannelId::mm2s(source.0, source.1), ChannelId::s2mm(dest.0, dest.1))
    }

    /// Attach a core program to a compute tile.
    pub fn core(&mut self, spec: CoreSpec) -> &mut Self {
        self.cores.push(spec);
        self
    }

    /// Resolve and validate everything, producing a frozen topology.
    pub fn build(&self) -> Result<PipelineTopology, ConfigError> {
        let mut tiles: BTreeMap<TileCoord, TileConfig> = BTreeMap::new();
        for &coord in &self.tiles {
            if tiles.contains_key(&coord) {
                return Err(ConfigError::DuplicateTile(coord));
            }
            tiles.insert(coord, TileConfig::new(coord));
        }

        for (tile, name, init) in &self.locks {
            let config = tiles.get_mut(tile).ok_or(ConfigError::UnknownTile(*tile))?;
            config.locks.declare(name, *init)?;
        }

        for (tile, name, shape) in &self.buffers {
            let config = tiles.get_mut(tile).ok_or(ConfigError::UnknownTile(*tile))?;
            config.add_buffer(name, *shape)?;
        }
        for config in tiles.values() {
            let words: usize = config.buffers.iter().map(Buffer::len).sum();
            let capacity = config.kind.data_memory_words();
            if words > capacity {
                return Err(ConfigError::BufferTooLarge { tile: config.coord, words, capacity });
            }
        }

        let guards = self.resolve_guards(&tiles)?;
        let channels = self.resolve_channels(&tiles)?;
        let flows = self.resolve_flows(&channels)?;
        let cores = self.resolve_cores(&tiles)?;

        let topology = PipelineTopology { tiles, guards, channels, flows, cores };
        topology.check_lock_balance()?;
        topology.check_buffer_access()?;

        log::debug!(
            "Topology built: {} tiles, {} guards, {} channels, {} flows, {} cores",
            topology.tiles.len(),
            topology.guards.len(),
            topology.channels.len(),
            topology.flows.len(),
            topology.cores.len()
        );

        Ok(topology)
    }

    fn resolve_guards(&self, tiles: &BTreeMap<TileCoord, TileConfig>) -> Result<Vec<BufferGuard>, ConfigError> {
        let mut guards: Vec<BufferGuard> = Vec::new();

        for spec in &self.guards {
            let config = tiles.get(&spec.tile).ok_or(ConfigError::UnknownTile(spec.tile))?;
            let buffer = config.resolve_buffer(&spec.buffer)?;
            let empty = config.locks.resolve(&spec.empty)?;
            let full = config.locks.resolve(&spec.full)?;

            let imbalance = |reason: String| ConfigError::GuardImbalance {
                tile: spec.tile,
                buffer: spec.buffer.clone(),
                reason,
            };

            if empty == full {
                return Err(imbalance("empty and full are the same lock".to_string()));
            }
            let empty_init = config.lock_init(empty);
            let full_init = config.lock_init(full);
            if empty_init != 1 {
                return Err(imbalance(format!("empty lock '{}' starts at {}, expected 1", spec.empty, empty_init)));
            }
            if full_init != 0 {
                return Err(imbalance(format!("full lock '{}' starts at {}, expected 0", spec.full, full_init)));
            }
            if guards.iter().any(|g| g.buffer == buffer.id) {
                return Err(imbalance("buffer is guarded more than once".to_string()));
            }
            if let Some(other) = guards.iter().find(|g| [g.empty, g.full].iter().any(|l| *l == empty || *l == full)) {
                return Err(imbalance(format!("shares a lock with buffer '{}'", other.name)));
            }

            guards.push(BufferGuard { buffer: buffer.id, name: spec.buffer.clone(), empty, full });
        }

        Ok(guards)
    }

    fn resolve_channels(
        &self,
        tiles: &BTreeMap<TileCoord, TileConfig>,
    ) -> Result<BTreeMap<ChannelId, DmaChannel>, ConfigError> {
        let mut channels = BTreeMap::new();

        for (id, spec) in &self.channels {
            let config = tiles.get(&id.tile).ok_or(ConfigError::UnknownTile(id.tile))?;

            let limit = config.kind.dma_channels();
            if id.index as usize >= limit {
                return Err(ConfigError::ChannelOutOfRange { channel: *id, limit });
            }
            if channels.contains_key(id) {
                return Err(ConfigError::DuplicateChannel(*id));
            }

            let program = match spec {
                ProgramSpec::HostQueued if config.kind.is_shim() => ChannelProgram::HostQueued,
                ProgramSpec::Looping(steps) if !config.kind.is_shim() => {
                    if steps.is_empty() {
                        return Err(ConfigError::EmptyProgram(*id));
                    }
                    let steps = steps
                        .iter()
                        .map(|step| config.resolve_step(*id, step))
                        .collect::<Result<Vec<_>, _>>()?;
                    ChannelProgram::Looping(steps)
                }
                _ => return Err(ConfigError::ProgramKindMismatch(*id)),
            };

            channels.insert(*id, DmaChannel { id: *id, program });
        }

        Ok(channels)
    }

    fn resolve_flows(&self, channels: &BTreeMap<ChannelId, DmaChannel>) -> Result<Vec<FlowRoute>, ConfigError> {
        let mut used: BTreeSet<ChannelId> = BTreeSet::new();
        let mut flows = Vec::new();

        for &(source, dest) in &self.flows {
            let src_channel = channels.get(&source).ok_or(ConfigError::MissingFlowEndpoint(source))?;
            let dest_channel = channels.get(&dest).ok_or(ConfigError::MissingFlowEndpoint(dest))?;

            if source.direction != ChannelDirection::MM2S || dest.direction != ChannelDirection::S2MM {
                return Err(ConfigError::FlowDirection { src: source, dest });
            }
            for endpoint in [source, dest] {
                if !used.insert(endpoint) {
                    return Err(ConfigError::EndpointReused(endpoint));
                }
            }

            let src_lens = src_channel.step_lengths();
            let dest_lens = dest_channel.step_lengths();
            if let (Some(&src_len), Some(&dest_len)) = (src_lens.first(), dest_lens.first()) {
                let mismatch = src_lens.iter().chain(&dest_lens).find(|&&len| len != src_len);
                if src_len != dest_len || mismatch.is_some() {
                    return Err(ConfigError::FlowSizeMismatch { src: source, dest, src_len, dest_len });
                }
            }

            flows.push(FlowRoute::new(source, dest));
        }

        if let Some(id) = channels.keys().find(|id| !used.contains(id)) {
            return Err(ConfigError::UnconnectedChannel(*id));
        }

        Ok(flows)
    }

    fn resolve_cores(&self, tiles: &BTreeMap<TileCoord, TileConfig>) -> Result<Vec<ComputeCoreProgram>, ConfigError> {
        let mut cores: Vec<ComputeCoreProgram> = Vec::new();

        for spec in &self.cores {
            let config = tiles.get(&spec.tile).ok_or(ConfigError::UnknownTile(spec.tile))?;
            if !config.kind.is_compute() {
                return Err(ConfigError::NotAComputeTile(spec.tile));
            }
            if cores.iter().any(|c| c.tile == spec.tile) {
                return Err(ConfigError::DuplicateCore(spec.tile));
            }
            if spec.iterations == 0 {
                return Err(ConfigError::ZeroIterations(spec.tile));
            }

            let resolve_uses = |refs: &[LockRef]| -> Result<SmallVec<[LockUse; 4]>, ConfigError> {
                refs.iter()
                    .map(|r| config.locks.resolve(&r.name).map(|lock| LockUse::new(lock, r.action)))
                    .collect()
            };

            let a = config.resolve_buffer(&spec.inputs[0])?;
            let b = config.resolve_buffer(&spec.inputs[1])?;
            let c = config.resolve_buffer(&spec.output)?;
            if a.len() != c.len() || b.len() != c.len() {
                return Err(ConfigError::KernelShapeMismatch {
                    tile: spec.tile,
                    reason: format!(
                        "operands have {} and {} elements, result has {}",
                        a.len(),
                        b.len(),
                        c.len()
                    ),
                });
            }

            cores.push(ComputeCoreProgram {
                tile: spec.tile,
                acquires: resolve_uses(&spec.acquires)?,
                inputs: [a.id, b.id],
                output: c.id,
                releases: resolve_uses(&spec.releases)?,
                iterations: spec.iterations,
                kernel: Arc::clone(&spec.kernel),
            });
        }

        Ok(cores)
    }
}

/// Resolved configuration of one tile.
#[derive(Debug, Clone)]
pub struct TileConfig {
    pub coord: TileCoord,
    pub kind: TileKind,
    pub locks: LockTable,
    pub buffers: Vec<Buffer>,
}

impl TileConfig {
    fn new(coord: TileCoord) -> Self {
        let kind = coord.kind();
        Self { coord, kind, locks: LockTable::new(coord, kind.num_locks()), buffers: Vec::new() }
    }

    fn add_buffer(&mut self, name: &str, shape: MatrixShape) -> Result<BufferId, ConfigError> {
        if self.buffers.iter().any(|b| b.name == name) {
            return Err(ConfigError::DuplicateName { tile: self.coord, kind: "buffer", name: name.to_string() });
        }
        let index = u8::try_from(self.buffers.len())
            .map_err(|_| ConfigError::BufferTableFull { tile: self.coord, capacity: u8::MAX as usize + 1 })?;
        let id = BufferId { tile: self.coord, index };
        self.buffers.push(Buffer { id, name: name.to_string(), shape, element_type: ElementType::I32 });
        Ok(id)
    }

    /// Look up a buffer by purpose name.
    pub fn buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.name == name)
    }

    fn resolve_buffer(&self, name: &str) -> Result<&Buffer, ConfigError> {
        self.buffer(name)
            .ok_or_else(|| ConfigError::MissingBuffer { tile: self.coord, name: name.to_string() })
    }

    fn lock_init(&self, id: LockId) -> u8 {
        self.locks.decl(id).map(|d| d.init).unwrap_or(0)
    }

    fn resolve_step(&self, channel: ChannelId, step: &StepSpec) -> Result<DmaStep, ConfigError> {
        let buffer = self.resolve_buffer(&step.buffer)?;
        let descriptor = step.descriptor.unwrap_or_else(|| BufferDescriptor::contiguous(buffer.len()));
        descriptor.validate(buffer.len())?;
        if descriptor.element_count() != buffer.len() {
            return Err(ConfigError::DescriptorSizeMismatch {
                channel: channel.to_string(),
                buffer: buffer.name.clone(),
                expected: buffer.len(),
                actual: descriptor.element_count(),
            });
        }

        let resolve = |r: &Option<LockRef>| -> Result<Option<LockUse>, ConfigError> {
            r.as_ref()
                .map(|r| self.locks.resolve(&r.name).map(|lock| LockUse::new(lock, r.action)))
                .transpose()
        };

        Ok(DmaStep {
            acquire: resolve(&step.acquire)?,
            buffer: buffer.id,
            descriptor,
            release: resolve(&step.release)?,
        })
    }
}

/// A buffer shared between a producer and a consumer, with its lock pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferGuard {
    pub buffer: BufferId,
    pub name: String,
    /// "Ready to fill" (initial value 1).
    pub empty: LockId,
    /// "Ready to drain" (initial value 0).
    pub full: LockId,
}

/// Frozen pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineTopology {
    tiles: BTreeMap<TileCoord, TileConfig>,
    guards: Vec<BufferGuard>,
    channels: BTreeMap<ChannelId, DmaChannel>,
    flows: Vec<FlowRoute>,
    cores: Vec<ComputeCoreProgram>,
}

impl PipelineTopology {
    pub fn tiles(&self) -> impl Iterator<Item = &TileConfig> {
        self.tiles.values()
    }

    pub fn tile(&self, coord: TileCoord) -> Option<&TileConfig> {
        self.tiles.get(&coord)
    }

    pub fn guards(&self) -> &[BufferGuard] {
        &self.guards
    }

    pub fn channels(&self) -> impl Iterator<Item = &DmaChannel> {
        self.channels.values()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&DmaChannel> {
        self.channels.get(&id)
    }

    pub fn flows(&self) -> &[FlowRoute] {
        &self.flows
    }

    pub fn cores(&self) -> &[ComputeCoreProgram] {
        &self.cores
    }

    /// The channel at the other end of `id`'s flow.
    pub fn flow_peer(&self, id: ChannelId) -> Option<&DmaChannel> {
        let peer = self.flows.iter().find_map(|f| {
            if f.source == id {
                Some(f.dest)
            } else if f.dest == id {
                Some(f.source)
            } else {
                None
            }
        })?;
        self.channels.get(&peer)
    }

    fn guard_for(&self, buffer: BufferId) -> Option<&BufferGuard> {
        self.guards.iter().find(|g| g.buffer == buffer)
    }

    fn lock_name(&self, id: LockId) -> String {
        self.lock_decl(id).map(|d| d.name.clone()).unwrap_or_default()
    }

    /// Lock id for a purpose name on a tile.
    pub fn lock_id(&self, tile: TileCoord, name: &str) -> Option<LockId> {
        self.tiles.get(&tile)?.locks.get(name)
    }

    /// Declaration behind a lock id.
    pub fn lock_decl(&self, id: LockId) -> Option<&LockDecl> {
        self.tiles.get(&id.tile)?.locks.decl(id)
    }

    /// Buffer behind a buffer id.
    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.tiles.get(&id.tile)?.buffers.get(id.index as usize)
    }

    /// Every lock use of every channel step and core program, with the
    /// program it belongs to.
    fn lock_uses(&self) -> impl Iterator<Item = (Program, LockUse)> + '_ {
        let channel_uses = self.channels.values().flat_map(|ch| match &ch.program {
            ChannelProgram::Looping(steps) => steps
                .iter()
                .flat_map(|s| s.acquire.into_iter().chain(s.release))
                .map(|u| (Program::Channel(ch.id), u))
                .collect::<Vec<_>>(),
            ChannelProgram::HostQueued => Vec::new(),
        });
        let core_uses = self
            .cores
            .iter()
            .flat_map(|c| c.acquires.iter().chain(c.releases.iter()).map(move |&u| (Program::Core(c.tile), u)));
        channel_uses.chain(core_uses)
    }

    /// Every acquired lock must be released by a program other than its
    /// waiter, and every released lock must have an acquirer. A waiter on
    /// a lock only it releases can never proceed.
    fn check_lock_balance(&self) -> Result<(), ConfigError> {
        let mut acquirers: BTreeMap<LockId, BTreeSet<Program>> = BTreeMap::new();
        let mut releasers: BTreeMap<LockId, BTreeSet<Program>> = BTreeMap::new();
        for (program, lock_use) in self.lock_uses() {
            let side = if lock_use.action.is_acquire() { &mut acquirers } else { &mut releasers };
            side.entry(lock_use.lock).or_default().insert(program);
        }

        let unbalanced =
            |lock: LockId, reason: &'static str| ConfigError::UnbalancedLockPair { lock, name: self.lock_name(lock), reason };

        for (&lock, waiters) in &acquirers {
            let Some(givers) = releasers.get(&lock) else {
                return Err(unbalanced(lock, "acquired but never released by any program"));
            };
            if waiters.iter().any(|w| givers.iter().all(|g| g == w)) {
                return Err(unbalanced(lock, "released only by the program that waits on it"));
            }
        }
        if let Some(&lock) = releasers.keys().find(|lock| !acquirers.contains_key(lock)) {
            return Err(unbalanced(lock, "released but never acquired by any program"));
        }
        Ok(())
    }

    /// Shared buffers must be guarded, and every access to a guarded
    /// buffer must acquire one lock of its pair and release the other,
    /// once per access.
    fn check_buffer_access(&self) -> Result<(), ConfigError> {
        let mut users: BTreeMap<BufferId, BTreeSet<Program>> = BTreeMap::new();
        let buffer_name = |id: BufferId| self.buffer(id).map(|b| b.name.clone()).unwrap_or_default();

        for channel in self.channels.values() {
            let ChannelProgram::Looping(steps) = &channel.program else { continue };
            let program = Program::Channel(channel.id);
            for step in steps {
                users.entry(step.buffer).or_default().insert(program);
                let Some(guard) = self.guard_for(step.buffer) else { continue };

                let acquired = step.acquire.map(|u| u.lock);
                let released = step.release.map(|u| u.lock);
                let fills = acquired == Some(guard.empty) && released == Some(guard.full);
                let drains = acquired == Some(guard.full) && released == Some(guard.empty);
                let single = step.acquire.into_iter().chain(step.release).all(|u| u.action.amount() == 1);
                if !(fills || drains) || !single {
                    return Err(ConfigError::GuardMisuse {
                        program: program.to_string(),
                        buffer: guard.name.clone(),
                        reason: format!(
                            "step must take one of '{}'/'{}' by 1 and give the other by 1",
                            self.lock_name(guard.empty),
                            self.lock_name(guard.full)
                        ),
                    });
                }
            }
        }

        for core in &self.cores {
            let program = Program::Core(core.tile);
            let takes = |lock: LockId| core.acquires.iter().any(|u| u.lock == lock && u.action.amount() == 1);
            let gives = |lock: LockId| core.releases.iter().any(|u| u.lock == lock && u.action.amount() == 1);

            let accesses = [(core.inputs[0], true), (core.inputs[1], true), (core.output, false)];
            for (buffer, reads) in accesses {
                users.entry(buffer).or_default().insert(program);
                let Some(guard) = self.guard_for(buffer) else { continue };

                let (wait, give) = if reads { (guard.full, guard.empty) } else { (guard.empty, guard.full) };
                if !takes(wait) || !gives(give) {
                    return Err(ConfigError::GuardMisuse {
                        program: program.to_string(),
                        buffer: guard.name.clone(),
                        reason: format!(
                            "core must acquire '{}' by 1 and release '{}' by 1",
                            self.lock_name(wait),
                            self.lock_name(give)
                        ),
                    });
                }
            }
        }

        for (&buffer, programs) in &users {
            if programs.len() > 1 && self.guard_for(buffer).is_none() {
                return Err(ConfigError::UnguardedBuffer {
                    tile: buffer.tile,
                    buffer: buffer_name(buffer),
                    users: programs.len(),
                });
            }
        }
        Ok(())
    }
}

/// A program that touches locks and buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Program {
    Channel(ChannelId),
    Core(TileCoord),
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Program::Channel(id) => write!(f, "channel {}", id),
            Program::Core(tile) => write!(f, "core {}", tile),
        }
    }
}
