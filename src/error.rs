//! Error taxonomy.
//!
//! - [`ConfigError`]: malformed topology or descriptor program. Always
//!   raised while assembling, before anything executes.
//! - [`RunError`]: failures while driving an assembled pipeline. A
//!   [`RunError::DeadlockTimeout`] is fatal for the whole run; there is no
//!   partial-progress state to recover.
//! - [`DecodeError`]: malformed host instruction stream.

use thiserror::Error;

use crate::device::dma::ChannelId;
use crate::device::{LockId, TileCoord};

/// Configuration-time errors. Never silently corrected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Matrix dimensions are not divisible by the requested tile split.
    #[error("{rows}x{cols} matrix cannot be split into {tile_rows}x{tile_cols} equal tiles")]
    UnevenPartition { rows: usize, cols: usize, tile_rows: usize, tile_cols: usize },

    /// A descriptor addresses memory outside its backing buffer, or has
    /// a zero count.
    #[error("invalid descriptor {descriptor}: {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    /// A descriptor moves a different number of elements than the
    /// buffer tile it fills or drains.
    #[error("descriptor on {channel} moves {actual} elements, buffer '{buffer}' holds {expected}")]
    DescriptorSizeMismatch { channel: String, buffer: String, expected: usize, actual: usize },

    /// A tile coordinate was declared twice.
    #[error("tile {0} declared twice")]
    DuplicateTile(TileCoord),

    /// Reference to a tile that was never declared.
    #[error("unknown tile {0}")]
    UnknownTile(TileCoord),

    /// Two locks or two buffers share a purpose name on one tile.
    #[error("duplicate {kind} '{name}' on tile {tile}")]
    DuplicateName { tile: TileCoord, kind: &'static str, name: String },

    /// A program references a lock that does not exist on its tile.
    #[error("lock '{name}' does not exist on tile {tile}")]
    MissingLock { tile: TileCoord, name: String },

    /// A program references a buffer that does not exist on its tile.
    #[error("buffer '{name}' does not exist on tile {tile}")]
    MissingBuffer { tile: TileCoord, name: String },

    /// Buffers on a tile exceed its data memory.
    #[error("buffers on tile {tile} need {words} words, tile has {capacity}")]
    BufferTooLarge { tile: TileCoord, words: usize, capacity: usize },

    /// More buffers on a tile than buffer ids can address.
    #[error("tile {tile} has no free buffer ids ({capacity} available)")]
    BufferTableFull { tile: TileCoord, capacity: usize },

    /// Hardware lock table is full.
    #[error("tile {tile} has no free lock ids ({capacity} available)")]
    LockTableFull { tile: TileCoord, capacity: usize },

    /// Lock initial value exceeds the semaphore range.
    #[error("lock '{name}' on tile {tile}: initial value {init} out of range")]
    LockInitOutOfRange { tile: TileCoord, name: String, init: u8 },

    /// Two channels with the same direction and index on one tile.
    #[error("channel {0} declared twice")]
    DuplicateChannel(ChannelId),

    /// Channel index beyond what the tile kind provides.
    #[error("channel {channel} exceeds the {limit} channels of that direction on this tile")]
    ChannelOutOfRange { channel: ChannelId, limit: usize },

    /// A tile-resident channel has no steps.
    #[error("channel {0} has an empty program")]
    EmptyProgram(ChannelId),

    /// A shim channel was given a static program, or a tile channel was
    /// declared host-driven.
    #[error("channel {0}: host-queued programs are only valid on shim tiles")]
    ProgramKindMismatch(ChannelId),

    /// A flow references a channel that was never declared.
    #[error("flow endpoint {0} does not exist")]
    MissingFlowEndpoint(ChannelId),

    /// Flow endpoints point the wrong way.
    #[error("flow {src} -> {dest}: source must be MM2S and destination S2MM")]
    FlowDirection { src: ChannelId, dest: ChannelId },

    /// One channel endpoint appears in more than one flow.
    #[error("channel {0} is connected to more than one flow")]
    EndpointReused(ChannelId),

    /// A channel is not connected to any flow.
    #[error("channel {0} is not connected to any flow")]
    UnconnectedChannel(ChannelId),

    /// The two ends of a flow move tiles of different sizes.
    #[error("flow {src} -> {dest}: {src_len} elements sent, {dest_len} expected")]
    FlowSizeMismatch { src: ChannelId, dest: ChannelId, src_len: usize, dest_len: usize },

    /// A guarded buffer does not have exactly one empty-class (init 1)
    /// and one full-class (init 0) lock.
    #[error("buffer '{buffer}' on tile {tile}: {reason}")]
    GuardImbalance { tile: TileCoord, buffer: String, reason: String },

    /// A buffer touched by more than one program has no lock pair.
    #[error("buffer '{buffer}' on tile {tile} is shared by {users} programs but has no lock pair")]
    UnguardedBuffer { tile: TileCoord, buffer: String, users: usize },

    /// A program touches a guarded buffer without taking the matching side
    /// of its lock pair.
    #[error("{program} on buffer '{buffer}': {reason}")]
    GuardMisuse { program: String, buffer: String, reason: String },

    /// A lock is acquired by some program but released by none (or the
    /// reverse), or only the waiter itself ever releases it. The waiter
    /// could never be satisfied.
    #[error("unbalanced lock pair: {lock} ('{name}') is {reason}")]
    UnbalancedLockPair { lock: LockId, name: String, reason: &'static str },

    /// Compute core declared on a tile without a core.
    #[error("tile {0} has no compute core")]
    NotAComputeTile(TileCoord),

    /// Kernel operands and result differ in size.
    #[error("compute core on {tile}: {reason}")]
    KernelShapeMismatch { tile: TileCoord, reason: String },

    /// More than one core program on one tile.
    #[error("tile {0} already has a core program")]
    DuplicateCore(TileCoord),

    /// Compute core program with zero iterations.
    #[error("compute core on {0} has a zero iteration count")]
    ZeroIterations(TileCoord),

    /// Host program references a shim channel missing from the topology.
    #[error("host program queues on {0}, which is not a host-queued shim channel")]
    UnknownShimChannel(ChannelId),

    /// Host program references a host buffer index out of range.
    #[error("host program references ddr buffer {ddr_id}, only {available} mapped")]
    UnknownDdrBuffer { ddr_id: u32, available: usize },

    /// Host program queues a buffer descriptor id that was never written.
    #[error("host program pushes bd {bd_id} on column {column} before writing it")]
    UnwrittenBd { column: u8, bd_id: u32 },

    /// A field does not fit its slot in the instruction encoding.
    #[error("{field} = {value} does not fit in {bits} bits")]
    FieldOverflow { field: &'static str, value: u64, bits: u32 },
}

/// Instruction stream decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Stream ended inside an instruction.
    #[error("instruction at word {offset} needs {needed} words, {available} left")]
    Truncated { offset: usize, needed: usize, available: usize },

    /// Opcode byte not recognized.
    #[error("unknown opcode 0x{opcode:02X} at word {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    /// Queue register does not map to a shim DMA channel.
    #[error("register 0x{register:05X} at word {offset} is not a shim DMA queue")]
    UnknownRegister { register: u32, offset: usize },

    /// Byte stream is not a whole number of words.
    #[error("instruction stream length {0} is not a multiple of 4 bytes")]
    Unaligned(usize),
}

/// Errors while driving an assembled pipeline.
#[derive(Debug, Error)]
pub enum RunError {
    /// The host wait condition was not met within the bound.
    #[error("pipeline did not complete within {timeout_ms} ms ({rounds} scheduling rounds): {reason}")]
    DeadlockTimeout { timeout_ms: u128, rounds: u64, reason: String },

    /// Driver used before `load`/`map_buffers`/`run`.
    #[error("driver not ready: {0}")]
    NotReady(&'static str),

    /// Unknown buffer handle.
    #[error("unknown buffer handle {0}")]
    UnknownHandle(usize),

    /// Host data does not match the mapped shape.
    #[error("buffer {handle}: expected {expected} elements, got {actual}")]
    ShapeMismatch { handle: usize, expected: usize, actual: usize },

    /// Mapped buffers disagree with the binary's I/O signature.
    #[error("mapped buffers do not match the pipeline signature: {0}")]
    SignatureMismatch(String),

    /// A tile arriving on a flow does not match the receiving descriptor.
    #[error("{channel} received {actual} elements, descriptor expects {expected}")]
    LengthMismatch { channel: ChannelId, expected: usize, actual: usize },

    /// Buffer handshake invariant broken (empty + full + holders != 1).
    #[error("buffer '{buffer}' on tile {tile}: empty={empty} full={full} holders={holders}")]
    InvariantViolation { tile: TileCoord, buffer: String, empty: u8, full: u8, holders: u32 },

    /// Instruction stream could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The lowered binary is inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Top-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Run(#[from] RunError),
}

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;
