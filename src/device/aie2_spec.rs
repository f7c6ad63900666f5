//! AIE2 resource limits used when validating a pipeline topology.
//!
//! Values follow AM020 (AIE-ML Architecture Manual) and AM025 (register
//! reference). Only what the topology checks and the shim queue encoding
//! need is kept here.

// ============================================================================
// Locks (AM020 Ch2, Ch5)
// ============================================================================

/// Semaphore locks on a compute tile.
pub const COMPUTE_TILE_NUM_LOCKS: usize = 16;

/// Semaphore locks on a memory tile.
pub const MEM_TILE_NUM_LOCKS: usize = 64;

/// Semaphore locks on a shim tile.
pub const SHIM_TILE_NUM_LOCKS: usize = 16;

/// Lock state is a 6-bit unsigned counter.
pub const LOCK_STATE_BITS: usize = 6;

/// Largest value a lock counter can hold.
pub const LOCK_MAX_VALUE: u8 = (1 << LOCK_STATE_BITS) - 1;

// ============================================================================
// Data memory (AM020 Ch4, Ch5), in 32-bit elements
// ============================================================================

/// Compute tile data memory: 64 KB.
pub const COMPUTE_TILE_DATA_MEMORY_WORDS: usize = 64 * 1024 / 4;

/// Memory tile data memory: 512 KB.
pub const MEM_TILE_DATA_MEMORY_WORDS: usize = 512 * 1024 / 4;

// ============================================================================
// DMA channels (AM020 Ch2, Appendix A)
// ============================================================================

/// S2MM / MM2S channels per compute tile (each direction).
pub const COMPUTE_TILE_DMA_CHANNELS: usize = 2;

/// S2MM / MM2S channels per memory tile (each direction).
pub const MEM_TILE_DMA_CHANNELS: usize = 6;

/// S2MM / MM2S channels per shim tile (each direction).
pub const SHIM_TILE_DMA_CHANNELS: usize = 2;

/// Buffer descriptors available to the shim DMA.
pub const SHIM_NUM_BUFFER_DESCRIPTORS: usize = 16;

// ============================================================================
// Shim DMA task queue registers (AM025 noc_module/dma)
// ============================================================================

/// S2MM channel 0 start queue. Channel 1 follows at +0x8.
pub const SHIM_DMA_S2MM_QUEUE_CH0: u32 = 0x1D204;

/// MM2S channel 0 start queue. Channel 1 follows at +0x8.
pub const SHIM_DMA_MM2S_QUEUE_CH0: u32 = 0x1D214;

/// Distance between the queue registers of consecutive channels.
pub const SHIM_DMA_QUEUE_STRIDE: u32 = 0x8;
