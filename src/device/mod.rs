//! Static description of the tile array used by a pipeline.
//!
//! This module provides:
//! - Tile coordinates and kinds (shim, memory tile, compute tile)
//! - Matrix shapes and per-tile buffers
//! - Semaphore locks and per-tile lock tables
//! - DMA channel programs and buffer descriptors
//! - Flow routes between DMA channels
//! - Runtime state of the emulated device (lock values, buffer memory,
//!   host memory, in-flight tiles)
//!
//! # Architecture Overview
//!
//! The pipeline lives in a single column:
//!
//! ```text
//!   +---------+
//! 2 | Compute |  core + A, B, C tile buffers
//!   +---------+
//! 1 | MemTile |  re-buffers A, B (down) and C (up)
//!   +---------+
//! 0 |  Shim   |  DDR interface, driven by host descriptors
//!   +---------+
//! ```

pub mod aie2_spec;
pub mod lock;
pub mod flow;
pub mod dma;
pub mod host_memory;
pub mod state;

pub use lock::{Lock, LockAction, LockId, LockResult, LockTable, LockUse};
pub use flow::{FlowQueue, FlowRoute, TilePacket};
pub use host_memory::{DataDirection, HostBuffer, HostMemory};
pub use state::{DeviceState, ShimBd};

use crate::error::ConfigError;

/// Tile coordinate (column, row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub col: u8,
    pub row: u8,
}

impl TileCoord {
    /// Create a new tile coordinate.
    #[inline]
    pub const fn new(col: u8, row: u8) -> Self {
        Self { col, row }
    }

    /// Kind of tile found at this coordinate on an AIE2 array.
    pub fn kind(self) -> TileKind {
        match self.row {
            0 => TileKind::Shim,
            1 => TileKind::MemTile,
            _ => TileKind::Compute,
        }
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.col, self.row)
    }
}

/// Tile kind determines available resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileKind {
    /// Row 0: interface to host memory.
    Shim,
    /// Row 1: large memory, no core.
    MemTile,
    /// Rows 2+: core plus local memory.
    Compute,
}

impl TileKind {
    /// Number of hardware locks.
    pub fn num_locks(self) -> usize {
        match self {
            TileKind::Shim => aie2_spec::SHIM_TILE_NUM_LOCKS,
            TileKind::MemTile => aie2_spec::MEM_TILE_NUM_LOCKS,
            TileKind::Compute => aie2_spec::COMPUTE_TILE_NUM_LOCKS,
        }
    }

    /// Number of DMA channels per direction.
    pub fn dma_channels(self) -> usize {
        match self {
            TileKind::Shim => aie2_spec::SHIM_TILE_DMA_CHANNELS,
            TileKind::MemTile => aie2_spec::MEM_TILE_DMA_CHANNELS,
            TileKind::Compute => aie2_spec::COMPUTE_TILE_DMA_CHANNELS,
        }
    }

    /// Local data memory in 32-bit elements. Shim tiles have none.
    pub fn data_memory_words(self) -> usize {
        match self {
            TileKind::Shim => 0,
            TileKind::MemTile => aie2_spec::MEM_TILE_DATA_MEMORY_WORDS,
            TileKind::Compute => aie2_spec::COMPUTE_TILE_DATA_MEMORY_WORDS,
        }
    }

    /// Whether the tile has a core.
    #[inline]
    pub fn is_compute(self) -> bool {
        self == TileKind::Compute
    }

    /// Whether the tile is the host boundary.
    #[inline]
    pub fn is_shim(self) -> bool {
        self == TileKind::Shim
    }
}

/// Element type of a buffer or matrix. The device DMAs move any of these;
/// tile buffers in this pipeline are always `I32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementType {
    I8,
    I16,
    #[default]
    I32,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            ElementType::I8 => 1,
            ElementType::I16 => 2,
            ElementType::I32 => 4,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementType::I8 => write!(f, "i8"),
            ElementType::I16 => write!(f, "i16"),
            ElementType::I32 => write!(f, "i32"),
        }
    }
}

/// Row-major 2D shape in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixShape {
    pub rows: usize,
    pub cols: usize,
}

impl MatrixShape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Total element count.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into `tile_rows x tile_cols` equal tiles.
    pub fn partition(self, tile_rows: usize, tile_cols: usize) -> Result<dma::QuadrantGrid, ConfigError> {
        dma::QuadrantGrid::new(self, tile_rows, tile_cols)
    }
}

impl std::fmt::Display for MatrixShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Identifier of a buffer: owning tile plus its index in that tile's
/// buffer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    pub tile: TileCoord,
    pub index: u8,
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer[{}:{}]", self.tile, self.index)
    }
}

/// A tile-local buffer. Exactly one instance exists per declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub id: BufferId,
    /// Purpose name, unique per tile.
    pub name: String,
    pub shape: MatrixShape,
    pub element_type: ElementType,
}

impl Buffer {
    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }
}

/// A row-major `i32` matrix held by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    pub shape: MatrixShape,
    pub data: Vec<i32>,
}

impl Matrix {
    /// All-zero matrix.
    pub fn zeros(shape: MatrixShape) -> Self {
        Self { shape, data: vec![0; shape.len()] }
    }

    /// Build from a function of (row, col).
    pub fn from_fn(shape: MatrixShape, mut f: impl FnMut(usize, usize) -> i32) -> Self {
        let mut data = Vec::with_capacity(shape.len());
        for r in 0..shape.rows {
            for c in 0..shape.cols {
                data.push(f(r, c));
            }
        }
        Self { shape, data }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.data[row * self.shape.cols + col]
    }

    /// Print the matrix one row per line.
    pub fn print(&self) {
        for row in self.data.chunks(self.shape.cols) {
            let line: Vec<String> = row.iter().map(|v| format!("{:3}", v)).collect();
            println!("[{}]", line.join(" "));
        }
    }
}
