//! Device-visible host (DDR) memory reached through shim DMAs.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Host buffers (ddr_id 0, 1, 2, ...)     │
//! │  inputs first, then outputs             │
//! └──────────────────┬──────────────────────┘
//!                    │ NoC
//!                    ▼
//!              ┌─────────┐
//!              │  Shim   │  Row 0
//!              └─────────┘
//! ```
//!
//! Buffers are addressed by `ddr_id` (the runtime argument index) and an
//! element offset, exactly as shim buffer descriptors address them.

use super::MatrixShape;

/// Direction of data flow for a host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// Host to NPU.
    Input,
    /// NPU to host.
    Output,
}

impl std::fmt::Display for DataDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataDirection::Input => write!(f, "input"),
            DataDirection::Output => write!(f, "output"),
        }
    }
}

/// One mapped host buffer.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    pub shape: MatrixShape,
    pub direction: DataDirection,
    pub data: Vec<i32>,
    /// Elements read by shim MM2S transfers.
    pub dma_reads: u64,
    /// Elements written by shim S2MM transfers.
    pub dma_writes: u64,
}

impl HostBuffer {
    pub fn new(shape: MatrixShape, direction: DataDirection) -> Self {
        Self { shape, direction, data: vec![0; shape.len()], dma_reads: 0, dma_writes: 0 }
    }
}

/// Host memory as seen by the device.
#[derive(Debug, Clone, Default)]
pub struct HostMemory {
    buffers: Vec<HostBuffer>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a buffer; returns its ddr id.
    pub fn allocate(&mut self, shape: MatrixShape, direction: DataDirection) -> usize {
        self.buffers.push(HostBuffer::new(shape, direction));
        log::debug!("Mapped ddr buffer {} ({}, {})", self.buffers.len() - 1, shape, direction);
        self.buffers.len() - 1
    }

    pub fn get(&self, ddr_id: usize) -> Option<&HostBuffer> {
        self.buffers.get(ddr_id)
    }

    pub fn get_mut(&mut self, ddr_id: usize) -> Option<&mut HostBuffer> {
        self.buffers.get_mut(ddr_id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostBuffer> {
        self.buffers.iter()
    }
}
