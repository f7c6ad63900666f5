//! Buffer descriptors and quadrant placement.
//!
//! A descriptor expresses one rectangular, strided transfer over a linear
//! row-major buffer: `base_offset`, an outer (row) count and stride, and an
//! inner (element) count and stride, all in elements.
//!
//! For a `M x N` matrix split into `T x T` quadrants, quadrant `(r, c)`
//! starts at `r * (M/T) * N + c * (N/T)` and is read with
//! `outer = (M/T, N)`, `inner = (N/T, 1)`. For 16x16 into 8x8 this gives
//! offsets 0, 8, 128, 136.

use super::addressing::AddressGenerator;
use crate::device::MatrixShape;
use crate::error::ConfigError;

/// One strided 2D transfer. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    /// Element index of the first element.
    pub base_offset: usize,
    /// Number of rows.
    pub outer_count: usize,
    /// Elements between row starts.
    pub outer_stride: usize,
    /// Elements per row.
    pub inner_count: usize,
    /// Elements between consecutive elements of a row.
    pub inner_stride: usize,
}

impl BufferDescriptor {
    pub const fn new(
        base_offset: usize,
        outer_count: usize,
        outer_stride: usize,
        inner_count: usize,
        inner_stride: usize,
    ) -> Self {
        Self { base_offset, outer_count, outer_stride, inner_count, inner_stride }
    }

    /// Linear transfer of `len` elements from offset 0.
    pub const fn contiguous(len: usize) -> Self {
        Self::new(0, 1, len, len, 1)
    }

    /// Total elements moved.
    #[inline]
    pub fn element_count(&self) -> usize {
        self.outer_count * self.inner_count
    }

    /// Highest element index touched, or None for an empty descriptor.
    pub fn last_address(&self) -> Option<usize> {
        if self.outer_count == 0 || self.inner_count == 0 {
            return None;
        }
        Some(
            self.base_offset
                + (self.outer_count - 1) * self.outer_stride
                + (self.inner_count - 1) * self.inner_stride,
        )
    }

    /// Check the descriptor stays inside a backing buffer of `extent`
    /// elements and touches every addressed element exactly once.
    pub fn validate(&self, extent: usize) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDescriptor { descriptor: self.to_string(), reason };

        let last = self.last_address().ok_or_else(|| invalid("zero outer or inner count".to_string()))?;
        if last >= extent {
            return Err(invalid(format!("last element {} outside buffer of {} elements", last, extent)));
        }

        // Overlapping rows (or a zero stride) revisit elements and leave
        // others of the region untouched.
        let mut seen = vec![false; last + 1];
        for addr in self.addresses() {
            if std::mem::replace(&mut seen[addr], true) {
                return Err(invalid(format!("element {} addressed more than once", addr)));
            }
        }
        Ok(())
    }

    /// Iterate the addressed element indices in transfer order.
    pub fn addresses(&self) -> AddressGenerator {
        AddressGenerator::new(*self)
    }
}

impl std::fmt::Display for BufferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[off={} outer={}/{} inner={}/{}]",
            self.base_offset, self.outer_count, self.outer_stride, self.inner_count, self.inner_stride
        )
    }
}

/// Descriptor for a `rows x cols` sub-block of a row-major image of width
/// `row_stride`, starting at `quadrant_offset`.
///
/// The block must satisfy `offset + (rows-1)*row_stride + cols <= extent`;
/// that is checked by [`BufferDescriptor::validate`] once the backing
/// extent is known.
pub fn make_descriptor(quadrant_offset: usize, rows: usize, row_stride: usize, cols: usize) -> BufferDescriptor {
    BufferDescriptor::new(quadrant_offset, rows, row_stride, cols, 1)
}

/// A matrix split into equal tiles ("quadrants" for a 2x2 split).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadrantGrid {
    /// Full matrix shape.
    pub matrix: MatrixShape,
    /// Number of tile rows.
    pub tile_rows: usize,
    /// Number of tile columns.
    pub tile_cols: usize,
}

impl QuadrantGrid {
    /// Split `matrix` into `tile_rows x tile_cols` tiles.
    pub fn new(matrix: MatrixShape, tile_rows: usize, tile_cols: usize) -> Result<Self, ConfigError> {
        if tile_rows == 0
            || tile_cols == 0
            || matrix.rows % tile_rows != 0
            || matrix.cols % tile_cols != 0
        {
            return Err(ConfigError::UnevenPartition {
                rows: matrix.rows,
                cols: matrix.cols,
                tile_rows,
                tile_cols,
            });
        }
        Ok(Self { matrix, tile_rows, tile_cols })
    }

    /// Shape of one tile.
    #[inline]
    pub fn tile_shape(&self) -> MatrixShape {
        MatrixShape::new(self.matrix.rows / self.tile_rows, self.matrix.cols / self.tile_cols)
    }

    /// Number of tiles.
    #[inline]
    pub fn tile_count(&self) -> usize {
        self.tile_rows * self.tile_cols
    }

    /// Element offset of tile `(r, c)` in the full matrix.
    pub fn offset(&self, r: usize, c: usize) -> usize {
        let tile = self.tile_shape();
        r * tile.rows * self.matrix.cols + c * tile.cols
    }

    /// Descriptor that moves tile `(r, c)`.
    pub fn descriptor(&self, r: usize, c: usize) -> BufferDescriptor {
        let tile = self.tile_shape();
        make_descriptor(self.offset(r, c), tile.rows, self.matrix.cols, tile.cols)
    }

    /// One descriptor per tile in row-major tile order.
    pub fn descriptors(&self) -> Vec<BufferDescriptor> {
        (0..self.tile_rows)
            .flat_map(|r| (0..self.tile_cols).map(move |c| (r, c)))
            .map(|(r, c)| self.descriptor(r, c))
            .collect()
    }
}
