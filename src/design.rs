//! The two-input elementwise pipeline.
//!
//! One column, three tiles:
//!
//! ```text
//!   host A ─► shim MM2S0 ─► mem S2MM0 [a] mem MM2S0 ─► comp S2MM0 [a] ┐
//!   host B ─► shim MM2S1 ─► mem S2MM1 [b] mem MM2S1 ─► comp S2MM1 [b] ├─ core: c = a + b
//!   host C ◄─ shim S2MM0 ◄─ mem MM2S2 [c] mem S2MM2 ◄─ comp MM2S0 [c] ┘
//! ```
//!
//! Each input matrix is split into quadrants; the host queues one shim
//! descriptor per quadrant and the tiles move one quadrant at a time.
//! Every buffer is guarded by an empty/full lock pair:
//!
//! | tile    | buffer | empty (init 1) | full (init 0) |
//! |---------|--------|----------------|---------------|
//! | mem     | a/b/c  | `read_in_x`    | `write_out_x` |
//! | compute | a/b    | `read_in_x`    | `use_x`       |
//! | compute | c      | `use_c`        | `write_out_c` |

use std::sync::Arc;

use crate::device::dma::{ChannelDirection, ChannelId, QuadrantGrid};
use crate::device::{ElementType, Matrix, MatrixShape, TileCoord};
use crate::emu::{AddKernel, ElementwiseKernel};
use crate::error::ConfigError;
use crate::host::{IoSignature, Lowering, PipelineBinary};
use crate::npu::{HostProgram, NpuInstruction};
use crate::topology::{CoreSpec, PipelineTopology, StepSpec, TopologyBuilder};

/// Host buffer ids, in mapping order.
const DDR_A: u8 = 0;
const DDR_B: u8 = 1;
const DDR_C: u8 = 2;

/// Elementwise binary op over two matrices, tiled through one column.
#[derive(Debug, Clone)]
pub struct ElementwiseDesign {
    /// Shape of A, B and C.
    pub matrix: MatrixShape,
    /// Tile split `(rows, cols)`.
    pub split: (usize, usize),
    /// Array column.
    pub column: u8,
    pub kernel: Arc<dyn ElementwiseKernel>,
}

impl Default for ElementwiseDesign {
    fn default() -> Self {
        Self { matrix: MatrixShape::new(16, 16), split: (2, 2), column: 0, kernel: Arc::new(AddKernel) }
    }
}

impl ElementwiseDesign {
    fn shim(&self) -> TileCoord {
        TileCoord::new(self.column, 0)
    }

    fn mem(&self) -> TileCoord {
        TileCoord::new(self.column, 1)
    }

    fn compute(&self) -> TileCoord {
        TileCoord::new(self.column, 2)
    }

    pub fn grid(&self) -> Result<QuadrantGrid, ConfigError> {
        self.matrix.partition(self.split.0, self.split.1)
    }

    /// The compute core's program: wait for both inputs and an empty
    /// output, compute, hand everything back. Once per quadrant.
    pub fn core_spec(&self) -> Result<CoreSpec, ConfigError> {
        let iterations = self.grid()?.tile_count() as u32;
        Ok(CoreSpec::new(self.compute(), Arc::clone(&self.kernel))
            .acquire("use_a", 1)
            .acquire("use_b", 1)
            .acquire("use_c", 1)
            .inputs("a", "b")
            .output("c")
            .release("read_in_a", 1)
            .release("read_in_b", 1)
            .release("write_out_c", 1)
            .iterations(iterations))
    }

    /// Topology builder with the given core program.
    pub fn builder(&self, core: CoreSpec) -> Result<TopologyBuilder, ConfigError> {
        let tile = self.grid()?.tile_shape();
        let (shim, mem, compute) = (self.shim(), self.mem(), self.compute());

        let mut b = TopologyBuilder::new();
        b.tile(shim).tile(mem).tile(compute);

        for name in ["a", "b", "c"] {
            let empty = format!("read_in_{}", name);
            let full = format!("write_out_{}", name);
            b.lock(mem, &empty, 1).lock(mem, &full, 0);
            b.buffer(mem, name, tile);
            b.guard(mem, name, &empty, &full);
        }

        b.lock(compute, "read_in_a", 1).lock(compute, "use_a", 0);
        b.lock(compute, "read_in_b", 1).lock(compute, "use_b", 0);
        b.lock(compute, "use_c", 1).lock(compute, "write_out_c", 0);
        for name in ["a", "b", "c"] {
            b.buffer(compute, name, tile);
        }
        b.guard(compute, "a", "read_in_a", "use_a");
        b.guard(compute, "b", "read_in_b", "use_b");
        b.guard(compute, "c", "use_c", "write_out_c");

        b.shim_channel(shim, ChannelDirection::MM2S, 0);
        b.shim_channel(shim, ChannelDirection::MM2S, 1);
        b.shim_channel(shim, ChannelDirection::S2MM, 0);

        // Memory tile: re-buffer each stream through a lock-guarded buffer.
        for (index, name) in ["a", "b", "c"].iter().enumerate() {
            let empty = format!("read_in_{}", name);
            let full = format!("write_out_{}", name);
            b.s2mm(mem, index as u8, vec![StepSpec::new(name).acquire(&empty, 1).release(&full, 1)]);
            b.mm2s(mem, index as u8, vec![StepSpec::new(name).acquire(&full, 1).release(&empty, 1)]);
        }

        b.s2mm(compute, 0, vec![StepSpec::new("a").acquire("read_in_a", 1).release("use_a", 1)]);
        b.s2mm(compute, 1, vec![StepSpec::new("b").acquire("read_in_b", 1).release("use_b", 1)]);
        b.mm2s(compute, 0, vec![StepSpec::new("c").acquire("write_out_c", 1).release("use_c", 1)]);
        b.core(core);

        b.flow_mm2s_to_s2mm((shim, 0), (mem, 0));
        b.flow_mm2s_to_s2mm((shim, 1), (mem, 1));
        b.flow_mm2s_to_s2mm((mem, 0), (compute, 0));
        b.flow_mm2s_to_s2mm((mem, 1), (compute, 1));
        b.flow_mm2s_to_s2mm((compute, 0), (mem, 2));
        b.flow_mm2s_to_s2mm((mem, 2), (shim, 0));
        Ok(b)
    }

    pub fn topology(&self) -> Result<PipelineTopology, ConfigError> {
        self.builder(self.core_spec()?)?.build()
    }

    /// Host program: queue every quadrant of A and B, then drain C one
    /// quadrant at a time, syncing after each.
    pub fn host_program(&self) -> Result<HostProgram, ConfigError> {
        let descriptors = self.grid()?.descriptors();
        let quadrants = descriptors.len() as u32;
        let shim = self.shim();
        let mut program = HostProgram::new();

        for (i, desc) in descriptors.iter().enumerate() {
            program.enqueue(ChannelId::mm2s(shim, 0), DDR_A, i as u32, desc)?;
        }
        for (i, desc) in descriptors.iter().enumerate() {
            program.enqueue(ChannelId::mm2s(shim, 1), DDR_B, quadrants + i as u32, desc)?;
        }
        let output = ChannelId::s2mm(shim, 0);
        for (i, desc) in descriptors.iter().enumerate() {
            program.enqueue(output, DDR_C, 2 * quadrants + i as u32, desc)?;
            program.push(NpuInstruction::sync(output));
        }
        Ok(program)
    }

    /// Host program that never feeds B. The core can never acquire
    /// `use_b`, so the first output sync never passes.
    pub fn starved_host_program(&self) -> Result<HostProgram, ConfigError> {
        let program = self.host_program()?;
        let b_input = Some(ChannelId::mm2s(self.shim(), 1));
        let kept = program
            .instructions()
            .iter()
            .filter(|i| !matches!(i, NpuInstruction::QueuePush { .. }) || i.channel() != b_input)
            .copied()
            .collect();
        Ok(HostProgram::from_instructions(kept))
    }

    pub fn signature(&self) -> IoSignature {
        IoSignature { inputs: vec![self.matrix; 2], outputs: vec![self.matrix], element_type: ElementType::I32 }
    }

    /// Lower the design with its regular host program.
    pub fn lower(&self, lowering: &dyn Lowering) -> Result<PipelineBinary, ConfigError> {
        lowering.lower(Arc::new(self.topology()?), &self.host_program()?, self.signature())
    }

    /// Host-side result the pipeline must produce.
    pub fn reference(&self, a: &Matrix, b: &Matrix) -> Matrix {
        let data = a.data.iter().zip(&b.data).map(|(&x, &y)| self.kernel.combine(x, y)).collect();
        Matrix { shape: a.shape, data }
    }

    /// A holds its quadrant number (1-based, row-major) in every
    /// element; B is zero.
    pub fn sample_inputs(&self) -> (Matrix, Matrix) {
        let tile_rows = self.matrix.rows / self.split.0.max(1);
        let tile_cols = self.matrix.cols / self.split.1.max(1);
        let a = Matrix::from_fn(self.matrix, |r, c| {
            (1 + (r / tile_rows) * self.split.1 + c / tile_cols) as i32
        });
        (a, Matrix::zeros(self.matrix))
    }
}
