//! Host-side orchestration.
//!
//! The host never touches tiles directly. It hands a lowered
//! [`PipelineBinary`] to a [`Driver`], maps and fills buffers, starts the
//! run, waits with a bound, and reads back the result. The sequence is
//! the same for any device; [`EmulatedDriver`] runs it on the
//! [`Engine`](crate::emu::Engine).
//!
//! Buffer handles are ddr ids: inputs first, then outputs, in signature
//! order. They are the `ddr_id` values the host program's descriptors
//! refer to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::device::{DataDirection, ElementType, Matrix, MatrixShape};
use crate::emu::{Engine, EngineStatus, Schedule};
use crate::error::{ConfigError, RunError};
use crate::npu::{parse_words, HostProgram};
use crate::topology::PipelineTopology;

/// Handle to a mapped host buffer.
pub type BufferHandle = usize;

/// Shapes and element type of the buffers a pipeline binary reads and
/// writes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IoSignature {
    pub inputs: Vec<MatrixShape>,
    pub outputs: Vec<MatrixShape>,
    pub element_type: ElementType,
}

impl IoSignature {
    /// Element counts of every buffer, indexed by handle.
    pub fn extents(&self) -> Vec<usize> {
        self.inputs.iter().chain(&self.outputs).map(MatrixShape::len).collect()
    }
}

impl std::fmt::Display for IoSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list = |shapes: &[MatrixShape]| shapes.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ");
        write!(f, "({}) -> ({}) of {}", list(&self.inputs), list(&self.outputs), self.element_type)
    }
}

/// Everything a driver needs to run a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineBinary {
    pub topology: Arc<PipelineTopology>,
    /// Encoded host instruction stream.
    pub instructions: Vec<u32>,
    pub signature: IoSignature,
}

/// Turns a topology and host program into a loadable binary.
pub trait Lowering {
    fn lower(
        &self,
        topology: Arc<PipelineTopology>,
        program: &HostProgram,
        signature: IoSignature,
    ) -> Result<PipelineBinary, ConfigError>;
}

/// Lowering for the emulated driver: the host program is checked against
/// the topology and the signature's buffers, then encoded to words. The
/// topology travels as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmulatorLowering;

impl Lowering for EmulatorLowering {
    fn lower(
        &self,
        topology: Arc<PipelineTopology>,
        program: &HostProgram,
        signature: IoSignature,
    ) -> Result<PipelineBinary, ConfigError> {
        program.validate(&topology, &signature.extents())?;
        let instructions = program.to_words()?;
        log::debug!("Lowered {} instructions to {} words", program.len(), instructions.len());
        Ok(PipelineBinary { topology, instructions, signature })
    }
}

/// Result of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut { rounds: u64, reason: String },
}

/// Device driver interface.
pub trait Driver {
    /// Load a binary. Discards any previous load and its buffers.
    fn load(&mut self, binary: &PipelineBinary) -> Result<(), RunError>;

    /// Map host buffers; returns `(inputs, outputs)` handles.
    fn map_buffers(
        &mut self,
        inputs: &[MatrixShape],
        outputs: &[MatrixShape],
        element_type: ElementType,
    ) -> Result<(Vec<BufferHandle>, Vec<BufferHandle>), RunError>;

    /// Fill a mapped buffer on the host side.
    fn write_buffer(&mut self, handle: BufferHandle, data: &[i32]) -> Result<(), RunError>;

    /// Make host-side buffer contents visible to the device.
    fn sync_to_device(&mut self) -> Result<(), RunError>;

    /// Start the pipeline.
    fn run(&mut self) -> Result<(), RunError>;

    /// Wait for completion, at most `timeout`.
    fn wait(&mut self, timeout: Duration) -> Result<WaitOutcome, RunError>;

    /// Make device-written buffer contents visible to the host.
    fn sync_from_device(&mut self) -> Result<(), RunError>;

    /// Host-side contents of a mapped buffer.
    fn read_buffer(&self, handle: BufferHandle) -> Result<Vec<i32>, RunError>;
}

/// Driver backed by the step-based emulator.
#[derive(Debug)]
pub struct EmulatedDriver {
    schedule: Schedule,
    max_rounds: u64,
    check_invariants: bool,
    engine: Option<Engine>,
    signature: IoSignature,
    /// Host-side copies, indexed by handle.
    staging: Vec<Vec<i32>>,
    mapped: bool,
    running: bool,
}

impl EmulatedDriver {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            max_rounds: 100_000,
            check_invariants: true,
            engine: None,
            signature: IoSignature::default(),
            staging: Vec::new(),
            mapped: false,
            running: false,
        }
    }

    /// Driver configured from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut driver = Self::new(config.schedule());
        driver.max_rounds = config.max_rounds;
        driver.check_invariants = config.check_invariants;
        driver
    }

    pub fn with_max_rounds(mut self, max_rounds: u64) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// The engine of the current load.
    pub fn engine(&self) -> Option<&Engine> {
        self.engine.as_ref()
    }

    fn engine_mut(&mut self) -> Result<&mut Engine, RunError> {
        self.engine.as_mut().ok_or(RunError::NotReady("no binary loaded"))
    }

    fn staging_mut(&mut self, handle: BufferHandle) -> Result<&mut Vec<i32>, RunError> {
        self.staging.get_mut(handle).ok_or(RunError::UnknownHandle(handle))
    }
}

impl Driver for EmulatedDriver {
    fn load(&mut self, binary: &PipelineBinary) -> Result<(), RunError> {
        let program = parse_words(&binary.instructions)?;
        let mut engine = Engine::new(Arc::clone(&binary.topology), program, self.schedule);
        engine.check_invariants = self.check_invariants;

        self.engine = Some(engine);
        self.signature = binary.signature.clone();
        self.staging.clear();
        self.mapped = false;
        self.running = false;
        log::info!("Loaded pipeline binary: {} words, signature {}", binary.instructions.len(), self.signature);
        Ok(())
    }

    fn map_buffers(
        &mut self,
        inputs: &[MatrixShape],
        outputs: &[MatrixShape],
        element_type: ElementType,
    ) -> Result<(Vec<BufferHandle>, Vec<BufferHandle>), RunError> {
        if self.mapped {
            return Err(RunError::NotReady("buffers already mapped"));
        }
        let requested = IoSignature { inputs: inputs.to_vec(), outputs: outputs.to_vec(), element_type };
        if requested != self.signature {
            return Err(RunError::SignatureMismatch(format!(
                "requested {}, binary expects {}",
                requested, self.signature
            )));
        }

        let engine = self.engine_mut()?;
        let topology = Arc::clone(engine.state.topology());
        if let Some(buffer) = topology.tiles().flat_map(|t| &t.buffers).find(|b| b.element_type != element_type) {
            return Err(RunError::SignatureMismatch(format!(
                "buffer '{}' on tile {} holds {}, host maps {}",
                buffer.name, buffer.id.tile, buffer.element_type, element_type
            )));
        }
        let bytes: usize = requested.extents().iter().sum::<usize>() * element_type.size_bytes();
        log::debug!("Mapping {} inputs and {} outputs of {} ({} bytes)", inputs.len(), outputs.len(), element_type, bytes);

        let input_handles: Vec<BufferHandle> =
            inputs.iter().map(|&shape| engine.state.host.allocate(shape, DataDirection::Input)).collect();
        let output_handles: Vec<BufferHandle> =
            outputs.iter().map(|&shape| engine.state.host.allocate(shape, DataDirection::Output)).collect();

        self.staging = inputs.iter().chain(outputs).map(|s| vec![0; s.len()]).collect();
        self.mapped = true;
        Ok((input_handles, output_handles))
    }

    fn write_buffer(&mut self, handle: BufferHandle, data: &[i32]) -> Result<(), RunError> {
        let staging = self.staging_mut(handle)?;
        if staging.len() != data.len() {
            return Err(RunError::ShapeMismatch { handle, expected: staging.len(), actual: data.len() });
        }
        staging.copy_from_slice(data);
        Ok(())
    }

    fn sync_to_device(&mut self) -> Result<(), RunError> {
        let engine = self.engine.as_mut().ok_or(RunError::NotReady("no binary loaded"))?;
        for (handle, staging) in self.staging.iter().enumerate() {
            let buffer = engine.state.host.get_mut(handle).ok_or(RunError::UnknownHandle(handle))?;
            if buffer.direction == DataDirection::Input {
                buffer.data.copy_from_slice(staging);
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<(), RunError> {
        if !self.mapped {
            return Err(RunError::NotReady("buffers not mapped"));
        }
        let engine = self.engine_mut()?;
        let extents: Vec<usize> = engine.state.host.iter().map(|b| b.data.len()).collect();
        engine.host().program().validate(engine.state.topology(), &extents)?;
        engine.start();
        self.running = true;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<WaitOutcome, RunError> {
        if !self.running {
            return Err(RunError::NotReady("pipeline not started"));
        }
        let max_rounds = self.max_rounds;
        let engine = self.engine_mut()?;
        let deadline = Instant::now() + timeout;

        let outcome = match engine.run(max_rounds, Some(deadline))? {
            EngineStatus::Completed => WaitOutcome::Completed,
            EngineStatus::Stalled => {
                WaitOutcome::TimedOut { rounds: engine.rounds, reason: format!("stalled: {}", engine.blocked_summary()) }
            }
            EngineStatus::Running | EngineStatus::Idle => {
                WaitOutcome::TimedOut { rounds: engine.rounds, reason: "wait bound reached".to_string() }
            }
        };
        Ok(outcome)
    }

    fn sync_from_device(&mut self) -> Result<(), RunError> {
        let engine = self.engine.as_ref().ok_or(RunError::NotReady("no binary loaded"))?;
        for (handle, staging) in self.staging.iter_mut().enumerate() {
            let buffer = engine.state.host.get(handle).ok_or(RunError::UnknownHandle(handle))?;
            if buffer.direction == DataDirection::Output {
                staging.copy_from_slice(&buffer.data);
            }
        }
        Ok(())
    }

    fn read_buffer(&self, handle: BufferHandle) -> Result<Vec<i32>, RunError> {
        self.staging.get(handle).cloned().ok_or(RunError::UnknownHandle(handle))
    }
}

/// Runs a pipeline binary end to end on a driver.
#[derive(Debug)]
pub struct HostOrchestrator<D: Driver> {
    driver: D,
    binary: PipelineBinary,
    timeout: Duration,
}

impl<D: Driver> HostOrchestrator<D> {
    pub fn new(driver: D, binary: PipelineBinary, timeout: Duration) -> Self {
        Self { driver, binary, timeout }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Load, fill inputs, run, wait, and return the outputs.
    ///
    /// A wait that times out is [`RunError::DeadlockTimeout`].
    pub fn execute(&mut self, inputs: &[Matrix]) -> Result<Vec<Matrix>, RunError> {
        let signature = self.binary.signature.clone();
        let shapes: Vec<MatrixShape> = inputs.iter().map(|m| m.shape).collect();
        if shapes != signature.inputs {
            return Err(RunError::SignatureMismatch(format!(
                "{} input matrices given, binary expects {}",
                inputs.len(),
                signature
            )));
        }

        self.driver.load(&self.binary)?;
        let (input_handles, output_handles) =
            self.driver.map_buffers(&signature.inputs, &signature.outputs, signature.element_type)?;
        for (handle, matrix) in input_handles.iter().zip(inputs) {
            self.driver.write_buffer(*handle, &matrix.data)?;
        }
        self.driver.sync_to_device()?;
        self.driver.run()?;

        let started = Instant::now();
        match self.driver.wait(self.timeout)? {
            WaitOutcome::Completed => log::info!("Pipeline completed in {:?}", started.elapsed()),
            WaitOutcome::TimedOut { rounds, reason } => {
                log::warn!("Pipeline timed out after {} rounds: {}", rounds, reason);
                return Err(RunError::DeadlockTimeout { timeout_ms: self.timeout.as_millis(), rounds, reason });
            }
        }

        self.driver.sync_from_device()?;
        output_handles
            .iter()
            .zip(&signature.outputs)
            .map(|(&handle, &shape)| Ok(Matrix { shape, data: self.driver.read_buffer(handle)? }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::ElementwiseDesign;

    fn binary() -> PipelineBinary {
        let design = ElementwiseDesign::default();
        design.lower(&EmulatorLowering).unwrap()
    }

    #[test]
    fn test_lowering_encodes_program() {
        let design = ElementwiseDesign::default();
        let binary = binary();
        assert_eq!(binary.instructions, design.host_program().unwrap().to_words().unwrap());
        assert_eq!(binary.signature, design.signature());
    }

    #[test]
    fn test_driver_requires_load() {
        let mut driver = EmulatedDriver::new(Schedule::InOrder);
        assert!(matches!(driver.run(), Err(RunError::NotReady(_))));
        assert!(matches!(
            driver.map_buffers(&[], &[], ElementType::I32),
            Err(RunError::SignatureMismatch(_)) | Err(RunError::NotReady(_))
        ));
    }

    #[test]
    fn test_run_requires_mapped_buffers() {
        let mut driver = EmulatedDriver::new(Schedule::InOrder);
        driver.load(&binary()).unwrap();
        assert!(matches!(driver.run(), Err(RunError::NotReady("buffers not mapped"))));
    }

    #[test]
    fn test_map_rejects_wrong_signature() {
        let mut driver = EmulatedDriver::new(Schedule::InOrder);
        driver.load(&binary()).unwrap();
        let shape = MatrixShape::new(8, 8);
        assert!(matches!(
            driver.map_buffers(&[shape, shape], &[shape], ElementType::I32),
            Err(RunError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_map_rejects_other_element_type() {
        let binary = binary();
        let mut driver = EmulatedDriver::new(Schedule::InOrder);
        driver.load(&binary).unwrap();
        let (inputs, outputs) = (&binary.signature.inputs, &binary.signature.outputs);
        assert!(matches!(
            driver.map_buffers(inputs, outputs, ElementType::I16),
            Err(RunError::SignatureMismatch(_))
        ));
        // Nothing was mapped, so the right type still maps.
        driver.map_buffers(inputs, outputs, ElementType::I32).unwrap();
    }

    #[test]
    fn test_map_rejects_type_tiles_do_not_hold() {
        let mut binary = binary();
        binary.signature.element_type = ElementType::I8;
        let mut driver = EmulatedDriver::new(Schedule::InOrder);
        driver.load(&binary).unwrap();
        match driver.map_buffers(&binary.signature.inputs, &binary.signature.outputs, ElementType::I8) {
            Err(RunError::SignatureMismatch(msg)) => assert!(msg.contains("holds i32"), "{}", msg),
            other => panic!("expected SignatureMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_signature_extents_and_display() {
        let signature = ElementwiseDesign::default().signature();
        assert_eq!(signature.extents(), vec![256, 256, 256]);
        assert_eq!(signature.element_type.size_bytes(), 4);
        assert!(signature.to_string().ends_with("of i32"));
    }

    #[test]
    fn test_write_checks_length_and_handle() {
        let binary = binary();
        let mut driver = EmulatedDriver::new(Schedule::InOrder);
        driver.load(&binary).unwrap();
        let (inputs, outputs) =
            driver.map_buffers(&binary.signature.inputs, &binary.signature.outputs, ElementType::I32).unwrap();
        assert_eq!(inputs, vec![0, 1]);
        assert_eq!(outputs, vec![2]);

        assert!(matches!(
            driver.write_buffer(0, &[1, 2, 3]),
            Err(RunError::ShapeMismatch { handle: 0, expected: 256, actual: 3 })
        ));
        assert!(matches!(driver.write_buffer(7, &[]), Err(RunError::UnknownHandle(7))));
    }

    #[test]
    fn test_execute_rejects_wrong_input_count() {
        let design = ElementwiseDesign::default();
        let mut host = HostOrchestrator::new(EmulatedDriver::new(Schedule::InOrder), binary(), Duration::from_secs(5));
        let (a, _) = design.sample_inputs();
        assert!(matches!(host.execute(&[a]), Err(RunError::SignatureMismatch(_))));
    }

    #[test]
    fn test_execute_round_trip() {
        let design = ElementwiseDesign::default();
        let (a, b) = design.sample_inputs();
        let mut host = HostOrchestrator::new(EmulatedDriver::new(Schedule::InOrder), binary(), Duration::from_secs(5));

        let outputs = host.execute(&[a.clone(), b]).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0], a);

        // The driver can be reused for a second run.
        let b = Matrix::from_fn(a.shape, |r, c| (r * 16 + c) as i32);
        let outputs = host.execute(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(outputs[0], design.reference(&a, &b));
    }

    #[test]
    fn test_round_budget_is_deadlock_timeout() {
        let design = ElementwiseDesign::default();
        let driver = EmulatedDriver::new(Schedule::InOrder).with_max_rounds(3);
        let mut host = HostOrchestrator::new(driver, binary(), Duration::from_secs(5));
        let (a, b) = design.sample_inputs();
        assert!(matches!(host.execute(&[a, b]), Err(RunError::DeadlockTimeout { rounds: 3, .. })));
    }
}
