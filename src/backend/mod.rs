//! Accelerator interface
//!
//! The scheduler talks to hardware only through [`Accelerator`]: allocate flat
//! `f32` buffers, move data in and out, and submit [`WorkUnit`]s to a serial
//! command stream. Every submitted unit gets a one-shot [`CompletionSignal`]
//! that the accelerator fires from whatever thread finishes the work.
//!
//! [`cpu::CpuAccelerator`] is the in-tree reference implementation.

pub mod cpu;
pub mod error;

use std::fmt;
use std::sync::Arc;

pub use cpu::{CpuAccelerator, CpuConfig};
pub use error::{BackendError, BackendResult};

/// Handle to one physical allocation owned by an accelerator.
///
/// Cloning the handle does not copy or retain storage; the accelerator
/// releases it on [`Accelerator::free`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    id: u64,
    len: usize,
    label: Arc<str>,
}

impl DeviceBuffer {
    pub fn new(id: u64, len: usize, label: &str) -> Self {
        DeviceBuffer {
            id,
            len,
            label: Arc::from(label),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Length in elements
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Scalar kernel argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    U32(u32),
    F32(f32),
}

/// How a kernel uses a bound region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    /// Read then write back; backward kernels accumulate through this
    ReadWrite,
}

impl Access {
    pub fn writes(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Launch geometry carried with every invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl GridSize {
    pub fn new(width: usize, height: usize) -> Self {
        GridSize {
            width: width.min(u32::MAX as usize) as u32,
            height: height.min(u32::MAX as usize) as u32,
            depth: 1,
        }
    }
}

impl Default for GridSize {
    fn default() -> Self {
        GridSize {
            width: 1,
            height: 1,
            depth: 1,
        }
    }
}

/// A slice of a physical buffer bound to a kernel argument slot
#[derive(Debug, Clone, PartialEq)]
pub struct BoundRegion {
    pub buffer: DeviceBuffer,
    /// Element offset into `buffer`
    pub offset: usize,
    pub len: usize,
    pub access: Access,
}

/// One kernel launch with fully resolved bindings
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kernel: String,
    pub regions: Vec<BoundRegion>,
    pub scalars: Vec<Scalar>,
    pub grid: GridSize,
}

/// Which part of a pass a unit of work belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkPhase {
    Forward,
    Backward,
    Update,
}

/// Diagnostic identity of a work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkTag {
    pub pass: u64,
    pub slot: usize,
    /// Graph node index; `None` for parameter updates
    pub node: Option<usize>,
    pub phase: WorkPhase,
}

impl fmt::Display for WorkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(node) => write!(
                f,
                "pass {} slot {} {:?} node {}",
                self.pass, self.slot, self.phase, node
            ),
            None => write!(f, "pass {} slot {} {:?}", self.pass, self.slot, self.phase),
        }
    }
}

/// A unit of submittable work: commands executed in order on the stream
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub tag: WorkTag,
    pub commands: Vec<Command>,
}

/// One-shot completion callback attached to a submitted work unit.
///
/// Dropping a signal without completing it is allowed only when
/// [`Accelerator::submit`] returns an error.
pub struct CompletionSignal(Box<dyn FnOnce(BackendResult<()>) + Send + 'static>);

impl CompletionSignal {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(BackendResult<()>) + Send + 'static,
    {
        CompletionSignal(Box::new(f))
    }

    pub fn complete(self, result: BackendResult<()>) {
        (self.0)(result)
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionSignal")
    }
}

/// Capability the scheduler calls into.
///
/// Work submitted through `submit` executes in submission order with respect
/// to data hazards; completion signals may be delivered in any order.
pub trait Accelerator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Allocate a zero-filled buffer of `len` elements.
    fn allocate(&self, len: usize, label: &str) -> BackendResult<DeviceBuffer>;

    fn free(&self, buffer: &DeviceBuffer);

    /// Synchronous host-to-device copy into `[offset, offset + data.len())`.
    fn upload(&self, buffer: &DeviceBuffer, offset: usize, data: &[f32]) -> BackendResult<()>;

    /// Synchronous device-to-host copy of `len` elements starting at `offset`.
    fn download(&self, buffer: &DeviceBuffer, offset: usize, len: usize) -> BackendResult<Vec<f32>>;

    fn has_kernel(&self, kernel: &str) -> bool;

    /// Queue `work` on the command stream. `signal` fires exactly once when
    /// the work has executed, unless this returns an error.
    fn submit(&self, work: WorkUnit, signal: CompletionSignal) -> BackendResult<()>;

    /// Zero-fill a whole buffer.
    fn clear(&self, buffer: &DeviceBuffer) -> BackendResult<()> {
        self.upload(buffer, 0, &vec![0.0; buffer.len()])
    }
}
