//! CPU reference accelerator
//!
//! Buffers live in host memory. Submitted work is executed strictly in
//! submission order by one stream thread, which gives the same data-hazard
//! ordering a hardware command queue provides. Completion signals can be
//! delayed by a random jitter on the rayon pool so the scheduler sees them out
//! of order, the way completions from a real device arrive.

pub mod config;
pub(crate) mod kernels;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use crate::backend::{
    Accelerator, BackendError, BackendResult, CompletionSignal, DeviceBuffer, WorkTag, WorkUnit,
};

pub use config::CpuConfig;
use kernels::{KernelArgs, KernelFn};

struct StreamItem {
    work: WorkUnit,
    signal: CompletionSignal,
}

struct Shared {
    config: CpuConfig,
    storage: RwLock<HashMap<u64, Arc<Mutex<Vec<f32>>>>>,
    kernels: HashMap<&'static str, KernelFn>,
    next_buffer: AtomicU64,
    allocated: AtomicUsize,
    submissions: AtomicUsize,
    executed: Mutex<Vec<WorkTag>>,
}

/// Host-memory accelerator with a serial command stream
pub struct CpuAccelerator {
    shared: Arc<Shared>,
    stream: Mutex<Option<Sender<StreamItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CpuAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuAccelerator")
            .field("config", &self.shared.config)
            .field("allocated_elements", &self.allocated_elements())
            .finish()
    }
}

impl CpuAccelerator {
    /// Start the command stream thread.
    pub fn new(config: CpuConfig) -> BackendResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config,
            storage: RwLock::new(HashMap::new()),
            kernels: kernels::registry(),
            next_buffer: AtomicU64::new(1),
            allocated: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        });

        let (tx, rx) = mpsc::channel::<StreamItem>();
        let stream_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("graphforge-cpu-stream".to_string())
            .spawn(move || {
                for item in rx {
                    let result = stream_shared.execute(&item.work);
                    stream_shared.deliver(item.signal, result);
                }
                tracing::debug!("CPU command stream drained");
            })
            .map_err(|e| BackendError::StreamStartFailed(e.to_string()))?;

        tracing::debug!(
            jitter_us = shared.config.completion_jitter.map(|d| d.as_micros() as u64),
            "CPU accelerator started"
        );

        Ok(CpuAccelerator {
            shared,
            stream: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Accelerator with default configuration, shared behind `Arc`
    pub fn shared_default() -> BackendResult<Arc<Self>> {
        Ok(Arc::new(Self::new(CpuConfig::default())?))
    }

    /// Elements currently allocated across all live buffers
    pub fn allocated_elements(&self) -> usize {
        self.shared.allocated.load(Ordering::SeqCst)
    }

    /// Number of live buffers
    pub fn live_buffers(&self) -> usize {
        self.shared
            .storage
            .read()
            .map(|storage| storage.len())
            .unwrap_or(0)
    }

    /// Tags of every executed work unit, in execution order
    pub fn execution_log(&self) -> Vec<WorkTag> {
        self.shared
            .executed
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn clear_execution_log(&self) {
        if let Ok(mut log) = self.shared.executed.lock() {
            log.clear();
        }
    }

    fn region(&self, id: u64) -> BackendResult<Arc<Mutex<Vec<f32>>>> {
        self.shared.region(id)
    }
}

impl Shared {
    fn region(&self, id: u64) -> BackendResult<Arc<Mutex<Vec<f32>>>> {
        let storage = self.storage.read()?;
        storage
            .get(&id)
            .cloned()
            .ok_or(BackendError::UnknownBuffer(id))
    }

    fn execute(&self, work: &WorkUnit) -> BackendResult<()> {
        if let Ok(mut log) = self.executed.lock() {
            log.push(work.tag);
        }

        for command in &work.commands {
            if self.config.failing_kernels.contains(&command.kernel) {
                return Err(BackendError::KernelFailed {
                    kernel: command.kernel.clone(),
                    reason: "injected fault".to_string(),
                });
            }
            let kernel = self
                .kernels
                .get(command.kernel.as_str())
                .ok_or_else(|| BackendError::KernelNotFound(command.kernel.clone()))?;

            let mut regions = Vec::with_capacity(command.regions.len());
            for bound in &command.regions {
                let storage = self.region(bound.buffer.id())?;
                let data = storage.lock()?;
                let range = checked_range(bound.buffer.id(), bound.offset, bound.len, data.len())?;
                regions.push(data[range].to_vec());
            }

            let mut args = KernelArgs {
                regions,
                scalars: &command.scalars,
            };
            kernel(&mut args).map_err(|reason| BackendError::KernelFailed {
                kernel: command.kernel.clone(),
                reason,
            })?;

            for (bound, values) in command.regions.iter().zip(args.regions) {
                if !bound.access.writes() {
                    continue;
                }
                let storage = self.region(bound.buffer.id())?;
                let mut data = storage.lock()?;
                let range = checked_range(bound.buffer.id(), bound.offset, bound.len, data.len())?;
                if values.len() != bound.len {
                    return Err(BackendError::KernelFailed {
                        kernel: command.kernel.clone(),
                        reason: format!(
                            "kernel produced {} elements for a {}-element region",
                            values.len(),
                            bound.len
                        ),
                    });
                }
                data[range].copy_from_slice(&values);
            }
        }

        tracing::trace!(work = %work.tag, commands = work.commands.len(), "work unit executed");
        Ok(())
    }

    fn deliver(&self, signal: CompletionSignal, result: BackendResult<()>) {
        match self.config.completion_jitter {
            Some(max) if !max.is_zero() => {
                let max_us = max.as_micros().min(u64::MAX as u128) as u64;
                let delay = rand::thread_rng().gen_range(0..=max_us);
                rayon::spawn(move || {
                    thread::sleep(Duration::from_micros(delay));
                    signal.complete(result);
                });
            }
            _ => signal.complete(result),
        }
    }
}

fn checked_range(
    buffer: u64,
    offset: usize,
    len: usize,
    capacity: usize,
) -> BackendResult<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(offset..end),
        _ => Err(BackendError::OutOfBounds {
            buffer,
            offset,
            len,
            capacity,
        }),
    }
}

impl Accelerator for CpuAccelerator {
    fn name(&self) -> &str {
        "cpu"
    }

    fn allocate(&self, len: usize, label: &str) -> BackendResult<DeviceBuffer> {
        if let Some(limit) = self.shared.config.memory_limit {
            let in_use = self.shared.allocated.load(Ordering::SeqCst);
            if in_use + len > limit {
                return Err(BackendError::AllocationFailed {
                    label: label.to_string(),
                    len,
                    reason: format!("memory limit of {} elements reached ({} in use)", limit, in_use),
                });
            }
        }

        let id = self.shared.next_buffer.fetch_add(1, Ordering::SeqCst);
        self.shared
            .storage
            .write()?
            .insert(id, Arc::new(Mutex::new(vec![0.0; len])));
        self.shared.allocated.fetch_add(len, Ordering::SeqCst);

        tracing::trace!(buffer = id, len, label, "allocated");
        Ok(DeviceBuffer::new(id, len, label))
    }

    fn free(&self, buffer: &DeviceBuffer) {
        let removed = match self.shared.storage.write() {
            Ok(mut storage) => storage.remove(&buffer.id()).is_some(),
            Err(e) => {
                tracing::error!(buffer = buffer.id(), "free failed: {}", e);
                false
            }
        };
        if removed {
            self.shared.allocated.fetch_sub(buffer.len(), Ordering::SeqCst);
        }
    }

    fn upload(&self, buffer: &DeviceBuffer, offset: usize, data: &[f32]) -> BackendResult<()> {
        let storage = self.region(buffer.id())?;
        let mut target = storage.lock()?;
        let range = checked_range(buffer.id(), offset, data.len(), target.len())?;
        target[range].copy_from_slice(data);
        Ok(())
    }

    fn download(&self, buffer: &DeviceBuffer, offset: usize, len: usize) -> BackendResult<Vec<f32>> {
        let storage = self.region(buffer.id())?;
        let source = storage.lock()?;
        let range = checked_range(buffer.id(), offset, len, source.len())?;
        Ok(source[range].to_vec())
    }

    fn has_kernel(&self, kernel: &str) -> bool {
        self.shared.kernels.contains_key(kernel)
    }

    fn submit(&self, work: WorkUnit, signal: CompletionSignal) -> BackendResult<()> {
        let ordinal = self.shared.submissions.fetch_add(1, Ordering::SeqCst);
        if self.shared.config.failing_submissions.contains(&ordinal) {
            tracing::warn!(work = %work.tag, ordinal, "injected submission failure");
            return Err(BackendError::SubmissionFailed(format!(
                "injected failure for submission {}",
                ordinal
            )));
        }

        let stream = self.stream.lock()?;
        let sender = stream.as_ref().ok_or(BackendError::StreamClosed)?;
        sender
            .send(StreamItem { work, signal })
            .map_err(|_| BackendError::StreamClosed)
    }
}

impl Drop for CpuAccelerator {
    fn drop(&mut self) {
        if let Ok(mut stream) = self.stream.lock() {
            stream.take();
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    tracing::error!("CPU command stream thread panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Access, BoundRegion, Command, GridSize, Scalar, WorkPhase};
    use crate::layers::kernels as names;

    fn tag(node: usize) -> WorkTag {
        WorkTag {
            pass: 0,
            slot: 0,
            node: Some(node),
            phase: WorkPhase::Forward,
        }
    }

    fn relu_work(input: &DeviceBuffer, output: &DeviceBuffer, node: usize) -> WorkUnit {
        WorkUnit {
            tag: tag(node),
            commands: vec![Command {
                kernel: names::RELU_FORWARD.to_string(),
                regions: vec![
                    BoundRegion {
                        buffer: input.clone(),
                        offset: 0,
                        len: input.len(),
                        access: Access::Read,
                    },
                    BoundRegion {
                        buffer: output.clone(),
                        offset: 0,
                        len: output.len(),
                        access: Access::Write,
                    },
                ],
                scalars: vec![Scalar::F32(0.0)],
                grid: GridSize::new(input.len(), 1),
            }],
        }
    }

    fn wait_for(work: WorkUnit, accelerator: &CpuAccelerator) -> BackendResult<()> {
        let (tx, rx) = mpsc::channel();
        accelerator
            .submit(
                work,
                CompletionSignal::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_upload_download_round_trip_and_bounds() {
        let cpu = CpuAccelerator::new(CpuConfig::default()).unwrap();
        let buffer = cpu.allocate(4, "scratch").unwrap();
        cpu.upload(&buffer, 1, &[1.0, 2.0]).unwrap();
        assert_eq!(cpu.download(&buffer, 0, 4).unwrap(), vec![0.0, 1.0, 2.0, 0.0]);

        let err = cpu.upload(&buffer, 3, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, BackendError::OutOfBounds { .. }));
    }

    #[test]
    fn test_submitted_work_executes_and_signals() {
        let cpu = CpuAccelerator::new(CpuConfig::default()).unwrap();
        let input = cpu.allocate(3, "in").unwrap();
        let output = cpu.allocate(3, "out").unwrap();
        cpu.upload(&input, 0, &[-1.0, 0.5, 2.0]).unwrap();

        wait_for(relu_work(&input, &output, 1), &cpu).unwrap();
        assert_eq!(cpu.download(&output, 0, 3).unwrap(), vec![0.0, 0.5, 2.0]);
        assert_eq!(cpu.execution_log(), vec![tag(1)]);
    }

    #[test]
    fn test_stream_executes_in_submission_order_under_jitter() {
        let config = CpuConfig::default().with_completion_jitter(Duration::from_millis(2));
        let cpu = CpuAccelerator::new(config).unwrap();
        let a = cpu.allocate(1, "a").unwrap();
        let b = cpu.allocate(1, "b").unwrap();

        let (tx, rx) = mpsc::channel();
        for node in 0..8 {
            let tx = tx.clone();
            cpu.submit(
                relu_work(&a, &b, node),
                CompletionSignal::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .unwrap();
        }
        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        }
        let order: Vec<usize> = cpu.execution_log().iter().filter_map(|t| t.node).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_injected_submission_failure() {
        let cpu = CpuAccelerator::new(CpuConfig::default().with_failing_submission(0)).unwrap();
        let a = cpu.allocate(1, "a").unwrap();
        let err = cpu
            .submit(relu_work(&a, &a, 0), CompletionSignal::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, BackendError::SubmissionFailed(_)));

        // the next submission goes through
        assert!(wait_for(relu_work(&a, &a, 1), &cpu).is_ok());
    }

    #[test]
    fn test_injected_kernel_failure_reported_through_signal() {
        let config = CpuConfig::default().with_failing_kernel(names::RELU_FORWARD);
        let cpu = CpuAccelerator::new(config).unwrap();
        let a = cpu.allocate(1, "a").unwrap();
        let result = wait_for(relu_work(&a, &a, 0), &cpu);
        assert!(matches!(result, Err(BackendError::KernelFailed { .. })));
    }

    #[test]
    fn test_memory_limit_and_free() {
        let cpu = CpuAccelerator::new(CpuConfig::default().with_memory_limit(8)).unwrap();
        let a = cpu.allocate(6, "a").unwrap();
        assert!(matches!(
            cpu.allocate(4, "b"),
            Err(BackendError::AllocationFailed { .. })
        ));
        cpu.free(&a);
        assert_eq!(cpu.allocated_elements(), 0);
        assert_eq!(cpu.live_buffers(), 0);
        assert!(cpu.allocate(4, "b").is_ok());
    }

    #[test]
    fn test_unknown_kernel_fails_work() {
        let cpu = CpuAccelerator::new(CpuConfig::default()).unwrap();
        let a = cpu.allocate(1, "a").unwrap();
        let mut work = relu_work(&a, &a, 0);
        work.commands[0].kernel = "conv3d".to_string();
        assert!(!cpu.has_kernel("conv3d"));
        assert_eq!(
            wait_for(work, &cpu),
            Err(BackendError::KernelNotFound("conv3d".to_string()))
        );
    }
}
