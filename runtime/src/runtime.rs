//! The compute runtime.
//!
//! [`ComputeRuntime`] owns the backend, the configuration and the current device registry. Every
//! operation addresses an accelerator by index; buffers remember which accelerator and which device
//! generation they came from, so they are always returned to the pool that vended them.
//!
//! A typical session:
//!
//! ```ignore
//! let rt = ComputeRuntime::host()?;
//! let lease = rt.lease(true)?;
//! let a = rt.make(lease.index(), &[1.0, 2.0])?;
//! let b = rt.make(lease.index(), &[3.0, 4.0])?;
//! let add = rt.load(kernels::add())?;
//! let sum = rt.binary_call(&add, &a, &b)?;
//! assert_eq!(rt.to_host(&sum)?, vec![4.0, 6.0]);
//! ```

use std::sync::Arc;

use snafu::{ResultExt, ensure};
use tessera_device::{
    AcceleratedLibrary, Backend, Buffer, Command, FusedPlan, HostBackend, KernelArg, KernelArgs, KernelSource,
    MAX_FUSED_STEPS, PoolStats, launch_range,
};

use crate::accelerator::Accelerator;
use crate::config::RuntimeConfig;
use crate::device_registry::DeviceRegistry;
use crate::dispatch::{CallArg, CallArgs, KernelTable};
use crate::error::{
    BackendUnavailableSnafu, DeviceNotFoundSnafu, DeviceSnafu, ForeignBufferSnafu, InvalidArgumentSnafu, Result,
    StaleKernelSnafu,
};
use crate::fusion::{BinaryLambda, FusedKernel};

/// Accelerator registry, buffer pools and kernel dispatch behind one handle.
#[derive(Debug)]
pub struct ComputeRuntime {
    backend: Arc<dyn Backend>,
    config: RuntimeConfig,
    registry: DeviceRegistry,
}

impl ComputeRuntime {
    /// Enumerate `backend` and open its accelerators.
    pub fn init(backend: Arc<dyn Backend>, config: RuntimeConfig) -> Result<Self> {
        let registry = DeviceRegistry::open(backend.as_ref(), config.allow_gpu, &config)?;
        Ok(Self { backend, config, registry })
    }

    /// Runtime over the host backend, configured from the environment.
    pub fn host() -> Result<Self> {
        Self::init(Arc::new(HostBackend::new()), RuntimeConfig::from_env())
    }

    /// Drain and dispose every accelerator, then enumerate the backend again.
    ///
    /// Buffers and kernel tables from before the refresh belong to the old generation: returning
    /// such a buffer releases it, calling such a table fails.
    pub fn refresh_devices(&mut self, allow_gpu: bool) -> Result<()> {
        if self.registry.drain().is_err() {
            tracing::warn!(generation = self.registry.generation(), "disposing accelerators with faulted streams");
        }
        self.registry = DeviceRegistry::open(self.backend.as_ref(), allow_gpu, &self.config)?;
        self.config.allow_gpu = allow_gpu;
        Ok(())
    }

    /// Drain every accelerator and tear the runtime down.
    pub fn shutdown(self) -> Result<()> {
        let drained = self.registry.drain();
        tracing::debug!(generation = self.registry.generation(), "runtime shut down");
        drained
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn accelerators(&self) -> &[Accelerator] {
        self.registry.accelerators()
    }

    /// Accelerator `index`, or [`DeviceNotFound`](crate::Error::DeviceNotFound).
    pub fn accelerator(&self, index: usize) -> Result<&Accelerator> {
        let accelerators = self.accelerators();
        accelerators.get(index).ok_or_else(|| DeviceNotFoundSnafu { index, count: accelerators.len() }.build())
    }

    /// Whether any GPU-class accelerator is open.
    pub fn gpu_in_use(&self) -> bool {
        self.registry.gpu_in_use()
    }

    /// Generation of the current device set.
    pub fn generation(&self) -> u64 {
        self.registry.generation()
    }

    // ------------------------------------------------------------------------
    // Leasing
    // ------------------------------------------------------------------------

    /// Lease an accelerator according to the configured [`LeasePolicy`](crate::LeasePolicy).
    pub fn request_accelerator(&self, prefer_gpu: bool) -> Result<usize> {
        self.config.leasing.acquire(self.accelerators(), prefer_gpu)
    }

    /// Undo one lease on accelerator `index`.
    pub fn release_accelerator(&self, index: usize) -> Result<()> {
        let accelerator = self.accelerator(index)?;
        self.config.leasing.release(accelerator);
        Ok(())
    }

    /// Lease an accelerator for the lifetime of the returned guard.
    pub fn lease(&self, prefer_gpu: bool) -> Result<Lease<'_>> {
        let index = self.request_accelerator(prefer_gpu)?;
        Ok(Lease { runtime: self, index })
    }

    // ------------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------------

    /// Vend a buffer of `size` elements from accelerator `index`'s pool.
    ///
    /// The buffer reads as all zeros to every command submitted after this call.
    pub fn get(&self, index: usize, size: usize) -> Result<Buffer> {
        ensure!(size > 0, InvalidArgumentSnafu { reason: format!("buffer size must be positive, got {size}") });
        self.accelerator(index)?.get(size)
    }

    /// [`get`](Self::get), with the buffer already registered for return at the next flush.
    pub fn get_temp(&self, index: usize, size: usize) -> Result<Buffer> {
        let buffer = self.get(index, size)?;
        self.accelerator(index)?.defer(buffer.clone());
        Ok(buffer)
    }

    /// Return `buffer` to its owner's pool.
    ///
    /// Buffers from an older device generation are released instead.
    pub fn return_buffer(&self, buffer: Buffer) {
        match self.owner(&buffer) {
            Some(accelerator) => accelerator.put(buffer),
            None => tracing::warn!(
                buffer.generation = buffer.generation(),
                generation = self.generation(),
                "returned buffer outlived its accelerator, releasing it"
            ),
        }
    }

    /// Return `buffer` at its owner's next flush or synchronize.
    ///
    /// The caller may keep using it until then.
    pub fn defer_return(&self, buffer: Buffer) {
        match self.owner(&buffer) {
            Some(accelerator) => accelerator.defer(buffer),
            None => tracing::warn!(
                buffer.generation = buffer.generation(),
                generation = self.generation(),
                "deferred buffer outlived its accelerator, releasing it"
            ),
        }
    }

    /// Return every deferred buffer of accelerator `index` to its pool.
    pub fn flush(&self, index: usize) -> Result<usize> {
        Ok(self.accelerator(index)?.flush())
    }

    pub fn flush_all(&self) -> usize {
        self.accelerators().iter().map(Accelerator::flush).sum()
    }

    /// Flush accelerator `index`, then wait for its stream to drain.
    pub fn synchronize(&self, index: usize) -> Result<()> {
        self.accelerator(index)?.synchronize()
    }

    pub fn synchronize_all(&self) -> Result<()> {
        self.registry.drain()
    }

    /// Buffer on accelerator `index` holding `data`.
    pub fn make(&self, index: usize, data: &[f32]) -> Result<Buffer> {
        let buffer = self.get(index, data.len())?;
        self.vend_or_return(buffer, |buffer| self.from_host(buffer, data))
    }

    /// Queue an upload of `data` into `buffer`.
    pub fn from_host(&self, buffer: &Buffer, data: &[f32]) -> Result<()> {
        ensure!(
            data.len() == buffer.len(),
            InvalidArgumentSnafu { reason: format!("expected {} elements, got {}", buffer.len(), data.len()) }
        );
        let accelerator = self.owner_or_fail(buffer)?;
        let command = Command::CopyIn { dst: Arc::clone(buffer.raw()), data: data.to_vec() };
        accelerator.device().submit(command).context(DeviceSnafu)
    }

    /// Contents of `buffer` once every command queued before this call has run.
    pub fn to_host(&self, buffer: &Buffer) -> Result<Vec<f32>> {
        let accelerator = self.owner_or_fail(buffer)?;
        let mut host = vec![0.0; buffer.len()];
        accelerator.device().read(buffer.raw(), &mut host).context(DeviceSnafu)?;
        Ok(host)
    }

    pub fn pool_stats(&self, index: usize) -> Result<PoolStats> {
        Ok(self.accelerator(index)?.pool_stats())
    }

    /// Pooled buffers of `len` elements on accelerator `index`.
    pub fn pooled(&self, index: usize, len: usize) -> Result<usize> {
        Ok(self.accelerator(index)?.pooled(len))
    }

    pub fn deferred_len(&self, index: usize) -> Result<usize> {
        Ok(self.accelerator(index)?.deferred_len())
    }

    /// Release every pooled buffer of accelerator `index` to the device allocator.
    pub fn trim(&self, index: usize) -> Result<usize> {
        Ok(self.accelerator(index)?.trim())
    }

    /// Hand `buffer` out once `fill` has queued its contents; on failure it goes back to the pool.
    ///
    /// Commands already queued against it stay ahead of the next user's zero fill.
    pub(crate) fn vend_or_return(&self, buffer: Buffer, fill: impl FnOnce(&Buffer) -> Result<()>) -> Result<Buffer> {
        match fill(&buffer) {
            Ok(()) => Ok(buffer),
            Err(error) => {
                tracing::debug!(accelerator = buffer.accelerator(), %error, "call failed, returning its output");
                self.return_buffer(buffer);
                Err(error)
            }
        }
    }

    fn owner(&self, buffer: &Buffer) -> Option<&Accelerator> {
        if buffer.generation() != self.generation() {
            return None;
        }
        self.accelerators().get(buffer.accelerator())
    }

    fn owner_or_fail(&self, buffer: &Buffer) -> Result<&Accelerator> {
        self.owner(buffer).ok_or_else(|| {
            ForeignBufferSnafu {
                argument: 0usize,
                owner: describe(buffer.accelerator(), buffer.generation()),
                target: format!("generation {}", self.generation()),
            }
            .build()
        })
    }

    // ------------------------------------------------------------------------
    // Kernels
    // ------------------------------------------------------------------------

    /// Compile `source` once per accelerator, in accelerator order.
    pub fn load(&self, source: impl Into<KernelSource>) -> Result<KernelTable> {
        let source = source.into();
        let entries = self
            .accelerators()
            .iter()
            .map(|accelerator| accelerator.device().compile(&source).context(DeviceSnafu))
            .collect::<Result<Vec<_>>>()?;

        let name = source.name();
        tracing::debug!(kernel.name = %name, accelerators = entries.len(), "kernel loaded");
        Ok(KernelTable::new(name, source.params(), self.generation(), entries))
    }

    /// Load a single operator expression as an ordinary `(out, a, b)` kernel.
    pub fn load_binary(&self, lambda: &BinaryLambda) -> Result<KernelTable> {
        self.load(lambda.to_host_kernel()?)
    }

    /// Launch `table` on accelerator `index`.
    ///
    /// The index range covers the first buffer argument; every other argument is forwarded as is.
    pub fn call<'a>(&self, index: usize, table: &KernelTable, args: impl CallArgs<'a>) -> Result<()> {
        let accelerator = self.accelerator(index)?;
        ensure!(table.generation() == self.generation(), StaleKernelSnafu { kernel: table.name() });
        let program = table.entry(index).ok_or_else(|| DeviceNotFoundSnafu { index, count: table.len() }.build())?;

        let args = args.into_call_args();
        let mut kernel_args = KernelArgs::with_capacity(args.len());
        for (argument, arg) in args.into_iter().enumerate() {
            kernel_args.push(match arg {
                CallArg::Buffer(buffer) => {
                    ensure!(
                        buffer.accelerator() == index && buffer.generation() == self.generation(),
                        ForeignBufferSnafu {
                            argument,
                            owner: describe(buffer.accelerator(), buffer.generation()),
                            target: describe(index, self.generation()),
                        }
                    );
                    KernelArg::Buffer(Arc::clone(buffer.raw()))
                }
                CallArg::Scalar(value) => KernelArg::Scalar(value),
            });
        }

        let range = launch_range(program.name(), program.params(), &kernel_args).context(DeviceSnafu)?;
        tracing::trace!(kernel.name = %program.name(), accelerator = index, lanes = range.len(), "launch");
        let command = Command::Launch { program: Arc::clone(program), args: kernel_args, range };
        accelerator.device().submit(command).context(DeviceSnafu)
    }

    /// `out = table(a)` into a fresh buffer shaped like `a`.
    pub fn unary_call(&self, table: &KernelTable, a: &Buffer) -> Result<Buffer> {
        let out = self.get(a.accelerator(), a.len())?;
        self.vend_or_return(out, |out| self.call(a.accelerator(), table, (out, a)))
    }

    /// `out = table(a, b)` into a fresh buffer shaped like `a`.
    pub fn binary_call(&self, table: &KernelTable, a: &Buffer, b: &Buffer) -> Result<Buffer> {
        let out = self.get(a.accelerator(), a.len())?;
        self.vend_or_return(out, |out| self.call(a.accelerator(), table, (out, a, b)))
    }

    /// Apply `steps` in order, accumulating into a single output buffer.
    ///
    /// The first step reads `initial`; later steps read the accumulated output.
    pub fn binary_call_chain(&self, initial: &Buffer, steps: &[(&KernelTable, &Buffer)]) -> Result<Buffer> {
        ensure!(!steps.is_empty(), InvalidArgumentSnafu { reason: "a call chain needs at least one step" });

        let index = initial.accelerator();
        let out = self.get(index, initial.len())?;
        self.vend_or_return(out, |out| {
            steps.iter().enumerate().try_for_each(|(k, &(table, operand))| {
                let source = if k == 0 { initial } else { out };
                self.call(index, table, (out, source, operand))
            })
        })
    }

    /// Compile a fresh single-pass kernel applying `ops` in order.
    ///
    /// Each op is `(accumulator, operand) -> accumulator` and must be one binary operator over the two
    /// parameters. Nothing is cached: every call compiles again.
    pub fn fuse(&self, ops: &[BinaryLambda]) -> Result<FusedKernel> {
        ensure!(
            (1..=MAX_FUSED_STEPS).contains(&ops.len()),
            InvalidArgumentSnafu { reason: format!("fusion takes 1 to {MAX_FUSED_STEPS} operators, got {}", ops.len()) }
        );
        let steps = ops.iter().map(BinaryLambda::to_step).collect::<Result<Vec<_>>>()?;
        let plan = FusedPlan::new(steps).context(DeviceSnafu)?;
        let table = self.load(plan)?;
        tracing::debug!(kernel.name = %table.name(), operators = ops.len(), "fused kernel compiled");
        Ok(FusedKernel::new(table, ops.len()))
    }

    // ------------------------------------------------------------------------
    // Accelerated library
    // ------------------------------------------------------------------------

    /// Accelerated library of accelerator `index`, or `None` when it failed to initialize.
    ///
    /// Initialization is attempted once per accelerator; a failure is permanent.
    pub fn accelerated_library(&self, index: usize) -> Result<Option<Arc<dyn AcceleratedLibrary>>> {
        Ok(self.accelerator(index)?.library(self.backend.as_ref()))
    }

    /// Like [`accelerated_library`](Self::accelerated_library) but failing with
    /// [`BackendUnavailable`](crate::Error::BackendUnavailable).
    pub fn require_accelerated_library(&self, index: usize) -> Result<Arc<dyn AcceleratedLibrary>> {
        let accelerator = self.accelerator(index)?;
        accelerator.library(self.backend.as_ref()).ok_or_else(|| {
            BackendUnavailableSnafu {
                device: accelerator.info().to_string(),
                reason: "accelerated library failed to initialize",
            }
            .build()
        })
    }
}

fn describe(index: usize, generation: u64) -> String {
    format!("accelerator {index} (generation {generation})")
}

/// Lease on one accelerator, released on drop.
#[derive(Debug)]
pub struct Lease<'rt> {
    runtime: &'rt ComputeRuntime,
    index: usize,
}

impl Lease<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn accelerator(&self) -> &Accelerator {
        &self.runtime.accelerators()[self.index]
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Ok(accelerator) = self.runtime.accelerator(self.index) {
            self.runtime.config.leasing.release(accelerator);
        }
    }
}
