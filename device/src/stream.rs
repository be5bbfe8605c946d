//! In-order command stream.
//!
//! Each device owns one [`Stream`]: a worker thread draining a FIFO of [`Command`]s. Submitting
//! never blocks on execution; [`Stream::synchronize`] blocks until every command issued before the
//! call has retired. Buffers are bound to the first stream that receives them, and
//! [`Stream::read`] holds off new submissions while it copies, so the worker is the only writer of
//! a buffer and never runs alongside a host read.
//!
//! ```ignore
//! stream.submit(Command::Fill { dst: raw.clone(), value: 0.0 })?;
//! stream.submit(Command::Launch { program, args, range })?;
//! stream.synchronize()?; // both commands have run, in that order
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use snafu::ensure;

use crate::buffer::RawBuffer;
use crate::error::{ForeignStreamSnafu, Result, RuntimeSnafu, SizeMismatchSnafu, StreamClosedSnafu, StreamFaultSnafu};
use crate::kernel::{KernelArg, KernelArgs, Program};
use crate::sync::{HostSignal, TimelineSignal};

/// Work item executed by a stream.
pub enum Command {
    /// Overwrite every element of `dst`.
    Fill { dst: Arc<RawBuffer>, value: f32 },
    /// Upload host data into `dst`.
    CopyIn { dst: Arc<RawBuffer>, data: Vec<f32> },
    /// Run a compiled kernel over `range`.
    Launch { program: Arc<dyn Program>, args: KernelArgs, range: Range<usize> },
}

impl Command {
    fn buffers(&self) -> impl Iterator<Item = &RawBuffer> {
        let (single, args) = match self {
            Command::Fill { dst, .. } | Command::CopyIn { dst, .. } => (Some(dst.as_ref()), &[][..]),
            Command::Launch { args, .. } => (None, &args[..]),
        };
        single.into_iter().chain(args.iter().filter_map(|arg| match arg {
            KernelArg::Buffer(raw) => Some(raw.as_ref()),
            KernelArg::Scalar(_) => None,
        }))
    }

    /// # Safety
    ///
    /// Every buffer of the command must be bound to the calling stream's worker.
    unsafe fn execute(self) -> Result<()> {
        match self {
            Command::Fill { dst, value } => {
                unsafe { dst.fill(value) };
                Ok(())
            }
            Command::CopyIn { dst, data } => unsafe { dst.copy_from(&data) },
            Command::Launch { program, args, range } => unsafe { program.execute(&args, range) },
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Fill { dst, value } => {
                f.debug_struct("Fill").field("len", &dst.len()).field("value", value).finish()
            }
            Command::CopyIn { dst, .. } => f.debug_struct("CopyIn").field("len", &dst.len()).finish(),
            Command::Launch { program, args, range } => f
                .debug_struct("Launch")
                .field("program", &program.name())
                .field("args", &args.len())
                .field("range", range)
                .finish(),
        }
    }
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Command>,
    /// Tickets issued so far; ticket `n` is the n-th submitted command.
    issued: u64,
    closed: bool,
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

struct Shared {
    id: u64,
    name: String,
    queue: Mutex<Queue>,
    available: Condvar,
    retired: HostSignal,
    fault: Mutex<Option<String>>,
}

/// FIFO command stream backed by a dedicated worker thread.
pub struct Stream {
    shared: Arc<Shared>,
    /// Held by submitters and by host reads, so no command is queued while a read copies.
    gate: Mutex<()>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Start a stream whose worker thread is named after `name`.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            name: name.clone(),
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
            retired: HostSignal::new(),
            fault: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("tessera-stream-{name}"))
            .spawn(move || run(&worker_shared))
            .map_err(|e| RuntimeSnafu { message: format!("failed to start stream for {name}: {e}") }.build())?;

        Ok(Self { shared, gate: Mutex::new(()), worker: Some(worker) })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue `command` and return its ticket.
    ///
    /// Fails with [`ForeignStream`](crate::Error::ForeignStream) when a buffer of the command is
    /// bound to another stream.
    pub fn submit(&self, command: Command) -> Result<u64> {
        let _gate = self.gate.lock();
        if let Some(raw) = command.buffers().find(|raw| !raw.bind(self.shared.id)) {
            return ForeignStreamSnafu { device: self.shared.name.clone(), len: raw.len() }.fail();
        }

        let mut queue = self.shared.queue.lock();
        ensure!(!queue.closed, StreamClosedSnafu { device: self.shared.name.clone() });

        tracing::trace!(stream = %self.shared.name, ?command, "submit");
        queue.pending.push_back(command);
        queue.issued += 1;
        let ticket = queue.issued;
        drop(queue);

        self.shared.available.notify_one();
        Ok(ticket)
    }

    /// Block until every command submitted so far has retired.
    ///
    /// Reports the first command failure observed on this stream, if any.
    pub fn synchronize(&self) -> Result<()> {
        let target = self.shared.queue.lock().issued;
        self.shared.retired.wait(target, None)?;

        if let Some(reason) = self.shared.fault.lock().clone() {
            return StreamFaultSnafu { device: self.shared.name.clone(), reason }.fail();
        }
        Ok(())
    }

    /// Drain the stream, then copy `src` to the host before anything else can be queued.
    pub fn read(&self, src: &RawBuffer, dst: &mut [f32]) -> Result<()> {
        ensure!(dst.len() == src.len(), SizeMismatchSnafu { expected: src.len(), actual: dst.len() });
        ensure!(src.bind(self.shared.id), ForeignStreamSnafu { device: self.shared.name.clone(), len: src.len() });

        let _gate = self.gate.lock();
        self.synchronize()?;
        // SAFETY: the stream has drained and the gate keeps new commands out until the copy is done.
        unsafe { src.copy_to(dst) }
    }

    /// Number of commands submitted so far.
    pub fn issued(&self) -> u64 {
        self.shared.queue.lock().issued
    }

    /// Number of commands that have finished executing.
    pub fn retired(&self) -> u64 {
        self.shared.retired.value()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.shared.name)
            .field("issued", &self.issued())
            .field("retired", &self.retired())
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.queue.lock().closed = true;
        self.shared.available.notify_all();

        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!(stream = %self.shared.name, "stream worker panicked during shutdown");
        }
    }
}

/// Worker loop: drain the queue in order, then exit once the stream is closed and empty.
fn run(shared: &Shared) {
    let mut retired = 0u64;
    loop {
        let command = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(command) = queue.pending.pop_front() {
                    break Some(command);
                }
                if queue.closed {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };
        let Some(command) = command else {
            return;
        };

        // SAFETY: `submit` bound every buffer of the command to this stream, and this worker runs
        // one command at a time.
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| unsafe { command.execute() })) {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(payload) => Err(panic_message(payload.as_ref())),
        };
        if let Err(reason) = outcome {
            tracing::error!(stream = %shared.name, %reason, "command failed");
            shared.fault.lock().get_or_insert(reason);
        }

        retired += 1;
        shared.retired.set(retired);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("kernel panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("kernel panicked: {message}")
    } else {
        "kernel panicked".to_string()
    }
}
