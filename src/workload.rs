//! Drive a device through the engine with a configured workload.
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use blkdio_engine::{
    AioCompletion, Completion, CompletionMode, DeviceQueue, DirectIo, IoBuf, IoFlags, IoIter,
    IoStats, IoVec, Iocb, MemoryQueue, Op, SegmentPool, Submitted, UringConfig, UringQueue,
};
use bytesize::ByteSize;
use futures_util::{stream, StreamExt};
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rustix::io::Errno;
use tokio::sync::oneshot;

use crate::block_file::BlockFile;
use crate::config::{Config, DeviceConfig, Pattern, SubmitMode, WorkloadConfig, WorkloadOp};

pub type DynBlockFile = BlockFile<dyn DeviceQueue>;

/// Create the device queue described by `config`.
pub fn open_device(config: &DeviceConfig) -> Result<Arc<dyn DeviceQueue>> {
    let queue: Arc<dyn DeviceQueue> = match config {
        DeviceConfig::Memory(c) => {
            let mode = match NonZeroUsize::new(c.completion_threads) {
                None => CompletionMode::Inline,
                Some(n) => CompletionMode::Threaded(n),
            };
            let queue = MemoryQueue::new(c.size.0, c.logical_block_size.0 as u32, mode)
                .context("failed to create memory device")?;
            Arc::new(queue)
        }
        DeviceConfig::File(c) => {
            let uring_config = UringConfig {
                entries: c.ring_entries,
                direct: c.direct,
                logical_block_size: c.logical_block_size.0 as u32,
                read_only: c.read_only,
            };
            let queue = UringQueue::open(&c.path, &uring_config)
                .with_context(|| format!("failed to open {}", c.path.display()))?;
            Arc::new(queue)
        }
    };
    tracing::debug!(
        capacity = queue.capacity(),
        lbs = queue.logical_block_size(),
        "device opened"
    );
    Ok(queue)
}

/// Open the device of `config` and wrap it in an engine.
pub fn open_file(config: &Config) -> Result<DynBlockFile> {
    let queue = open_device(&config.device)?;
    let pool = SegmentPool::new(config.engine.pool_config());
    let engine = DirectIo::new(queue, pool, config.engine.engine_config());
    let writable = config.workload.op != WorkloadOp::Read;
    Ok(BlockFile::new(Arc::new(engine), writable))
}

/// Statistics of one pass over the workload range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReport {
    pub op: Op,
    pub requests: u64,
    pub bytes: u64,
    /// Requests rejected with `EAGAIN` under `nowait` and reissued without it.
    pub retries: u64,
    pub elapsed: Duration,
}

impl PhaseReport {
    /// Bytes per second.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput(&self) -> ByteSize {
        if self.elapsed.is_zero() {
            return ByteSize(0);
        }
        ByteSize((self.bytes as f64 / self.elapsed.as_secs_f64()) as u64)
    }
}

impl fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            Op::Read => "read",
            Op::Write => "write",
        };
        write!(
            f,
            "{op}: {} requests, {} in {}, {}/s",
            self.requests,
            ByteSize(self.bytes),
            humantime::format_duration(self.elapsed),
            self.throughput(),
        )?;
        if self.retries != 0 {
            write!(f, ", {} retries", self.retries)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub phases: Vec<PhaseReport>,
    /// Blocks compared after reading back.
    pub verified: u64,
    pub engine: IoStats,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.phases.iter().join("; "))?;
        if self.verified != 0 {
            write!(f, "; {} blocks verified", self.verified)?;
        }
        Ok(())
    }
}

/// Run the workload of `config` to completion on a fresh device.
pub fn run(config: &Config) -> Result<Report> {
    let file = Arc::new(open_file(config)?);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run_on(file, &config.workload))
}

/// Run `config` against an opened file.
pub async fn run_on(file: Arc<DynBlockFile>, config: &WorkloadConfig) -> Result<Report> {
    let end = config.offset.0 + config.total_size.0;
    ensure!(
        end <= file.size(),
        "workload range ends at {end} but the device has only {} bytes",
        file.size(),
    );

    let runner = Runner {
        file,
        config: *config,
        retries: AtomicU64::new(0),
        verified: AtomicU64::new(0),
    };
    let all = runner.positions();
    let phases = match config.op {
        WorkloadOp::Read => vec![runner.phase(Op::Read, all).await?.0],
        WorkloadOp::Write => vec![runner.phase(Op::Write, all).await?.0],
        WorkloadOp::Verify => {
            let (write, written) = runner.phase(Op::Write, all).await?;
            // Only blocks written before the time limit can be checked.
            let (read, _) = runner.phase(Op::Read, written).await?;
            vec![write, read]
        }
    };
    for phase in &phases {
        tracing::info!(%phase, "phase finished");
    }
    let engine = runner.file.engine().stats();
    tracing::debug!(?engine, "engine counters");
    Ok(Report {
        phases,
        verified: runner.verified.load(Ordering::Relaxed),
        engine,
    })
}

struct Runner {
    file: Arc<DynBlockFile>,
    config: WorkloadConfig,
    retries: AtomicU64,
    verified: AtomicU64,
}

impl Runner {
    fn block_size(&self) -> usize {
        self.config.block_size.0 as usize
    }

    fn positions(&self) -> Vec<u64> {
        let bs = self.config.block_size.0;
        let mut positions = (0..self.config.total_size.0 / bs)
            .map(|i| self.config.offset.0 + i * bs)
            .collect_vec();
        if self.config.pattern == Pattern::Random {
            positions.shuffle(&mut StdRng::seed_from_u64(self.config.seed));
        }
        positions
    }

    fn flags(&self) -> IoFlags {
        let mut flags = IoFlags::Direct;
        for (set, flag) in [
            (self.config.nowait, IoFlags::Nowait),
            (self.config.dsync, IoFlags::Dsync),
            (self.config.poll, IoFlags::Hipri),
        ] {
            flags.set(flag, set);
        }
        flags
    }

    /// Issue `op` on every block of `positions`. Returns the report and the positions done.
    async fn phase(&self, op: Op, positions: Vec<u64>) -> Result<(PhaseReport, Vec<u64>)> {
        tracing::info!(
            ?op,
            pattern = ?self.config.pattern,
            mode = ?self.config.mode,
            blocks = positions.len(),
            "phase started"
        );
        let retries_before = self.retries.load(Ordering::Relaxed);
        let start = Instant::now();
        let mut report = PhaseReport {
            op,
            requests: 0,
            bytes: 0,
            retries: 0,
            elapsed: Duration::ZERO,
        };
        let mut done = Vec::with_capacity(positions.len());

        let mut requests = stream::iter(positions)
            .map(|pos| self.request(op, pos))
            .buffer_unordered(self.config.queue_depth.get());
        while let Some(ret) = requests.next().await {
            let (pos, len) = ret?;
            done.push(pos);
            report.bytes += len as u64;
            report.requests += 1;
            if self
                .config
                .time_limit
                .is_some_and(|limit| start.elapsed() >= limit)
            {
                tracing::info!(requests = report.requests, "time limit reached");
                break;
            }
        }

        report.elapsed = start.elapsed();
        report.retries = self.retries.load(Ordering::Relaxed) - retries_before;
        Ok((report, done))
    }

    async fn request(&self, op: Op, pos: u64) -> Result<(u64, usize)> {
        let bs = self.block_size();
        let buf = match op {
            Op::Read => IoBuf::new(bs),
            Op::Write => IoBuf::from_slice(&block_pattern(self.config.seed, pos, bs)),
        };

        let mut flags = self.flags();
        let len = loop {
            let ret = match self.config.mode {
                SubmitMode::Sync => self.submit_sync(op, pos, &buf, flags).await?,
                SubmitMode::Async => self.submit_async(op, pos, &buf, flags).await?,
            };
            match ret {
                Err(Errno::AGAIN) if flags.contains(IoFlags::Nowait) => {
                    tracing::trace!(pos, "request would block, retrying without nowait");
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    flags.remove(IoFlags::Nowait);
                }
                ret => break ret.with_context(|| format!("{op:?} at {pos} failed"))?,
            }
        };
        ensure!(
            len == buf.len(),
            "short {op:?} at {pos}: {len} of {} bytes",
            buf.len()
        );

        if op == Op::Read && self.config.op == WorkloadOp::Verify {
            let expect = block_pattern(self.config.seed, pos, len);
            if buf.to_vec() != expect {
                bail!("data mismatch in block at {pos}");
            }
            self.verified.fetch_add(1, Ordering::Relaxed);
        }
        Ok((pos, len))
    }

    /// Submit on a blocking thread and wait there.
    async fn submit_sync(
        &self,
        op: Op,
        pos: u64,
        buf: &IoBuf,
        flags: IoFlags,
    ) -> Result<Result<usize, Errno>> {
        let file = Arc::clone(&self.file);
        let buf = buf.clone();
        tokio::task::spawn_blocking(move || {
            let mut iocb = Iocb::new(pos, flags);
            let mut iter = IoIter::new(op, [IoVec::from(buf)]);
            let ret = match op {
                Op::Read => file.read_iter(&mut iocb, &mut iter, Completion::Wait),
                Op::Write => file.write_iter(&mut iocb, &mut iter, Completion::Wait),
            };
            ret.map(|ret| match ret {
                Submitted::Done(n) => n,
                Submitted::Queued { .. } => unreachable!("synchronous request is queued"),
            })
        })
        .await
        .context("request task panicked")
    }

    /// Submit with a completion callback, and wait for it without blocking the runtime.
    async fn submit_async(
        &self,
        op: Op,
        pos: u64,
        buf: &IoBuf,
        flags: IoFlags,
    ) -> Result<Result<usize, Errno>> {
        let (tx, mut rx) = oneshot::channel();
        let done = Box::new(move |ret: AioCompletion| {
            // The receiver is gone if the workload is aborted.
            let _: Result<_, _> = tx.send(ret);
        });
        let mut iocb = Iocb::new(pos, flags);
        let mut iter = IoIter::new(op, [IoVec::from(buf.clone())]);
        let ret = match op {
            Op::Read => self
                .file
                .read_iter(&mut iocb, &mut iter, Completion::Notify(done)),
            Op::Write => self
                .file
                .write_iter(&mut iocb, &mut iter, Completion::Notify(done)),
        };
        let cookie = match ret {
            Ok(Submitted::Done(n)) => return Ok(Ok(n)),
            Ok(Submitted::Queued { cookie }) => cookie,
            Err(err) => return Ok(Err(err)),
        };

        let completion = match cookie {
            None => rx.await.context("request is dropped without completion")?,
            Some(cookie) => loop {
                match rx.try_recv() {
                    Ok(ret) => break ret,
                    Err(oneshot::error::TryRecvError::Empty) => {
                        if !self.file.iopoll(cookie, false) {
                            tokio::task::yield_now().await;
                        }
                    }
                    Err(oneshot::error::TryRecvError::Closed) => {
                        bail!("request is dropped without completion")
                    }
                }
            },
        };
        Ok(completion.res)
    }
}

/// Deterministic content of the block at `pos`.
#[must_use]
pub fn block_pattern(seed: u64, pos: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed ^ pos.rotate_left(32)).fill_bytes(&mut data);
    data
}
