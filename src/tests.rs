use std::fmt::Write;
use std::io::SeekFrom;
use std::mem;
use std::num::NonZeroUsize;
use std::sync::Arc;

use blkdio_engine::{
    AioCompletion, BlkStatus, Completion, CompletionMode, Cookie, DeviceQueue, DirectIo,
    EngineConfig, IoBuf, IoFlags, IoIter, IoVec, Iocb, MemoryQueue, Op, PoolConfig, Segment,
    SegmentPool, Submitted, MAX_SEGMENT_VECS, PAGE_SIZE,
};
use bytesize::ByteSize;
use parking_lot::Mutex;
use rstest::rstest;
use rustix::fs::FallocateFlags;
use rustix::io::Errno;

use crate::block_file::BlockFile;
use crate::config::{Config, DeviceConfig, Pattern, SubmitMode, WorkloadConfig, WorkloadOp};
use crate::workload::{self, block_pattern};

const DEV_SIZE: u64 = 16 << 10;

/// A memory device logging its control operations.
#[derive(Debug)]
struct TestQueue {
    inner: MemoryQueue,
    flush_ret: Result<(), Errno>,
    log: Mutex<String>,
}

impl TestQueue {
    fn new() -> Self {
        Self {
            inner: MemoryQueue::new(DEV_SIZE, 512, CompletionMode::Inline).unwrap(),
            flush_ret: Ok(()),
            log: Mutex::default(),
        }
    }

    fn drain_log(&self) -> String {
        mem::take(&mut self.log.lock())
    }
}

macro_rules! act {
    ($this:expr, $($tt:tt)*) => {
        write!(*$this.log.lock(), "{};", format_args!($($tt)*)).unwrap()
    };
}

impl DeviceQueue for TestQueue {
    fn logical_block_size(&self) -> u32 {
        self.inner.logical_block_size()
    }

    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn submit(&self, seg: Segment) -> Option<Cookie> {
        self.inner.submit(seg)
    }

    fn flush(&self) -> Result<(), Errno> {
        act!(self, "flush()");
        self.flush_ret
    }

    fn discard(&self, off: u64, len: u64) -> Result<(), Errno> {
        act!(self, "discard({off}, {len})");
        self.inner.discard(off, len)
    }

    fn write_zeroes(&self, off: u64, len: u64, unmap: bool) -> Result<(), Errno> {
        act!(self, "write_zeroes({off}, {len}, {unmap})");
        self.inner.write_zeroes(off, len, unmap)
    }
}

fn new_file(queue: TestQueue, writable: bool) -> BlockFile<TestQueue> {
    new_file_with(queue, writable, crate::engine::MAX_SEGMENT_VECS)
}

fn new_file_with(
    queue: TestQueue,
    writable: bool,
    max_segment_vecs: usize,
) -> BlockFile<TestQueue> {
    let engine = DirectIo::new(
        Arc::new(queue),
        SegmentPool::new(PoolConfig::default()),
        EngineConfig { max_segment_vecs },
    );
    BlockFile::new(Arc::new(engine), writable)
}

fn iter(op: Op, buf: &IoBuf) -> IoIter {
    IoIter::new(op, [IoVec::from(buf.clone())])
}

#[test]
fn read_at_or_beyond_end() {
    let file = new_file(TestQueue::new(), false);
    let buf = IoBuf::new(PAGE_SIZE);
    for pos in [DEV_SIZE, DEV_SIZE + 4096] {
        let mut iocb = Iocb::new(pos, IoFlags::Direct);
        let mut it = iter(Op::Read, &buf);
        let ret = file.read_iter(&mut iocb, &mut it, Completion::Wait);
        assert_eq!(ret, Ok(Submitted::Done(0)));
        assert_eq!(iocb.pos, pos);
        assert_eq!(it.count(), PAGE_SIZE);
    }
}

#[test]
fn read_clamped_at_end() {
    let queue = TestQueue::new();
    queue.inner.write_at(DEV_SIZE - 4096, &[7u8; 4096]);
    let file = new_file(queue, false);

    let buf = IoBuf::new(2 * PAGE_SIZE);
    let mut iocb = Iocb::new(DEV_SIZE - 4096, IoFlags::Direct);
    let mut it = iter(Op::Read, &buf);
    let ret = file.read_iter(&mut iocb, &mut it, Completion::Wait);
    assert_eq!(ret, Ok(Submitted::Done(4096)));
    assert_eq!(iocb.pos, DEV_SIZE);
    // The part beyond the end is given back.
    assert_eq!(it.count(), PAGE_SIZE);
    assert_eq!(buf.to_vec()[..4096], [7u8; 4096]);
    assert_eq!(buf.to_vec()[4096..], [0u8; 4096]);
}

#[test]
fn read_requires_direct() {
    let file = new_file(TestQueue::new(), false);
    let buf = IoBuf::new(PAGE_SIZE);
    let mut iocb = Iocb::new(0, IoFlags::empty());
    let ret = file.read_iter(&mut iocb, &mut iter(Op::Read, &buf), Completion::Wait);
    assert_eq!(ret, Err(Errno::INVAL));
}

#[rstest]
#[case::not_writable(false, false, 0, PAGE_SIZE, IoFlags::Direct, Err(Errno::BADF))]
#[case::read_only(true, true, 0, PAGE_SIZE, IoFlags::Direct, Err(Errno::PERM))]
#[case::empty(true, false, 0, 0, IoFlags::Direct, Ok(Submitted::Done(0)))]
#[case::empty_beyond_end(true, false, DEV_SIZE, 0, IoFlags::Direct, Ok(Submitted::Done(0)))]
#[case::at_end(true, false, DEV_SIZE, PAGE_SIZE, IoFlags::Direct, Err(Errno::NOSPC))]
#[case::nowait_buffered(true, false, 0, PAGE_SIZE, IoFlags::Nowait, Err(Errno::OPNOTSUPP))]
#[case::buffered(true, false, 0, PAGE_SIZE, IoFlags::empty(), Err(Errno::INVAL))]
#[case::ok(true, false, 0, PAGE_SIZE, IoFlags::Direct, Ok(Submitted::Done(PAGE_SIZE)))]
fn write_admission(
    #[case] writable: bool,
    #[case] read_only: bool,
    #[case] pos: u64,
    #[case] len: usize,
    #[case] flags: IoFlags,
    #[case] expect: Result<Submitted, Errno>,
) {
    let queue = TestQueue::new();
    queue.inner.set_read_only(read_only);
    let file = new_file(queue, writable);
    let mut it = if len == 0 {
        IoIter::new(Op::Write, [])
    } else {
        iter(Op::Write, &IoBuf::from_slice(&vec![1u8; len]))
    };
    let mut iocb = Iocb::new(pos, flags);
    let ret = file.write_iter(&mut iocb, &mut it, Completion::Wait);
    assert_eq!(ret, expect);
}

#[test]
fn write_clamped_at_end() {
    let file = new_file(TestQueue::new(), true);
    let buf = IoBuf::from_slice(&[3u8; 3 * PAGE_SIZE]);
    let mut iocb = Iocb::new(DEV_SIZE - 2048, IoFlags::Direct);
    let mut it = iter(Op::Write, &buf);
    let ret = file.write_iter(&mut iocb, &mut it, Completion::Wait);
    assert_eq!(ret, Ok(Submitted::Done(2048)));
    assert_eq!(it.count(), 3 * PAGE_SIZE - 2048);

    let mut tail = [0u8; 2048];
    file.engine().queue().inner.read_at(DEV_SIZE - 2048, &mut tail);
    assert_eq!(tail, [3u8; 2048]);
}

#[test]
fn write_dsync_flushes() {
    let file = new_file(TestQueue::new(), true);
    let buf = IoBuf::from_slice(&[1u8; PAGE_SIZE]);

    let mut iocb = Iocb::new(0, IoFlags::Direct);
    file.write_iter(&mut iocb, &mut iter(Op::Write, &buf), Completion::Wait)
        .unwrap();
    assert_eq!(file.engine().queue().drain_log(), "");

    let mut iocb = Iocb::new(0, IoFlags::Direct | IoFlags::Dsync);
    file.write_iter(&mut iocb, &mut iter(Op::Write, &buf), Completion::Wait)
        .unwrap();
    assert_eq!(file.engine().queue().drain_log(), "flush();");
}

#[test]
fn nowait_rejection_keeps_iterator() {
    let file = new_file_with(TestQueue::new(), true, 1);
    // Crosses the end of device, and needs two segments after clamping.
    let buf = IoBuf::from_slice(&[1u8; 4 * PAGE_SIZE]);
    let mut iocb = Iocb::new(DEV_SIZE - 2 * 4096, IoFlags::Direct | IoFlags::Nowait);
    let mut it = iter(Op::Write, &buf);
    let ret = file.write_iter(&mut iocb, &mut it, Completion::Wait);
    assert_eq!(ret, Err(Errno::AGAIN));
    assert_eq!(it.count(), 4 * PAGE_SIZE);
    assert_eq!(iocb.pos, DEV_SIZE - 2 * 4096);
    assert_eq!(buf.pinned_pages(), 0);
}

#[test]
fn async_write_keeps_position() {
    let file = new_file(TestQueue::new(), true);
    let buf = IoBuf::from_slice(&[5u8; 2 * PAGE_SIZE]);
    let (tx, rx) = std::sync::mpsc::channel();
    let done = Box::new(move |ret: AioCompletion| tx.send(ret).unwrap());
    let mut iocb = Iocb::new(4096, IoFlags::Direct);
    let ret = file.write_iter(&mut iocb, &mut iter(Op::Write, &buf), Completion::Notify(done));
    assert!(matches!(ret, Ok(Submitted::Queued { .. })));
    assert_eq!(iocb.pos, 4096);
    let ret = rx.recv().unwrap();
    assert_eq!(ret.res, Ok(2 * PAGE_SIZE));
    assert_eq!(ret.pos, 4096 + 2 * 4096);
}

#[test]
fn sequential_read_write() {
    let mut file = new_file(TestQueue::new(), true);
    let data = block_pattern(1, 0, 2 * PAGE_SIZE);
    let buf = IoBuf::from_slice(&data);
    assert_eq!(file.write(&mut iter(Op::Write, &buf), IoFlags::Direct), Ok(data.len()));
    assert_eq!(file.position(), data.len() as u64);

    assert_eq!(file.seek(SeekFrom::Start(0)), Ok(0));
    let out = IoBuf::new(PAGE_SIZE);
    assert_eq!(file.read(&mut iter(Op::Read, &out), IoFlags::Direct), Ok(PAGE_SIZE));
    assert_eq!(out.to_vec(), data[..PAGE_SIZE]);
    assert_eq!(file.read(&mut iter(Op::Read, &out), IoFlags::Direct), Ok(PAGE_SIZE));
    assert_eq!(out.to_vec(), data[PAGE_SIZE..]);
    assert_eq!(file.position(), data.len() as u64);
}

#[rstest]
#[case(SeekFrom::Start(0), Ok(0))]
#[case(SeekFrom::Start(DEV_SIZE), Ok(DEV_SIZE))]
#[case(SeekFrom::Start(DEV_SIZE + 1), Err(Errno::INVAL))]
#[case(SeekFrom::Current(-4096), Ok(4096))]
#[case(SeekFrom::Current(-8193), Err(Errno::INVAL))]
#[case(SeekFrom::Current(100), Ok(8292))]
#[case(SeekFrom::End(0), Ok(DEV_SIZE))]
#[case(SeekFrom::End(-512), Ok(DEV_SIZE - 512))]
#[case(SeekFrom::End(1), Err(Errno::INVAL))]
fn seek(#[case] to: SeekFrom, #[case] expect: Result<u64, Errno>) {
    let mut file = new_file(TestQueue::new(), false);
    file.seek(SeekFrom::Start(8192)).unwrap();
    assert_eq!(file.seek(to), expect);
    let pos = expect.unwrap_or(8192);
    assert_eq!(file.position(), pos);
}

#[rstest]
#[case::ok(Ok(()), Ok(()))]
#[case::unsupported(Err(Errno::OPNOTSUPP), Ok(()))]
#[case::failed(Err(Errno::IO), Err(Errno::IO))]
fn fsync(#[case] flush_ret: Result<(), Errno>, #[case] expect: Result<(), Errno>) {
    let queue = TestQueue {
        flush_ret,
        ..TestQueue::new()
    };
    let file = new_file(queue, false);
    assert_eq!(file.fsync(), expect);
    assert_eq!(file.engine().queue().drain_log(), "flush();");
}

#[rstest]
#[case::zero_range(FallocateFlags::ZERO_RANGE, 512, 1024, Ok(()), "write_zeroes(512, 1024, false);")]
#[case::zero_range_keep_size(
    FallocateFlags::ZERO_RANGE | FallocateFlags::KEEP_SIZE,
    0,
    512,
    Ok(()),
    "write_zeroes(0, 512, false);"
)]
#[case::punch_hole(
    FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
    4096,
    4096,
    Ok(()),
    "write_zeroes(4096, 4096, true);"
)]
#[case::discard(
    FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE | FallocateFlags::NO_HIDE_STALE,
    0,
    DEV_SIZE,
    Ok(()),
    "discard(0, 16384);"
)]
#[case::clamped(
    FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
    DEV_SIZE - 512,
    4096,
    Ok(()),
    "write_zeroes(15872, 512, true);"
)]
#[case::beyond_end(FallocateFlags::ZERO_RANGE, DEV_SIZE - 512, 4096, Err(Errno::INVAL), "")]
#[case::start_at_end(FallocateFlags::ZERO_RANGE | FallocateFlags::KEEP_SIZE, DEV_SIZE, 512, Err(Errno::INVAL), "")]
#[case::misaligned_start(FallocateFlags::ZERO_RANGE, 100, 512, Err(Errno::INVAL), "")]
#[case::misaligned_len(FallocateFlags::ZERO_RANGE, 0, 1000, Err(Errno::INVAL), "")]
#[case::empty(FallocateFlags::ZERO_RANGE, 0, 0, Err(Errno::INVAL), "")]
#[case::punch_without_keep_size(FallocateFlags::PUNCH_HOLE, 0, 512, Err(Errno::OPNOTSUPP), "")]
#[case::allocate(FallocateFlags::empty(), 0, 512, Err(Errno::OPNOTSUPP), "")]
#[case::keep_size_only(FallocateFlags::KEEP_SIZE, 0, 512, Err(Errno::OPNOTSUPP), "")]
#[case::collapse(FallocateFlags::COLLAPSE_RANGE, 0, 512, Err(Errno::OPNOTSUPP), "")]
fn fallocate(
    #[case] mode: FallocateFlags,
    #[case] start: u64,
    #[case] len: u64,
    #[case] expect: Result<(), Errno>,
    #[case] expect_log: &str,
) {
    let queue = TestQueue::new();
    queue.inner.write_at(0, &[0xFF; DEV_SIZE as usize]);
    let file = new_file(queue, true);
    assert_eq!(file.fallocate(mode, start, len), expect);
    let queue = file.engine().queue();
    assert_eq!(queue.drain_log(), expect_log);

    if expect.is_ok() {
        let end = (start + len).min(DEV_SIZE);
        let mut data = vec![0u8; DEV_SIZE as usize];
        queue.inner.read_at(0, &mut data);
        let (start, end) = (start as usize, end as usize);
        assert!(data[..start].iter().all(|&b| b == 0xFF));
        assert!(data[start..end].iter().all(|&b| b == 0));
        assert!(data[end..].iter().all(|&b| b == 0xFF));
    }
}

#[test]
fn fallocate_not_writable() {
    let file = new_file(TestQueue::new(), false);
    assert_eq!(
        file.fallocate(FallocateFlags::ZERO_RANGE, 0, 512),
        Err(Errno::BADF)
    );
    assert_eq!(file.engine().queue().drain_log(), "");
}

const CONFIG: &str = r#"
[device.memory]
size = "1MiB"

[workload]
op = "verify"
block_size = "16KiB"
total_size = "256KiB"
"#;

fn parse_config(extra: &str) -> Config {
    toml::from_str(&format!("{CONFIG}{extra}")).unwrap()
}

#[test]
fn config_defaults() {
    let config = parse_config("");
    assert_eq!(
        config.device,
        DeviceConfig::Memory(crate::config::MemoryDeviceConfig {
            size: ByteSize::mib(1),
            logical_block_size: ByteSize::b(512),
            completion_threads: 1,
        })
    );
    assert_eq!(config.engine, crate::config::EngineOptions::default());
    let w = &config.workload;
    assert_eq!(w.op, WorkloadOp::Verify);
    assert_eq!(w.pattern, Pattern::Sequential);
    assert_eq!(w.mode, SubmitMode::Async);
    assert_eq!(w.queue_depth, NonZeroUsize::new(1).unwrap());
    assert_eq!(w.time_limit, None);
    assert!(!w.nowait && !w.dsync && !w.poll);
    config.validate().unwrap();
}

#[test]
fn config_roundtrip() {
    let config = parse_config("time_limit = \"1m 30s\"\nqueue_depth = 8\n");
    assert_eq!(
        config.workload.time_limit,
        Some(std::time::Duration::from_secs(90))
    );
    let out = toml::to_string_pretty(&config).unwrap();
    assert_eq!(toml::from_str::<Config>(&out).unwrap(), config);
}

#[test]
fn config_unknown_field() {
    let ret = toml::from_str::<Config>(&format!("{CONFIG}bogus = 1\n"));
    assert!(ret.is_err());
}

#[rstest]
#[case::block_size(|w: &mut WorkloadConfig| w.block_size = ByteSize::b(1000), "block_size")]
#[case::total_size(|w: &mut WorkloadConfig| w.total_size = ByteSize::kib(40), "total_size")]
#[case::offset(|w: &mut WorkloadConfig| w.offset = ByteSize::b(100), "offset")]
#[case::exceeds(|w: &mut WorkloadConfig| w.offset = ByteSize::mib(1), "end of device")]
fn config_invalid(#[case] patch: fn(&mut WorkloadConfig), #[case] expect_msg: &str) {
    let mut config = parse_config("");
    patch(&mut config.workload);
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains(expect_msg), "{err}");
}

#[test]
fn config_read_only_write() {
    let config: Config = toml::from_str(
        r#"
[device.file]
path = "/dev/null"
read_only = true

[workload]
op = "write"
block_size = "4KiB"
total_size = "4KiB"
"#,
    )
    .unwrap();
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("read-only"), "{err}");
}

fn memory_config(lbs: &str) -> Config {
    toml::from_str(&format!(
        r#"
[device.memory]
size = "1MiB"
logical_block_size = "{lbs}"

[workload]
op = "verify"
block_size = "16KiB"
total_size = "64KiB"
"#
    ))
    .unwrap()
}

#[rstest]
#[case::not_power_of_two("768B")]
#[case::below_sector("256B")]
#[case::above_page("8KiB")]
fn config_invalid_lbs(#[case] lbs: &str) {
    let err = memory_config(lbs).validate().unwrap_err().to_string();
    assert!(err.contains("logical block size"), "{err}");
}

#[rstest]
#[case::zero(0)]
#[case::too_many(MAX_SEGMENT_VECS + 1)]
#[case::max(usize::MAX)]
fn config_invalid_segment_vecs(#[case] max_segment_vecs: usize) {
    let mut config = parse_config("");
    config.engine.max_segment_vecs = max_segment_vecs;
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("max_segment_vecs"), "{err}");
}

#[tokio::test]
async fn workload_page_sized_blocks() {
    let config = memory_config("4KiB");
    config.validate().unwrap();

    let file = Arc::new(workload::open_file(&config).unwrap());
    let report = workload::run_on(file, &config.workload).await.unwrap();
    assert_eq!(report.verified, 4);
    assert_eq!(report.engine.alignment_rejects, 0);
}

#[rstest]
#[tokio::test]
async fn workload_memory(
    #[values(SubmitMode::Sync, SubmitMode::Async)] mode: SubmitMode,
    #[values(Pattern::Sequential, Pattern::Random)] pattern: Pattern,
    #[values(1, 4)] queue_depth: usize,
) {
    let mut config = parse_config("");
    config.workload.mode = mode;
    config.workload.pattern = pattern;
    config.workload.queue_depth = NonZeroUsize::new(queue_depth).unwrap();
    config.validate().unwrap();

    let file = Arc::new(workload::open_file(&config).unwrap());
    let report = workload::run_on(file, &config.workload).await.unwrap();
    assert_eq!(report.phases.len(), 2);
    assert_eq!(report.phases[0].op, Op::Write);
    assert_eq!(report.phases[1].op, Op::Read);
    for phase in &report.phases {
        assert_eq!(phase.requests, 16);
        assert_eq!(phase.bytes, 256 << 10);
        assert_eq!(phase.retries, 0);
    }
    assert_eq!(report.verified, 16);
    assert_eq!(report.engine.bytes_written, 256 << 10);
    assert_eq!(report.engine.bytes_read, 256 << 10);
}

#[tokio::test]
async fn workload_nowait_retries() {
    let mut config = parse_config("");
    config.engine.max_segment_vecs = 1;
    config.workload.nowait = true;
    config.validate().unwrap();

    let file = Arc::new(workload::open_file(&config).unwrap());
    let report = workload::run_on(file, &config.workload).await.unwrap();
    // Every 16KiB block spans 4 pages, which cannot be submitted without blocking.
    for phase in &report.phases {
        assert_eq!(phase.retries, 16);
    }
    assert_eq!(report.engine.nowait_rejects, 32);
    assert_eq!(report.verified, 16);
}

#[tokio::test]
async fn workload_polled() {
    let mut config = parse_config("");
    config.workload.poll = true;
    config.workload.queue_depth = NonZeroUsize::new(4).unwrap();
    let file = Arc::new(workload::open_file(&config).unwrap());
    let report = workload::run_on(file, &config.workload).await.unwrap();
    assert_eq!(report.verified, 16);
}

#[tokio::test]
async fn workload_device_error() {
    let config = parse_config("");
    let queue = Arc::new(MemoryQueue::new(1 << 20, 512, CompletionMode::Inline).unwrap());
    queue.inject_error(32 << 10..33 << 10, BlkStatus::Medium);
    let engine = DirectIo::new(
        Arc::clone(&queue) as Arc<dyn DeviceQueue>,
        SegmentPool::new(config.engine.pool_config()),
        config.engine.engine_config(),
    );
    let file = Arc::new(BlockFile::new(Arc::new(engine), true));

    let err = workload::run_on(Arc::clone(&file), &config.workload)
        .await
        .unwrap_err();
    assert_eq!(
        format!("{err:#}"),
        "Write at 32768 failed: No data available (os error 61)"
    );

    queue.clear_errors();
    let report = workload::run_on(file, &config.workload).await.unwrap();
    assert_eq!(report.verified, 16);
}
