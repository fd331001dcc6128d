use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use blkdio::config::{Config, WorkloadOp};
use blkdio::workload;
use rstest::rstest;
use rustix::fs::MemfdFlags;

const DEV_SIZE: u64 = 4 << 20;

/// An anonymous file, reachable by path while the returned fd is alive.
fn memfd(name: &str, len: u64) -> (OwnedFd, PathBuf) {
    let fd = rustix::fs::memfd_create(name, MemfdFlags::CLOEXEC).unwrap();
    rustix::fs::ftruncate(&fd, len).unwrap();
    let path = PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()));
    (fd, path)
}

fn load_config(text: &str) -> (OwnedFd, Config) {
    let (fd, path) = memfd("blkdio-config", 0);
    File::from(fd.try_clone().unwrap())
        .write_all(text.as_bytes())
        .unwrap();
    let config = Config::load(&path).unwrap();
    config.validate().unwrap();
    (fd, config)
}

#[rstest]
fn file_device(
    #[values("sync", "async")] mode: &str,
    #[values("sequential", "random")] pattern: &str,
    #[values(false, true)] poll: bool,
) {
    let (_dev, dev_path) = memfd("blkdio-dev", DEV_SIZE);
    let (_cfg, config) = load_config(&format!(
        r#"
[device.file]
path = "{}"
ring_entries = 16

[engine]
max_segment_vecs = 4

[workload]
op = "verify"
pattern = "{pattern}"
mode = "{mode}"
block_size = "64KiB"
total_size = "1MiB"
offset = "1MiB"
queue_depth = 8
dsync = true
poll = {poll}
seed = 42
"#,
        dev_path.display(),
    ));

    let report = workload::run(&config).unwrap();
    assert_eq!(report.phases.len(), 2);
    for phase in &report.phases {
        assert_eq!(phase.requests, 16);
        assert_eq!(phase.bytes, 1 << 20);
    }
    assert_eq!(report.verified, 16);
    // Each 64KiB block is split into 4 segments of 4 pages.
    assert_eq!(report.engine.segments, 2 * 16 * 4);
    assert_eq!(report.engine.bytes_written, 1 << 20);
}

#[test]
fn memory_device_threaded() {
    let (_cfg, config) = load_config(
        r#"
[device.memory]
size = "8MiB"
completion_threads = 4

[workload]
op = "verify"
pattern = "random"
block_size = "128KiB"
total_size = "8MiB"
queue_depth = 32
"#,
    );
    let report = workload::run(&config).unwrap();
    assert_eq!(report.verified, 64);
    assert_eq!(report.engine.nowait_rejects, 0);
}

#[test]
fn read_only_file_device() {
    let (_dev, dev_path) = memfd("blkdio-dev", DEV_SIZE);
    let (_cfg, mut config) = load_config(&format!(
        r#"
[device.file]
path = "{}"
read_only = true

[workload]
op = "read"
block_size = "4KiB"
total_size = "4MiB"
queue_depth = 4
"#,
        dev_path.display(),
    ));
    let report = workload::run(&config).unwrap();
    assert_eq!(report.phases[0].bytes, DEV_SIZE);
    assert_eq!(report.verified, 0);

    config.workload.op = WorkloadOp::Write;
    assert!(config.validate().is_err());
}

#[test]
fn workload_beyond_file_end() {
    let (_dev, dev_path) = memfd("blkdio-dev", 64 << 10);
    let (_cfg, config) = load_config(&format!(
        r#"
[device.file]
path = "{}"

[workload]
op = "read"
block_size = "64KiB"
total_size = "128KiB"
"#,
        dev_path.display(),
    ));
    let err = workload::run(&config).unwrap_err();
    assert!(err.to_string().contains("device has only 65536 bytes"), "{err}");
}

#[test]
fn time_limit() {
    let (_cfg, config) = load_config(
        r#"
[device.memory]
size = "64MiB"
completion_threads = 0

[workload]
op = "verify"
block_size = "4KiB"
total_size = "64MiB"
time_limit = "1ms"
"#,
    );
    let report = workload::run(&config).unwrap();
    // Whatever is written before the deadline is read back.
    assert!(report.phases[0].requests >= 1);
    assert!(report.phases[1].requests >= 1);
    assert!(report.verified <= report.phases[0].requests);
}
