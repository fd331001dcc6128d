//! Run direct I/O workloads against block devices through the [`blkdio_engine`] engine.
pub mod block_file;
pub mod config;
pub mod workload;

#[cfg(test)]
mod tests;

pub use blkdio_engine as engine;
