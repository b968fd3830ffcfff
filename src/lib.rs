#![deny(
  clippy::print_stdout,
  missing_docs,
  nonstandard_style,
  unused,
  warnings
)]
#![allow(non_local_definitions)]
//! Userland coherence for host/accelerator shared arrays.
//!
//! This crate links a host memory range with one or more device-side
//! buffers and guarantees that whichever side next reads a linked byte sees
//! the most recent writes. Coherence is enforced with hardware page
//! protection: after a kernel writes a buffer, the covering host pages are
//! protected, and the first host access traps into a handler that copies
//! the bytes back before the instruction is retried.
//!
//! The expected call sequence per kernel launch:
//!
//! ```text
//! memlink::link(ptr, len, dev, buffer, Placement::OnHost)?;
//! memlink::kernel_begin(ptr, dev, UsageMode::ReadWrite)?;   // pushes bytes out
//! /* enqueue device work, wait for it */
//! memlink::kernel_end(ptr, dev)?;                           // protects pages
//! /* host reads of ptr now trap once and see the kernel's writes */
//! ```
//!
//! Device runtimes with private worker threads must be bracketed with
//! [pre_init] so those threads are never suspended by the engine's
//! stop-the-world machinery.
//!
//! # Platform support
//!
//! Linux (procfs thread enumeration plus a real-time suspension signal) and
//! macOS (mach thread ports). The engine claims the process's SIGSEGV (and,
//! on macOS, SIGBUS) handler; faults it does not own are delegated to the
//! previously installed handler.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure;

pub use crate::api::{
  init, init_with_backend, kernel_begin, kernel_end, link, pre_init, shutdown, stat,
  translate, unlink,
};
pub use crate::backend::{DevBuffer, DevQueue, DeviceBackend};
pub use crate::error::{Error, Result};
pub use crate::stat::{StatParameter, StatValue};

mod api;
mod backend;
mod engine;
mod error;
mod handler;
mod host_array;
mod link;
mod os;
pub mod page;
mod queue;
mod range;
mod region;
mod salloc;
mod sem;
mod stat;
mod store;
mod stw;
mod subreg;
mod sync;
mod tsem;
mod workers;

/// Passed to [unlink] to remove the links of every device at once.
pub const ALL_DEVICES: usize = usize::MAX;

/// Phases of the device-runtime bracketing protocol; see [pre_init].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreInitPhase {
  /// Snapshot the process threads before the device runtime comes up.
  Before,
  /// Diff against the snapshot; the new threads become immune.
  After,
}

/// Where the initial copy of a linked range resides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
  /// The host bytes are current; the device buffer is filled on demand.
  OnHost,
  /// The device buffer is current; host pages are protected immediately.
  OnDevice,
}

/// Declared usage of a device buffer by a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UsageMode {
  /// The kernel only reads the buffer.
  ReadOnly = 1,
  /// The kernel may read and write the buffer.
  ReadWrite = 3,
}

impl UsageMode {
  pub(crate) fn from_raw(raw: u8) -> UsageMode {
    match raw {
      1 => UsageMode::ReadOnly,
      _ => UsageMode::ReadWrite,
    }
  }
}

bitflags! {
  /// Page protection states used by the engine.
  ///
  /// Only the three coherence-relevant combinations occur: `NONE` after a
  /// read-write kernel, `READ` after a read-only kernel, and `READ_WRITE`
  /// when the host holds the current copy of every covered subregion.
  pub struct Protection: usize {
    /// No access allowed at all.
    const NONE = 0;
    /// Read access; writes trap.
    const READ = (1 << 1);
    /// Write access; never installed alone by the engine.
    const WRITE = (1 << 2);
    /// Read and write shorthand.
    const READ_WRITE = (Self::READ.bits | Self::WRITE.bits);
  }
}

bitflags! {
  /// Options recognized by [init].
  pub struct InitFlags: usize {
    /// Dispatch bulk copies through the OpenCL shim.
    const API_OPENCL = 0x1;
    /// Dispatch bulk copies through a CUDA shim (not part of this build).
    const API_CUDA = 0x2;
    /// Collect runtime statistics.
    const STAT = 0x4;
    /// Block the external collector's suspension signal inside writer
    /// sections.
    const WRITER_SIG_BLOCK = 0x8;
    /// Skip the device→host flush pass on [unlink]; device state for the
    /// unlinked range is discarded and the host image may be stale.
    const UNLINK_NO_SYNC_BACK = 0x10;
  }
}

impl std::fmt::Display for Protection {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    const MAPPINGS: &[(Protection, char)] = &[
      (Protection::READ, 'r'),
      (Protection::WRITE, 'w'),
    ];

    for (flag, symbol) in MAPPINGS {
      if self.contains(*flag) {
        write!(f, "{}", symbol)?;
      } else {
        write!(f, "-")?;
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn protection_implements_display() {
    assert_eq!(Protection::NONE.to_string(), "--");
    assert_eq!(Protection::READ.to_string(), "r-");
    assert_eq!(Protection::READ_WRITE.to_string(), "rw");
  }

  #[test]
  fn usage_mode_raw_roundtrips() {
    assert_eq!(UsageMode::from_raw(UsageMode::ReadOnly as u8), UsageMode::ReadOnly);
    assert_eq!(UsageMode::from_raw(UsageMode::ReadWrite as u8), UsageMode::ReadWrite);
  }
}
