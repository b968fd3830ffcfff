//! Device backend dispatch.
//!
//! The engine is generic over whatever performs the actual bulk copies; the
//! capability is installed once at init and read-only afterwards. The OpenCL
//! shim is compiled behind the `opencl` feature; builds without it (and all
//! builds for CUDA) answer flag-based selection with [Error::UnsupportedApi],
//! and embedders with their own runtime inject an implementation through
//! [crate::init_with_backend].

use crate::stat::Stats;
use crate::{Error, InitFlags, Result};
use std::os::raw::c_void;
use std::time::Instant;

/// An opaque per-device command queue handle supplied at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevQueue(pub *mut c_void);

unsafe impl Send for DevQueue {}
unsafe impl Sync for DevQueue {}

/// An opaque device buffer handle supplied at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevBuffer(pub *mut c_void);

unsafe impl Send for DevBuffer {}
unsafe impl Sync for DevBuffer {}

/// The bulk copy capability of a device runtime.
///
/// Both copies are synchronous: the bytes have landed when the call returns.
pub trait DeviceBackend: Send + Sync {
  /// Copies `nbytes` from host memory at `src` into `buf` at `devoff`.
  fn memcpy_h2d(
    &self,
    queue: DevQueue,
    buf: DevBuffer,
    devoff: usize,
    src: *const u8,
    nbytes: usize,
  ) -> Result<()>;

  /// Copies `nbytes` from `buf` at `devoff` into host memory at `dst`.
  fn memcpy_d2h(
    &self,
    queue: DevQueue,
    buf: DevBuffer,
    devoff: usize,
    dst: *mut u8,
    nbytes: usize,
  ) -> Result<()>;
}

/// Resolves a backend from the API selection flags.
pub fn select(flags: InitFlags) -> Result<Box<dyn DeviceBackend>> {
  let api = flags & (InitFlags::API_OPENCL | InitFlags::API_CUDA);

  if api == InitFlags::API_OPENCL {
    #[cfg(feature = "opencl")]
    {
      return Ok(Box::new(opencl::OpenCl));
    }
    #[cfg(not(feature = "opencl"))]
    {
      return Err(Error::UnsupportedApi);
    }
  }
  if api == InitFlags::API_CUDA {
    // no CUDA shim in this build
    return Err(Error::UnsupportedApi);
  }
  Err(Error::InvalidArgument("exactly one device API flag is required"))
}

/// The installed backend together with the per-device queue table.
pub struct Devices {
  backend: Box<dyn DeviceBackend>,
  queues: Vec<DevQueue>,
}

impl Devices {
  pub fn new(backend: Box<dyn DeviceBackend>, queues: Vec<DevQueue>) -> Self {
    Devices { backend, queues }
  }

  pub fn count(&self) -> usize {
    self.queues.len()
  }

  /// Host to device copy, timed into the statistics.
  pub fn copy_to_device(
    &self,
    stats: &Stats,
    dev: usize,
    buf: DevBuffer,
    devoff: usize,
    src: *const u8,
    nbytes: usize,
  ) -> Result<()> {
    let start = Instant::now();
    self.backend.memcpy_h2d(self.queues[dev], buf, devoff, src, nbytes)?;
    stats.add_copy_time(start.elapsed());
    Ok(())
  }

  /// Device to host copy, timed into the statistics.
  pub fn copy_to_host(
    &self,
    stats: &Stats,
    dev: usize,
    buf: DevBuffer,
    devoff: usize,
    dst: *mut u8,
    nbytes: usize,
  ) -> Result<()> {
    let start = Instant::now();
    self.backend.memcpy_d2h(self.queues[dev], buf, devoff, dst, nbytes)?;
    stats.add_copy_time(start.elapsed());
    Ok(())
  }
}

#[cfg(feature = "opencl")]
mod opencl {
  use super::{DevBuffer, DevQueue, DeviceBackend};
  use crate::{Error, Result};
  use cl_sys::{
    clEnqueueReadBuffer, clEnqueueWriteBuffer, cl_command_queue, cl_int, cl_mem,
    CL_MEM_OBJECT_ALLOCATION_FAILURE, CL_OUT_OF_HOST_MEMORY, CL_OUT_OF_RESOURCES, CL_SUCCESS,
    CL_TRUE,
  };

  /// Blocking OpenCL transfers over the queue supplied at init.
  pub struct OpenCl;

  fn map_error(code: cl_int) -> Error {
    match code {
      CL_MEM_OBJECT_ALLOCATION_FAILURE | CL_OUT_OF_RESOURCES | CL_OUT_OF_HOST_MEMORY => {
        Error::DeviceAlloc
      }
      _ => Error::Internal,
    }
  }

  impl DeviceBackend for OpenCl {
    fn memcpy_h2d(
      &self,
      queue: DevQueue,
      buf: DevBuffer,
      devoff: usize,
      src: *const u8,
      nbytes: usize,
    ) -> Result<()> {
      let code = unsafe {
        clEnqueueWriteBuffer(
          queue.0 as cl_command_queue,
          buf.0 as cl_mem,
          CL_TRUE,
          devoff,
          nbytes,
          src as *const libc::c_void,
          0,
          std::ptr::null(),
          std::ptr::null_mut(),
        )
      };
      if code == CL_SUCCESS {
        Ok(())
      } else {
        Err(map_error(code))
      }
    }

    fn memcpy_d2h(
      &self,
      queue: DevQueue,
      buf: DevBuffer,
      devoff: usize,
      dst: *mut u8,
      nbytes: usize,
    ) -> Result<()> {
      let code = unsafe {
        clEnqueueReadBuffer(
          queue.0 as cl_command_queue,
          buf.0 as cl_mem,
          CL_TRUE,
          devoff,
          nbytes,
          dst as *mut libc::c_void,
          0,
          std::ptr::null(),
          std::ptr::null_mut(),
        )
      };
      if code == CL_SUCCESS {
        Ok(())
      } else {
        Err(map_error(code))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::InitFlags;

  #[test]
  fn selection_requires_exactly_one_api() {
    assert!(matches!(
      select(InitFlags::STAT),
      Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
      select(InitFlags::API_OPENCL | InitFlags::API_CUDA),
      Err(Error::InvalidArgument(_))
    ));
  }

  #[test]
  fn cuda_is_unsupported_in_this_build() {
    assert!(matches!(select(InitFlags::API_CUDA), Err(Error::UnsupportedApi)));
  }

  #[cfg(not(feature = "opencl"))]
  #[test]
  fn opencl_requires_the_feature() {
    assert!(matches!(select(InitFlags::API_OPENCL), Err(Error::UnsupportedApi)));
  }
}
