//! A link binds one host array to one device-side buffer.

use crate::backend::DevBuffer;
use crate::host_array::HostArray;
use crate::salloc::Salloc;
use crate::Result;
use std::ptr::NonNull;

pub struct Link {
  buf: DevBuffer,
  dev: usize,
  host_array: NonNull<HostArray>,
}

impl Link {
  /// Allocates a link and wires it into the array's slot for `dev`.
  ///
  /// The slot must be empty; callers check for an existing link first.
  pub fn allocate(
    salloc: &mut Salloc,
    buf: DevBuffer,
    dev: usize,
    mut host_array: NonNull<HostArray>,
  ) -> Result<NonNull<Link>> {
    let link = salloc.alloc_value(Link { buf, dev, host_array })?;
    unsafe { host_array.as_mut().set_link(dev, link) };
    Ok(link)
  }

  pub fn buf(&self) -> DevBuffer {
    self.buf
  }

  pub fn dev(&self) -> usize {
    self.dev
  }

  pub fn host_array(&self) -> NonNull<HostArray> {
    self.host_array
  }
}
