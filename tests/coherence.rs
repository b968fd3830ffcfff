//! End-to-end coherence tests against a heap-backed device.
//!
//! The backend mirrors "device buffers" in process memory, so the whole
//! protection-and-copy-back pipeline runs without a GPU. The engine is
//! process-wide; it is initialized once for this file.

use memlink::{
  DevBuffer, DevQueue, DeviceBackend, Error, InitFlags, Placement, Result, StatParameter,
  StatValue, UsageMode, ALL_DEVICES,
};
use std::sync::{Mutex, MutexGuard, Once};

/// Statistics are process-wide, so tests asserting on them run one at a
/// time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
  match SERIAL.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

/// Copies between host memory and a plain allocation standing in for the
/// device buffer.
struct MirrorBackend;

impl DeviceBackend for MirrorBackend {
  fn memcpy_h2d(
    &self,
    _queue: DevQueue,
    buf: DevBuffer,
    devoff: usize,
    src: *const u8,
    nbytes: usize,
  ) -> Result<()> {
    unsafe { std::ptr::copy_nonoverlapping(src, (buf.0 as *mut u8).add(devoff), nbytes) };
    Ok(())
  }

  fn memcpy_d2h(
    &self,
    _queue: DevQueue,
    buf: DevBuffer,
    devoff: usize,
    dst: *mut u8,
    nbytes: usize,
  ) -> Result<()> {
    unsafe { std::ptr::copy_nonoverlapping((buf.0 as *const u8).add(devoff), dst, nbytes) };
    Ok(())
  }
}

const NDEVS: usize = 2;

fn setup() {
  static INIT: Once = Once::new();
  INIT.call_once(|| {
    let _ = env_logger::builder().is_test(true).try_init();
    let queues = [DevQueue(0x10 as *mut _), DevQueue(0x20 as *mut _)];
    memlink::init_with_backend(&queues, InitFlags::STAT, Box::new(MirrorBackend)).unwrap();
  });
}

/// Leaks a host buffer of `len` bytes starting on a page boundary.
fn host_buffer(len: usize) -> *mut u8 {
  let map = memmap::MmapMut::map_anon(len).unwrap();
  let ptr = map.as_ptr() as *mut u8;
  std::mem::forget(map);
  ptr
}

/// Leaks a "device" buffer of `len` bytes.
fn device_buffer(len: usize) -> DevBuffer {
  let storage = vec![0u8; len].into_boxed_slice();
  DevBuffer(Box::leak(storage).as_mut_ptr() as *mut _)
}

fn page_faults() -> u64 {
  match memlink::stat(StatParameter::PageFaults).unwrap() {
    StatValue::Count(count) => count,
    other => panic!("unexpected stat value {:?}", other),
  }
}

#[test]
fn add_arrays_on_one_device() {
  let _serial = serial();
  setup();
  let size = 13 * 1024 + 64;

  let a = host_buffer(size);
  let b = host_buffer(size);
  let c = host_buffer(size);
  let (da, db, dc) = (device_buffer(size), device_buffer(size), device_buffer(size));

  unsafe {
    for i in 0..size {
      *a.add(i) = i as u8;
      *b.add(i) = (i + 1) as u8;
    }

    memlink::link(a, size, 0, da, Placement::OnHost).unwrap();
    memlink::link(b, size, 0, db, Placement::OnHost).unwrap();
    memlink::link(c, size, 0, dc, Placement::OnHost).unwrap();

    memlink::kernel_begin(a, 0, UsageMode::ReadWrite).unwrap();
    memlink::kernel_begin(b, 0, UsageMode::ReadWrite).unwrap();
    memlink::kernel_begin(c, 0, UsageMode::ReadWrite).unwrap();

    // the "kernel": c = a + b over the device copies
    for i in 0..size {
      let sum = (*(da.0 as *const u8).add(i)).wrapping_add(*(db.0 as *const u8).add(i));
      *(dc.0 as *mut u8).add(i) = sum;
    }

    memlink::kernel_end(a, 0).unwrap();
    memlink::kernel_end(b, 0).unwrap();
    memlink::kernel_end(c, 0).unwrap();

    // reading back traps at least once per covering region and yields the
    // kernel's writes
    let faults_before = page_faults();
    for i in 0..size {
      let expected = (i as u8).wrapping_add((i + 1) as u8);
      assert_eq!(*c.add(i), expected, "mismatch at byte {}", i);
    }
    assert!(page_faults() > faults_before);

    // the inputs survive the round trip unchanged
    for i in 0..size {
      assert_eq!(*a.add(i), i as u8);
      assert_eq!(*b.add(i), (i + 1) as u8);
    }

    memlink::unlink(a, ALL_DEVICES).unwrap();
    memlink::unlink(b, ALL_DEVICES).unwrap();
    memlink::unlink(c, ALL_DEVICES).unwrap();
  }
}

#[test]
fn relink_of_overlapping_range_is_rejected() {
  let _serial = serial();
  setup();
  let size = 2 * page_size();
  let a = host_buffer(size);
  let buf = device_buffer(size);

  unsafe {
    memlink::link(a, size, 0, buf, Placement::OnHost).unwrap();

    let overlapping = memlink::link(a.add(16), size - 32, 0, device_buffer(size), Placement::OnHost);
    assert!(matches!(&overlapping, Err(Error::RangeRegistered)));
    assert_eq!(overlapping.unwrap_err().code(), -6);

    let duplicate = memlink::link(a, size, 0, device_buffer(size), Placement::OnHost);
    assert!(matches!(&duplicate, Err(Error::LinkExists)));
    assert_eq!(duplicate.unwrap_err().code(), -7);

    // a second device is fine
    memlink::link(a, size, 1, device_buffer(size), Placement::OnHost).unwrap();

    memlink::unlink(a, ALL_DEVICES).unwrap();
  }
}

#[test]
fn translate_returns_the_linked_buffer() {
  let _serial = serial();
  setup();
  let size = page_size() + 128;
  let a = host_buffer(size);
  let buf = device_buffer(size);

  unsafe {
    memlink::link(a, size, 1, buf, Placement::OnHost).unwrap();

    assert_eq!(memlink::translate(a, 1).unwrap(), Some(buf));
    // interior pointers resolve through the covering subregion
    assert_eq!(memlink::translate(a.add(size - 1), 1).unwrap(), Some(buf));
    // no link on the other device
    assert_eq!(memlink::translate(a, 0).unwrap(), None);

    memlink::unlink(a, 1).unwrap();
    assert_eq!(memlink::translate(a, 1).unwrap(), None);
  }
}

#[test]
fn link_then_unlink_restores_the_engine() {
  let _serial = serial();
  setup();
  let size = page_size();
  let a = host_buffer(size);

  unsafe {
    memlink::link(a, size, 0, device_buffer(size), Placement::OnHost).unwrap();
    memlink::unlink(a, 0).unwrap();

    assert_eq!(memlink::translate(a, 0).unwrap(), None);
    assert!(matches!(
      memlink::kernel_begin(a, 0, UsageMode::ReadWrite),
      Err(Error::UnknownHostPointer)
    ));

    // the range can be registered again from scratch
    memlink::link(a, size, 0, device_buffer(size), Placement::OnHost).unwrap();
    memlink::unlink(a, 0).unwrap();
  }
}

#[test]
fn unlink_flushes_device_writes_back() {
  let _serial = serial();
  setup();
  let size = page_size();
  let a = host_buffer(size);
  let buf = device_buffer(size);

  unsafe {
    memlink::link(a, size, 0, buf, Placement::OnHost).unwrap();
    memlink::kernel_begin(a, 0, UsageMode::ReadWrite).unwrap();
    for i in 0..size {
      *(buf.0 as *mut u8).add(i) = 0xc3;
    }
    memlink::kernel_end(a, 0).unwrap();

    // the flush pass inside unlink settles the device state; afterwards the
    // pages are unprotected and reads must not fault
    memlink::unlink(a, 0).unwrap();

    let faults_before = page_faults();
    for i in 0..size {
      assert_eq!(*a.add(i), 0xc3);
    }
    assert_eq!(page_faults(), faults_before);
  }
}

#[test]
fn argument_errors_have_stable_codes() {
  let _serial = serial();
  setup();
  let size = page_size();
  let a = host_buffer(size);

  unsafe {
    let zero = memlink::link(a, 0, 0, device_buffer(16), Placement::OnHost);
    assert_eq!(zero.unwrap_err().code(), -4);

    let null = memlink::link(std::ptr::null_mut(), size, 0, device_buffer(16), Placement::OnHost);
    assert_eq!(null.unwrap_err().code(), -3);

    let bad_dev = memlink::link(a, size, NDEVS, device_buffer(16), Placement::OnHost);
    assert_eq!(bad_dev.unwrap_err().code(), -4);

    let unknown = memlink::kernel_begin(a, 0, UsageMode::ReadWrite);
    assert_eq!(unknown.unwrap_err().code(), -8);

    let unknown = memlink::unlink(a, 0);
    assert_eq!(unknown.unwrap_err().code(), -8);

    // double init is rejected with the engine untouched
    let twice = memlink::init_with_backend(
      &[DevQueue(0x1 as *mut _)],
      InitFlags::empty(),
      Box::new(MirrorBackend),
    );
    assert_eq!(twice.unwrap_err().code(), -5);
  }
}

#[test]
fn multi_device_partition() {
  let _serial = serial();
  setup();
  let pz = page_size();
  let half = 2 * pz;
  let size = 2 * half;

  let a = host_buffer(size);
  let c = host_buffer(size);
  let bufs_a = [device_buffer(half), device_buffer(half)];
  let bufs_c = [device_buffer(half), device_buffer(half)];

  unsafe {
    for i in 0..size {
      *a.add(i) = (i % 251) as u8;
    }
    for dev in 0..2 {
      let off = dev * half;
      memlink::link(a.add(off), half, dev, bufs_a[dev], Placement::OnHost).unwrap();
      memlink::link(c.add(off), half, dev, bufs_c[dev], Placement::OnHost).unwrap();
    }

    let workers: Vec<_> = (0..2)
      .map(|dev| {
        let a = a as usize;
        let c = c as usize;
        let buf_a = bufs_a[dev].0 as usize;
        let buf_c = bufs_c[dev].0 as usize;
        std::thread::spawn(move || {
          let off = dev * half;
          let (a, c) = ((a + off) as *mut u8, (c + off) as *mut u8);
          memlink::kernel_begin(a, dev, UsageMode::ReadWrite).unwrap();
          memlink::kernel_begin(c, dev, UsageMode::ReadWrite).unwrap();
          for i in 0..half {
            let value = *((buf_a as *const u8).add(i));
            *((buf_c as *mut u8).add(i)) = value.wrapping_mul(2);
          }
          memlink::kernel_end(a, dev).unwrap();
          memlink::kernel_end(c, dev).unwrap();
        })
      })
      .collect();
    for worker in workers {
      worker.join().unwrap();
    }

    for i in 0..size {
      let expected = ((i % 251) as u8).wrapping_mul(2);
      assert_eq!(*c.add(i), expected, "mismatch at byte {}", i);
    }

    for dev in 0..2 {
      memlink::unlink(a.add(dev * half), dev).unwrap();
      memlink::unlink(c.add(dev * half), dev).unwrap();
    }
  }
}

#[test]
fn pre_init_requires_ordered_phases() {
  let _serial = serial();
  setup();

  use memlink::PreInitPhase;

  // snapshots may be taken regardless of engine initialization, but only in
  // order and only once
  assert_eq!(memlink::pre_init(PreInitPhase::Before).map_err(|e| e.code()), Ok(()));
  assert_eq!(memlink::pre_init(PreInitPhase::After).map_err(|e| e.code()), Ok(()));
  assert_eq!(
    memlink::pre_init(PreInitPhase::Before).map_err(|e| e.code()),
    Err(-5)
  );
}

fn page_size() -> usize {
  memlink::page::size()
}
