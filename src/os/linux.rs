use super::ThreadList;
use crate::{Error, Result};

/// A Linux thread is identified by its kernel task id.
pub type Thread = libc::pid_t;

/// Buffer size for one `getdents64` batch over `/proc/self/task`.
const DIRENT_BUFFER_SIZE: usize = 4096;

#[repr(C)]
struct Dirent64 {
  _ino: u64,
  _off: i64,
  d_reclen: u16,
  _type: u8,
  // d_name follows inline at byte 19; size_of would overshoot it because of
  // tail padding
}

const DIRENT_NAME_OFFSET: usize = 19;

/// Returns the id of the calling thread.
pub fn self_thread() -> Thread {
  unsafe { libc::syscall(libc::SYS_gettid) as Thread }
}

/// Delivers `signal` to one specific thread of the current process.
pub fn deliver_signal(thread: Thread, signal: libc::c_int) -> Result<()> {
  let result =
    unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), thread, signal) };

  if result == 0 {
    Ok(())
  } else {
    Err(Error::SystemCall(errno::errno()))
  }
}

/// The real-time signal used to park application threads during
/// stop-the-world.
pub fn suspend_signal() -> libc::c_int {
  libc::SIGRTMIN() + 6
}

/// The signal blocked inside writer sections when so configured; this is the
/// signal BoehmGC-style collectors use for their own world stops.
pub fn gc_suspend_signal() -> libc::c_int {
  libc::SIGPWR
}

/// Enumerates the ids of all threads of the current process into `list`.
///
/// Reads `/proc/self/task` with `open`/`getdents64` on a stack buffer rather
/// than the libc directory stream API: this runs while other threads may be
/// frozen inside malloc, so the process allocator is off limits.
pub fn enumerate_threads(list: &mut ThreadList) -> Result<()> {
  list.clear();

  let fd = unsafe {
    libc::open(
      b"/proc/self/task\0".as_ptr() as *const libc::c_char,
      libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
    )
  };
  if fd < 0 {
    return Err(Error::SystemCall(errno::errno()));
  }

  // getdents64 yields 8-aligned records, so the buffer needs matching
  // alignment
  let mut buffer = [0u64; DIRENT_BUFFER_SIZE / 8];
  let base = buffer.as_mut_ptr() as *mut u8;
  loop {
    let nread = unsafe {
      libc::syscall(
        libc::SYS_getdents64,
        fd,
        base as *mut libc::c_void,
        DIRENT_BUFFER_SIZE,
      )
    };
    if nread < 0 {
      unsafe { libc::close(fd) };
      return Err(Error::SystemCall(errno::errno()));
    }
    if nread == 0 {
      break;
    }

    let mut offset = 0usize;
    while offset < nread as usize {
      let entry = unsafe { &*(base.add(offset) as *const Dirent64) };
      let name = unsafe { base.add(offset + DIRENT_NAME_OFFSET) };
      if let Some(tid) = parse_tid(name) {
        if !list.push(tid) {
          log::error!("thread list is full, some threads are not enumerated");
        }
      }
      offset += entry.d_reclen as usize;
    }
  }

  unsafe { libc::close(fd) };
  Ok(())
}

/// Parses a NUL-terminated decimal task id; `.`/`..` and anything else
/// non-numeric yields `None`.
fn parse_tid(name: *const u8) -> Option<Thread> {
  let mut value: Thread = 0;
  let mut digits = 0;

  unsafe {
    let mut cursor = name;
    while *cursor != 0 {
      let c = *cursor;
      if !(b'0'..=b'9').contains(&c) {
        return None;
      }
      value = value * 10 + (c - b'0') as Thread;
      digits += 1;
      cursor = cursor.add(1);
    }
  }

  if digits > 0 {
    Some(value)
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn self_thread_is_nonzero() {
    assert!(self_thread() > 0);
  }

  #[test]
  fn tid_parsing_accepts_numbers_only() {
    assert_eq!(parse_tid(b"1234\0".as_ptr()), Some(1234));
    assert_eq!(parse_tid(b".\0".as_ptr()), None);
    assert_eq!(parse_tid(b"..\0".as_ptr()), None);
    assert_eq!(parse_tid(b"12a\0".as_ptr()), None);
    assert_eq!(parse_tid(b"\0".as_ptr()), None);
  }

  #[test]
  fn spawned_threads_are_enumerated() {
    let (tx, rx) = std::sync::mpsc::channel();
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

    let child = std::thread::spawn(move || {
      tx.send(self_thread()).unwrap();
      done_rx.recv().unwrap();
    });

    let child_tid = rx.recv().unwrap();
    let mut list = ThreadList::new();
    enumerate_threads(&mut list).unwrap();

    assert!(list.contains(self_thread()));
    assert!(list.contains(child_tid));

    done_tx.send(()).unwrap();
    child.join().unwrap();
  }
}
