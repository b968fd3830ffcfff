use super::ThreadList;
use crate::{Error, Result};
use mach::kern_return::KERN_SUCCESS;
use mach::mach_types::thread_act_array_t;
use mach::message::mach_msg_type_number_t;
use mach::port::mach_port_t;

/// A macOS thread is identified by its mach thread port.
pub type Thread = mach_port_t;

/// The signal blocked inside writer sections when so configured.
pub fn gc_suspend_signal() -> libc::c_int {
  libc::SIGXCPU
}

/// Returns the mach port of the calling thread.
pub fn self_thread() -> Thread {
  unsafe { mach::mach_init::mach_thread_self() }
}

/// Enumerates the mach ports of all threads of the current task into `list`.
pub fn enumerate_threads(list: &mut ThreadList) -> Result<()> {
  list.clear();

  let task = unsafe { mach::traps::mach_task_self() };
  let mut threads: thread_act_array_t = std::ptr::null_mut();
  let mut count: mach_msg_type_number_t = 0;

  let result = unsafe { mach::task::task_threads(task, &mut threads, &mut count) };
  if result != KERN_SUCCESS {
    return Err(Error::SystemCall(errno::errno()));
  }

  for index in 0..count as usize {
    list.push(unsafe { *threads.add(index) });
  }

  unsafe {
    mach::vm::mach_vm_deallocate(
      task,
      threads as mach::vm_types::mach_vm_address_t,
      (count as usize * std::mem::size_of::<Thread>()) as mach::vm_types::mach_vm_size_t,
    );
  }
  Ok(())
}

/// Suspends a thread through its mach port.
pub fn suspend_thread(thread: Thread) -> Result<()> {
  let result = unsafe { mach::thread_act::thread_suspend(thread) };

  if result == KERN_SUCCESS {
    Ok(())
  } else {
    Err(Error::SystemCall(errno::errno()))
  }
}

/// Resumes a thread previously stopped with [suspend_thread].
pub fn resume_thread(thread: Thread) -> Result<()> {
  let result = unsafe { mach::thread_act::thread_resume(thread) };

  if result == KERN_SUCCESS {
    Ok(())
  } else {
    Err(Error::SystemCall(errno::errno()))
  }
}
