//! Runtime statistics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Statistics counters exposed through [crate::stat].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatParameter {
  /// Whether statistics collection is enabled.
  Enabled,
  /// The number of devices the engine was initialized with.
  DeviceCount,
  /// Total seconds spent in host/device copies.
  CopyTime,
  /// Number of page faults serviced by the coherence engine.
  PageFaults,
  /// Total seconds application threads were stalled by fault handling.
  PageFaultTime,
}

/// A statistics value, typed per counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
  /// A boolean counter.
  Flag(bool),
  /// An event or cardinality counter.
  Count(u64),
  /// A time accumulator, in seconds.
  Seconds(f64),
}

/// Statistics accumulators.
///
/// The double accumulators use atomic compare-exchange instead of a mutex:
/// the sync worker adds copy time while arbitrary application threads are
/// frozen, so it must not contend on a lock one of them could hold.
pub struct Stats {
  enabled: bool,
  page_faults: AtomicU64,
  copy_time: AtomicU64,
  fault_time: AtomicU64,
}

fn accumulate(cell: &AtomicU64, value: f64) {
  let mut current = cell.load(Ordering::Relaxed);
  loop {
    let next = (f64::from_bits(current) + value).to_bits();
    match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
      Ok(_) => return,
      Err(actual) => current = actual,
    }
  }
}

impl Stats {
  pub fn new(enabled: bool) -> Self {
    Stats {
      enabled,
      page_faults: AtomicU64::new(0),
      copy_time: AtomicU64::new(0f64.to_bits()),
      fault_time: AtomicU64::new(0f64.to_bits()),
    }
  }

  pub fn enabled(&self) -> bool {
    self.enabled
  }

  pub fn count_page_fault(&self) {
    if self.enabled {
      self.page_faults.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn add_copy_time(&self, elapsed: Duration) {
    if self.enabled {
      accumulate(&self.copy_time, duration_seconds(elapsed));
    }
  }

  pub fn add_fault_time(&self, elapsed: Duration) {
    if self.enabled {
      accumulate(&self.fault_time, duration_seconds(elapsed));
    }
  }

  pub fn page_faults(&self) -> u64 {
    self.page_faults.load(Ordering::Relaxed)
  }

  pub fn copy_time(&self) -> f64 {
    f64::from_bits(self.copy_time.load(Ordering::Relaxed))
  }

  pub fn fault_time(&self) -> f64 {
    f64::from_bits(self.fault_time.load(Ordering::Relaxed))
  }
}

fn duration_seconds(elapsed: Duration) -> f64 {
  elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) * 1e-9
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn disabled_stats_stay_zero() {
    let stats = Stats::new(false);

    stats.count_page_fault();
    stats.add_copy_time(Duration::from_millis(10));
    assert_eq!(stats.page_faults(), 0);
    assert_eq!(stats.copy_time(), 0.0);
  }

  #[test]
  fn enabled_stats_accumulate() {
    let stats = Stats::new(true);

    stats.count_page_fault();
    stats.count_page_fault();
    stats.add_copy_time(Duration::from_millis(250));
    stats.add_copy_time(Duration::from_millis(250));
    stats.add_fault_time(Duration::from_millis(100));

    assert_eq!(stats.page_faults(), 2);
    assert!((stats.copy_time() - 0.5).abs() < 1e-6);
    assert!(stats.fault_time() > 0.0);
  }

  #[test]
  fn accumulation_is_race_free() {
    use std::sync::Arc;

    let stats = Arc::new(Stats::new(true));
    let workers: Vec<_> = (0..4)
      .map(|_| {
        let stats = Arc::clone(&stats);
        std::thread::spawn(move || {
          for _ in 0..1000 {
            stats.add_copy_time(Duration::from_nanos(1000));
          }
        })
      })
      .collect();

    for worker in workers {
      worker.join().unwrap();
    }
    assert!((stats.copy_time() - 4e-3).abs() < 1e-9);
  }
}
