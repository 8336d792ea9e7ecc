// Wake/sleep pattern shared by the queue's runner loops.
//
// A runner loops until shutdown: it drains whatever work exists, then
// sleeps on a race between an explicit wake (store notification), a bounded
// poll timer, and the shutdown flag. Wakes are sticky: a wake delivered
// while the runner is draining is observed by the next sleep.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::debug;

pub struct WorkLoop {
  label: &'static str,
  poll_interval: Duration,
  waker: Notify,
  shutdown_tx: watch::Sender<bool>,
}

impl WorkLoop {
  pub fn new(label: &'static str, poll_interval: Duration) -> Arc<Self> {
    let (shutdown_tx, _) = watch::channel(false);
    Arc::new(Self {
      label,
      poll_interval,
      waker: Notify::new(),
      shutdown_tx,
    })
  }

  pub fn wake(&self) {
    debug!("[workloop {}] waking up", self.label);
    self.waker.notify_one();
  }

  pub fn shutting_down(&self) -> bool {
    *self.shutdown_tx.borrow()
  }

  /// Watch channel that flips to true on shutdown; used by listener tasks
  /// that forward store notifications into `wake`.
  pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
    self.shutdown_tx.subscribe()
  }

  /// Flag shutdown and wake any sleeper. The caller joins the runner task
  /// separately; no work is aborted mid-flight.
  pub fn shut_down(&self) {
    debug!("[workloop {}] shutting down", self.label);
    let _ = self.shutdown_tx.send(true);
    self.waker.notify_waiters();
  }

  /// Sleep until woken, until the poll interval elapses, or until shutdown.
  pub async fn sleep(&self) {
    if self.shutting_down() {
      return;
    }
    let mut shutdown_rx = self.shutdown_tx.subscribe();
    tokio::select! {
      _ = self.waker.notified() => {}
      _ = tokio::time::sleep(self.poll_interval) => {}
      _ = shutdown_rx.changed() => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Instant;

  #[tokio::test]
  async fn test_wake_interrupts_sleep() {
    let work_loop = WorkLoop::new("test", Duration::from_secs(30));
    let sleeper = work_loop.clone();
    let handle = tokio::spawn(async move { sleeper.sleep().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    work_loop.wake();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_sticky_wake_skips_next_sleep() {
    let work_loop = WorkLoop::new("test", Duration::from_secs(30));
    // wake before anyone sleeps; the permit is held for the next sleeper
    work_loop.wake();
    let start = Instant::now();
    work_loop.sleep().await;
    assert!(start.elapsed() < Duration::from_secs(1));
  }

  #[tokio::test]
  async fn test_shutdown_ends_sleep() {
    let work_loop = WorkLoop::new("test", Duration::from_secs(30));
    let sleeper = work_loop.clone();
    let handle = tokio::spawn(async move {
      while !sleeper.shutting_down() {
        sleeper.sleep().await;
      }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    work_loop.shut_down();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_poll_timer_elapses() {
    let work_loop = WorkLoop::new("test", Duration::from_millis(10));
    // no wake, no shutdown: the bounded poll interval returns control
    work_loop.sleep().await;
  }
}
