//! Owned timer handles.
//!
//! A [`Timer`] delivers an event into the runtime's channel after a delay or
//! on a fixed period. The timer task belongs to whoever holds the handle:
//! cancelling or dropping the handle aborts it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{self, MissedTickBehavior};

#[derive(Debug, Default)]
pub struct Timer {
    task: Option<AbortHandle>,
}

impl Timer {
    /// A timer that is not armed.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Sends `event` once after `delay`.
    pub fn once<E>(delay: Duration, events: mpsc::UnboundedSender<E>, event: E) -> Self
    where
        E: Send + 'static,
    {
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = events.send(event);
        });
        Self {
            task: Some(task.abort_handle()),
        }
    }

    /// Sends `make()` every `period`, the first one immediately.
    pub fn every<E, F>(period: Duration, events: mpsc::UnboundedSender<E>, make: F) -> Self
    where
        E: Send + 'static,
        F: Fn() -> E + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events.send(make()).is_err() {
                    break;
                }
            }
        });
        Self {
            task: Some(task.abort_handle()),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn once_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = Timer::once(Duration::from_millis(50), tx, "fired");

        time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rx.try_recv(), Ok("fired"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::every(Duration::from_millis(10), tx, || 1u8);
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(rx.try_recv(), Ok(1));

        timer.cancel();
        assert!(!timer.is_armed());
        time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(Timer::once(Duration::from_millis(10), tx, ()));
        time::sleep(Duration::from_millis(50)).await;
        assert!(rx.recv().await.is_none());
    }
}
