//! Periodic empty frames that keep the peer's idle timer from firing

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

pin_project! {
    /// A wrapper over an `Option<IntervalStream>` which never ticks if there
    /// is no interval
    #[derive(Debug)]
    pub struct HeartBeat {
        #[pin]
        interval: Option<IntervalStream>,
    }
}

impl HeartBeat {
    /// A [`HeartBeat`] that never yields
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// A [`HeartBeat`] that yields once per `period`, starting one period
    /// from now
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval: Some(IntervalStream::new(interval)),
        }
    }

    /// Heartbeat for a peer that announced `remote_idle_timeout`
    ///
    /// Empty frames go out at half the announced timeout; no timeout or a
    /// zero one disables the heartbeat.
    pub fn for_remote_idle_timeout(remote_idle_timeout: Option<Duration>) -> Self {
        match remote_idle_timeout.filter(|d| !d.is_zero()) {
            Some(timeout) => Self::new(timeout / 2),
            None => Self::never(),
        }
    }

    /// Whether the heartbeat ever ticks
    pub fn is_active(&self) -> bool {
        self.interval.is_some()
    }
}

impl Stream for HeartBeat {
    type Item = Instant;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.interval.as_pin_mut() {
            Some(stream) => stream.poll_next(cx),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::HeartBeat;

    #[tokio::test(start_paused = true)]
    async fn ticks_at_half_the_remote_timeout() {
        let start = tokio::time::Instant::now();
        let mut heartbeat = HeartBeat::for_remote_idle_timeout(Some(Duration::from_millis(1000)));
        assert!(heartbeat.is_active());
        heartbeat.next().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        heartbeat.next().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn never_ticks_without_timeout() {
        let mut heartbeat = HeartBeat::for_remote_idle_timeout(Some(Duration::ZERO));
        assert!(!heartbeat.is_active());
        let result = tokio::time::timeout(Duration::from_secs(60), heartbeat.next()).await;
        assert!(result.is_err());
    }
}
