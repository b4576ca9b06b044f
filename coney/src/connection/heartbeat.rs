//! Asynchronous heartbeat ticker
//!
//! A wrapper over an optional interval stream which never yields when
//! heartbeats are disabled, so the writer loop can `select!` on it
//! unconditionally.

use std::task::Poll;
use std::time::Duration;

use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio_stream::wrappers::IntervalStream;

pin_project! {
    #[derive(Debug)]
    pub(crate) struct HeartBeat {
        #[pin]
        interval: Option<IntervalStream>,
    }
}

impl HeartBeat {
    /// A [`HeartBeat`] that never yields `Poll::Ready(_)`
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// A [`HeartBeat`] yielding per the given period
    pub fn new(period: Duration) -> Self {
        Self {
            interval: Some(IntervalStream::new(tokio::time::interval(period))),
        }
    }
}

impl Stream for HeartBeat {
    type Item = ();

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.interval.as_pin_mut() {
            Some(interval) => match interval.poll_next(cx) {
                Poll::Ready(Some(_instant)) => Poll::Ready(Some(())),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_at_the_configured_period() {
        let mut heartbeat = HeartBeat::new(Duration::from_secs(30));
        // first tick completes immediately per tokio interval semantics
        heartbeat.next().await.unwrap();
        let before = tokio::time::Instant::now();
        heartbeat.next().await.unwrap();
        assert_eq!(before.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn never_never_ticks() {
        let mut heartbeat = HeartBeat::never();
        let tick = tokio::time::timeout(Duration::from_secs(3600), heartbeat.next()).await;
        assert!(tick.is_err());
    }
}
