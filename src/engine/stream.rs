//! Lazy token-event stream handed to the consumer of a generation.
//!
//! The stream is the receiving half of a bounded channel whose sender lives
//! on the engine worker. Dropping the stream before the terminal event is
//! the cancellation hook: it sets the shared cancel flag, which the decode
//! loop polls at token granularity.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::TokenEvent;
use crate::error::WispError;

/// How many events may queue between the worker and the consumer before the
/// worker blocks.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A lazy stream of [`TokenEvent`]s for one generation.
///
/// Exactly one `Done` event terminates a successful generation; engine
/// failures mid-stream surface as a terminal `Err` item instead.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<TokenEvent, WispError>>,
    cancel: Arc<AtomicBool>,
    finished: bool,
}

impl TokenStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<TokenEvent, WispError>>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            cancel,
            finished: false,
        }
    }
}

impl Stream for TokenStream {
    type Item = Result<TokenEvent, WispError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if matches!(item, Ok(TokenEvent::Done { .. }) | Err(_)) {
                    this.finished = true;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        // Dropping a drained stream must not poison the next generation.
        if !self.finished {
            self.cancel.store(true, Ordering::Relaxed);
            tracing::debug!("token stream dropped mid-generation; cancel requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FinishReason;
    use futures::StreamExt;

    fn channel_stream() -> (
        mpsc::Sender<Result<TokenEvent, WispError>>,
        TokenStream,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = Arc::new(AtomicBool::new(false));
        let stream = TokenStream::new(rx, cancel.clone());
        (tx, stream, cancel)
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (tx, mut stream, _cancel) = channel_stream();
        tx.send(Ok(TokenEvent::Token { text: "a".into() }))
            .await
            .unwrap();
        tx.send(Ok(TokenEvent::Done {
            reason: FinishReason::Stop,
        }))
        .await
        .unwrap();
        drop(tx);

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            TokenEvent::Token { text: "a".into() }
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            TokenEvent::Done {
                reason: FinishReason::Stop
            }
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_mid_generation_sets_cancel_flag() {
        let (_tx, stream, cancel) = channel_stream();
        drop(stream);
        assert!(cancel.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_drop_after_done_leaves_cancel_clear() {
        let (tx, mut stream, cancel) = channel_stream();
        tx.send(Ok(TokenEvent::Done {
            reason: FinishReason::Stop,
        }))
        .await
        .unwrap();
        let _ = stream.next().await;
        drop(stream);
        assert!(!cancel.load(Ordering::Relaxed));
    }
}
