//! `Stream` adapter over a chat event channel.

use futures_core::Stream;
use parley_types::{EventReceiver, StreamEvent};
use std::pin::Pin;
use std::task::{Context, Poll};

/// An async stream of [`StreamEvent`]s that ends right after the terminal
/// event, even if the sender is still alive.
pub struct ChatEventStream {
    rx: EventReceiver,
    finished: bool,
}

impl ChatEventStream {
    pub fn new(rx: EventReceiver) -> Self {
        Self {
            rx,
            finished: false,
        }
    }
}

impl From<EventReceiver> for ChatEventStream {
    fn from(rx: EventReceiver) -> Self {
        Self::new(rx)
    }
}

impl Stream for ChatEventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                    this.rx.close();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
