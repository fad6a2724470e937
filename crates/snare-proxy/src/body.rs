//! Pass-through body adapters.
//!
//! [`TeeBody`] wraps a streaming body so every data frame is forwarded
//! unchanged while optionally copying into a [`BodyCapture`] for the log
//! record and counting bytes for the terminal log emission. Nothing is
//! buffered ahead of the consumer.

use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use snare_log::{BodyCapture, Message};

/// Emits the deferred per-request log message once the response body has
/// been fully relayed, or reports the failure when the stream dies first.
pub struct LogFinisher {
    message: Option<Message>,
    bytes: u64,
}

impl LogFinisher {
    pub fn new(message: Message) -> Self {
        Self {
            message: Some(message),
            bytes: 0,
        }
    }

    fn add(&mut self, count: u64) {
        self.bytes += count;
    }

    fn finish_ok(&mut self) {
        if let Some(message) = self.message.take() {
            message.with_field("response_bytes", self.bytes).info("");
        }
    }

    fn finish_error(&mut self, error: &dyn fmt::Display) {
        if let Some(message) = self.message.take() {
            message
                .with_field("response_bytes", self.bytes)
                .with_error(error)
                .error("failed to write response");
        }
    }
}

impl Drop for LogFinisher {
    // The body was dropped mid-stream, usually a client that went away.
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            message
                .with_field("response_bytes", self.bytes)
                .error("response body interrupted");
        }
    }
}

pin_project_lite::pin_project! {
    pub struct TeeBody<B> {
        #[pin]
        inner: B,
        capture: Option<BodyCapture>,
        finisher: Option<LogFinisher>,
    }
}

impl<B> TeeBody<B> {
    pub fn new(inner: B, capture: Option<BodyCapture>, finisher: Option<LogFinisher>) -> Self {
        Self {
            inner,
            capture,
            finisher,
        }
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    if let Some(capture) = this.capture.as_ref() {
                        capture.append(data);
                    }
                    if let Some(finisher) = this.finisher.as_mut() {
                        finisher.add(data.len() as u64);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(error)) => {
                if let Some(mut finisher) = this.finisher.take() {
                    finisher.finish_error(&error);
                }
                Poll::Ready(Some(Err(error)))
            }
            None => {
                if let Some(mut finisher) = this.finisher.take() {
                    finisher.finish_ok();
                }
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
