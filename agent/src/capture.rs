//! Response metrics capture
//!
//! [`ResponseCapture`] observes what a handler actually put on the wire:
//! the status code, the number of body bytes, and whether a response head
//! was produced at all. The middleware feeds it from two places: once when
//! the inner service yields a response, and then per data frame while the
//! body streams out through [`CapturedBody`].
//!
//! The state is shared and mutex-guarded because body frames may be produced
//! from a different task than the one that observed the head.

use axum::body::Body;
use bytes::Bytes;
use http_body::{Frame, SizeHint};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Debug)]
struct CaptureState {
    code: u16,
    bytes_written: u64,
    header_written: bool,
}

/// Observed response metrics for one HTTP transaction.
///
/// Starts out as `(200, 0 bytes, header not written)`. The first
/// [`write_header`](ResponseCapture::write_header) call decides the code;
/// later calls are ignored. Any completed body write counts its bytes and
/// marks the header as written, since a body cannot leave without one.
#[derive(Clone, Debug)]
pub struct ResponseCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl ResponseCapture {
    /// Creates a capture in its initial state.
    pub fn new() -> Self {
        ResponseCapture {
            state: Arc::new(Mutex::new(CaptureState {
                code: 200,
                bytes_written: 0,
                header_written: false,
            })),
        }
    }

    /// Records that a response head with `code` was produced. Only the first
    /// call changes the captured code.
    pub fn write_header(&self, code: u16) {
        let mut state = self.state.lock();
        if !state.header_written {
            state.code = code;
            state.header_written = true;
        }
    }

    /// Records `n` body bytes leaving the process.
    pub fn record_write(&self, n: usize) {
        let mut state = self.state.lock();
        state.bytes_written += n as u64;
        state.header_written = true;
    }

    /// The response code the client saw.
    pub fn code(&self) -> u16 {
        self.state.lock().code
    }

    /// Total body bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Whether a response head or any body byte was produced.
    pub fn header_written(&self) -> bool {
        self.state.lock().header_written
    }
}

impl Default for ResponseCapture {
    fn default() -> Self {
        ResponseCapture::new()
    }
}

/// Response body wrapper that counts bytes into a [`ResponseCapture`] and
/// fires a completion callback exactly once, at end-of-stream, on a body
/// error, or when the body is dropped unpolled (client gone). The callback
/// is where the middleware finalizes the telemetry record, so it must run
/// no matter how the response ends.
pub struct CapturedBody {
    inner: Body,
    capture: ResponseCapture,
    on_complete: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CapturedBody {
    pub(crate) fn new(
        inner: Body,
        capture: ResponseCapture,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Self {
        CapturedBody {
            inner,
            capture,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    fn complete(&mut self) {
        if let Some(callback) = self.on_complete.take() {
            callback();
        }
    }
}

impl http_body::Body for CapturedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.record_write(data.len());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(error))) => {
                this.complete();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CapturedBody {
    fn drop(&mut self) {
        self.complete();
    }
}
