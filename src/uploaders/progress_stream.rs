use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use crate::core::ProgressCallback;

pin_project! {
    /// Reports whole-percent progress as the request body is polled.
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        on_progress: ProgressCallback,
        total_bytes: u64,
        bytes_sent: u64,
        last_percent: Option<u8>,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, total_bytes: u64, on_progress: ProgressCallback) -> Self {
        Self {
            inner,
            on_progress,
            total_bytes,
            bytes_sent: 0,
            last_percent: None,
        }
    }
}

/// Percent of the body handed to the connection. Capped at 99: only the
/// server response completes an upload.
fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 99;
    }
    ((sent.min(total) * 100 / total) as u8).min(99)
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    *this.bytes_sent += chunk.len() as u64;
                    let percent = percent_of(*this.bytes_sent, *this.total_bytes);
                    // 只在百分比变化时回调
                    if this.last_percent.map_or(true, |last| percent > last) {
                        *this.last_percent = Some(percent);
                        (this.on_progress)(percent);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Split an in-memory buffer into body chunks without copying.
pub fn chunked_body(bytes: Bytes, chunk_size: usize) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<std::io::Result<Bytes>> = (0..bytes.len())
        .step_by(chunk_size)
        .map(|start| Ok(bytes.slice(start..(start + chunk_size).min(bytes.len()))))
        .collect();
    futures::stream::iter(chunks)
}
