//! Tee Stream Module
//!
//! Wraps a streaming response body so that every data frame the client reads
//! is also sent to a bounded channel feeding the cache writer. The client
//! stream is authoritative: if the channel cannot keep up, the cache copy is
//! abandoned rather than buffering or stalling the download.

use bytes::Bytes;
use futures::Stream;
use hyper::body::Frame;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A stream that tees data frames into an mpsc channel while passing them
/// through. Dropping the stream drops the sender, which ends the receiver
/// side before EOF — a short cache write that the digest check then rejects.
pub struct TeeStream<S> {
    inner: S,
    sender: Option<mpsc::Sender<Bytes>>,
    bytes_forwarded: u64,
}

impl<S> TeeStream<S> {
    pub fn new(inner: S, sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            inner,
            sender: Some(sender),
            bytes_forwarded: 0,
        }
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded
    }
}

impl<S, E> Stream for TeeStream<S>
where
    S: Stream<Item = Result<Frame<Bytes>, E>> + Unpin,
{
    type Item = Result<Frame<Bytes>, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                Ok(data) => {
                    this.bytes_forwarded += data.len() as u64;

                    if let Some(sender) = &this.sender {
                        match sender.try_send(data.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // Cache writer fell behind; a partial copy is
                                // useless, so stop feeding it entirely.
                                warn!("cache channel full, abandoning cache write");
                                this.sender = None;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                debug!("cache channel closed, stopping tee");
                                this.sender = None;
                            }
                        }
                    }

                    Poll::Ready(Some(Ok(Frame::data(data))))
                }
                // Non-data frame (trailers), pass through untouched
                Err(frame) => Poll::Ready(Some(Ok(frame))),
            },
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use std::convert::Infallible;

    #[tokio::test]
    async fn forwards_and_tees_data_frames() {
        let (tx, mut rx) = mpsc::channel(10);

        let frames: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from("hello"))),
            Ok(Frame::data(Bytes::from("world"))),
        ];
        let mut tee = TeeStream::new(stream::iter(frames), tx);

        let mut forwarded = Vec::new();
        while let Some(Ok(frame)) = tee.next().await {
            if let Ok(data) = frame.into_data() {
                forwarded.push(data);
            }
        }
        assert_eq!(forwarded, vec![Bytes::from("hello"), Bytes::from("world")]);
        assert_eq!(tee.bytes_forwarded(), 10);

        drop(tee);
        let mut teed = Vec::new();
        while let Some(data) = rx.recv().await {
            teed.push(data);
        }
        assert_eq!(teed, vec![Bytes::from("hello"), Bytes::from("world")]);
    }

    #[tokio::test]
    async fn full_channel_abandons_cache_copy_but_not_the_client() {
        let (tx, mut rx) = mpsc::channel(1);

        let frames: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from("a"))),
            Ok(Frame::data(Bytes::from("b"))),
            Ok(Frame::data(Bytes::from("c"))),
        ];
        let mut tee = TeeStream::new(stream::iter(frames), tx);

        let mut forwarded = 0;
        while let Some(Ok(_)) = tee.next().await {
            forwarded += 1;
        }
        // Client saw every frame even though the channel overflowed.
        assert_eq!(forwarded, 3);

        drop(tee);
        // Only the first chunk made it before the tee gave up.
        assert_eq!(rx.recv().await, Some(Bytes::from("a")));
        assert_eq!(rx.recv().await, None);
    }
}
