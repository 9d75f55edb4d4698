use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;
use uuid::Uuid;

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CloseKind {
    /// an I/O operation failed, or the stream was used after it was disposed
    Failed,
    /// the stream was shut down gracefully through its owner
    Closed,
}

pub type CloseCallback = Box<dyn Fn(CloseKind) + Send + Sync>;

struct Slot<S> {
    stream: Option<S>,
    waker: Option<Waker>,
}

struct GuardState {
    channel_id: Uuid,
    notified: AtomicBool,
    on_close: CloseCallback,
}

/// Wraps one direction of a channel's byte stream. All clones share the underlying stream, so
///  the dispatcher can dispose a stream that is concurrently used by a connection's owner.
///
/// The first failure (or graceful shutdown) of the stream is reported exactly once through the
///  close callback, regardless of how many clones or concurrent operations observe it. The
///  original I/O error is still returned to the caller that triggered it.
pub struct StreamGuard<S> {
    slot: Arc<Mutex<Slot<S>>>,
    state: Arc<GuardState>,
}

impl <S> Clone for StreamGuard<S> {
    fn clone(&self) -> Self {
        StreamGuard {
            slot: self.slot.clone(),
            state: self.state.clone(),
        }
    }
}

impl <S: Unpin> Debug for StreamGuard<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamGuard{{channel:{}, disposed:{}}}", self.state.channel_id.simple(), self.is_disposed())
    }
}

impl <S: Unpin> StreamGuard<S> {
    pub fn new(stream: S, channel_id: Uuid, on_close: impl Fn(CloseKind) + Send + Sync + 'static) -> StreamGuard<S> {
        StreamGuard {
            slot: Arc::new(Mutex::new(Slot {
                stream: Some(stream),
                waker: None,
            })),
            state: Arc::new(GuardState {
                channel_id,
                notified: AtomicBool::new(false),
                on_close: Box::new(on_close),
            }),
        }
    }

    pub fn channel_id(&self) -> Uuid {
        self.state.channel_id
    }

    /// Drop the underlying stream, which closes the HTTP request or response it belongs to.
    ///  Pending and future operations fail with [io::ErrorKind::NotConnected].
    ///
    /// Disposal is initiated by the party that already knows about it, so it does not trigger
    ///  the close callback.
    pub fn dispose(&self) {
        self.state.notified.store(true, Ordering::Release);

        let (stream, waker) = {
            let mut slot = self.lock();
            (slot.stream.take(), slot.waker.take())
        };
        drop(stream);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().stream.is_none()
    }

    /// true once the close callback fired or the stream was disposed
    pub fn is_closed(&self) -> bool {
        self.state.notified.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Slot<S>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, kind: CloseKind, reason: &dyn Display) {
        if self.state.notified.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            debug!(channel_id = %self.state.channel_id, ?kind, "channel closed: {}", reason);
            (self.state.on_close)(kind);
        }
    }

    fn poll_io<T>(&self, cx: &mut Context<'_>, op: impl FnOnce(Pin<&mut S>, &mut Context<'_>) -> Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        let result = {
            let mut slot = self.lock();
            match slot.stream.as_mut() {
                None => Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "channel stream was disposed"))),
                Some(stream) => {
                    let result = op(Pin::new(stream), cx);
                    if result.is_pending() {
                        slot.waker = Some(cx.waker().clone());
                    }
                    result
                }
            }
        };

        if let Poll::Ready(Err(e)) = &result {
            self.notify(CloseKind::Failed, e);
        }
        result
    }
}

impl <S: AsyncRead + Unpin> AsyncRead for StreamGuard<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.poll_io(cx, |s, cx| s.poll_read(cx, buf))
    }
}

impl <S: AsyncWrite + Unpin> AsyncWrite for StreamGuard<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.poll_io(cx, |s, cx| s.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_io(cx, |s, cx| s.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = self.poll_io(cx, |s, cx| s.poll_shutdown(cx));
        if let Poll::Ready(Ok(())) = &result {
            self.notify(CloseKind::Closed, &"shut down by owner");
        }
        result
    }
}
