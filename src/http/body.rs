use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use hyper::body::{Body, Frame};
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio_util::io::poll_read_buf;

const READ_CHUNK_SIZE: usize = 8*1024;

/// The streamed body of a 202 response: everything the dispatcher writes to the out-channel's
///  pipe is forwarded to the remote as it is written. The body ends when the writing end is
///  dropped.
pub struct ChannelBody {
    reader: DuplexStream,
    buf: BytesMut,
}

impl ChannelBody {
    pub fn new(reader: DuplexStream) -> ChannelBody {
        ChannelBody {
            reader,
            buf: BytesMut::new(),
        }
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.buf.capacity() - this.buf.len() < READ_CHUNK_SIZE {
            this.buf.reserve(READ_CHUNK_SIZE);
        }

        match ready!(poll_read_buf(Pin::new(&mut this.reader), cx, &mut this.buf)) {
            Ok(0) => Poll::Ready(None),
            Ok(_) => Poll::Ready(Some(Ok(Frame::data(this.buf.split().freeze())))),
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }
}

/// Adapts a response body to [AsyncRead], which is how channel streams are read. Non-data frames
///  (trailers) are skipped.
pub struct BodyReader<B> {
    body: B,
    current: Bytes,
}

impl <B> BodyReader<B> {
    pub fn new(body: B) -> BodyReader<B> {
        BodyReader {
            body,
            current: Bytes::new(),
        }
    }
}

impl <B> AsyncRead for BodyReader<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;

        while this.current.is_empty() {
            match ready!(Pin::new(&mut this.body).poll_frame(cx)) {
                None => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        this.current = data;
                    }
                }
            }
        }

        let n = this.current.len().min(buf.remaining());
        buf.put_slice(&this.current[..n]);
        this.current.advance(n);
        Poll::Ready(Ok(()))
    }
}
