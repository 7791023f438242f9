use crate::Error;
use futures::{StreamExt, channel::mpsc};
use http_body_util::{Empty, Full};
use hyper::body::{Body as HttpBody, Bytes, Frame, SizeHint};
use std::{
    pin::Pin,
    task::{Context, Poll},
};

pub(crate) type BodySender = mpsc::Sender<Result<Bytes, Error>>;

#[derive(Debug)]
enum Internal {
    Empty(Empty<Bytes>),
    Full(Full<Bytes>),
    Channel(mpsc::Receiver<Result<Bytes, Error>>),
}

/// Body of responses written back to the proxy's clients.
///
/// Fulfilled and error responses are fully buffered. Forwarded responses are fed through a
/// bounded channel while the upstream body is still being read, so the client sees the bytes as
/// they arrive.
#[derive(Debug)]
pub struct Body {
    inner: Internal,
}

impl Body {
    pub fn empty() -> Self {
        Self {
            inner: Internal::Empty(Empty::new()),
        }
    }

    /// Creates a streaming body together with the sender feeding it. Sending an `Err` aborts the
    /// response on the client connection.
    pub(crate) fn channel(buffer: usize) -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            tx,
            Self {
                inner: Internal::Channel(rx),
            },
        )
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.inner {
            Internal::Empty(body) => Pin::new(body).poll_frame(cx).map_err(|e| match e {}),
            Internal::Full(body) => Pin::new(body).poll_frame(cx).map_err(|e| match e {}),
            Internal::Channel(rx) => rx
                .poll_next_unpin(cx)
                .map(|chunk| chunk.map(|chunk| chunk.map(Frame::data))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            Internal::Empty(body) => body.is_end_stream(),
            Internal::Full(body) => body.is_end_stream(),
            Internal::Channel(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Internal::Empty(body) => body.size_hint(),
            Internal::Full(body) => body.size_hint(),
            Internal::Channel(_) => SizeHint::default(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Self {
            inner: Internal::Full(Full::new(value)),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Bytes::from(value).into()
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Bytes::from(value).into()
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Bytes::from_static(value.as_bytes()).into()
    }
}
