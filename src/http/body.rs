//! Moving message bodies between hyper and streams.
//!
//! An outgoing body is the stream the guest writes plus its trailers future,
//! adapted into an [`http_body::Body`] for hyper. An incoming body is pumped
//! by a task into a stream, with the trailers delivered through a separate
//! future once the last data frame has been forwarded.

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;

use super::error::body_stream_error;
use super::fields::ForbiddenHeaders;
use super::{ErrorCode, Fields, HttpError, HttpResult};
use crate::future::{FutureReader, FutureWriter, future_pair};
use crate::runtime::spawn_detached;
use crate::stream::{StreamReader, StreamWriter, stream_pair};

/// The trailers of a message, `None` when it has none.
pub type Trailers = FutureReader<Option<Fields>, HttpError>;

/// The body stream and trailers of a message, each handed out at most once.
#[derive(Debug)]
pub(crate) struct Contents {
    body: Option<StreamReader<Bytes>>,
    trailers: Option<Trailers>,
}

impl Contents {
    /// A message without a body is treated as one whose empty body has not
    /// been taken yet.
    pub(crate) fn new(body: Option<StreamReader<Bytes>>, trailers: Trailers) -> Self {
        Contents {
            body: Some(body.unwrap_or_else(StreamReader::empty)),
            trailers: Some(trailers),
        }
    }

    pub(crate) fn take_body(&mut self) -> HttpResult<StreamReader<Bytes>> {
        self.body
            .take()
            .ok_or_else(|| HttpError::with_detail(ErrorCode::InvalidState, "body already taken"))
    }

    pub(crate) fn take_trailers(&mut self) -> HttpResult<Trailers> {
        self.trailers
            .take()
            .ok_or_else(|| HttpError::with_detail(ErrorCode::InvalidState, "trailers already taken"))
    }

    /// Hands the body and trailers to hyper.
    pub(crate) fn into_outgoing(
        mut self,
        completion: FutureWriter<(), HttpError>,
    ) -> HttpResult<OutgoingBody> {
        let body = self.take_body()?;
        let trailers = self.take_trailers()?;
        Ok(OutgoingBody::new(body, trailers, completion))
    }
}

/// A message body as hyper sends it.
///
/// Settles `completion` once the last frame has been handed to hyper, or
/// with the error that ended the body early. A body dropped before that
/// settles it with "connection-terminated".
#[derive(Debug)]
pub(crate) struct OutgoingBody {
    data: StreamReader<Bytes>,
    trailers: Option<Trailers>,
    completion: Option<FutureWriter<(), HttpError>>,
}

impl OutgoingBody {
    pub(crate) fn new(
        data: StreamReader<Bytes>,
        trailers: Trailers,
        completion: FutureWriter<(), HttpError>,
    ) -> Self {
        OutgoingBody {
            data,
            trailers: Some(trailers),
            completion: Some(completion),
        }
    }

    /// A body with no data and no trailers.
    pub(crate) fn empty() -> Self {
        let (completion, _) = future_pair();
        OutgoingBody::new(StreamReader::empty(), FutureReader::ready(None), completion)
    }

    fn finish(&mut self, result: Result<(), HttpError>) {
        if let Some(completion) = self.completion.take() {
            completion.settle(result);
        }
    }
}

impl Body for OutgoingBody {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, HttpError>>> {
        let this = &mut *self;
        if !this.data.is_ended() {
            match ready!(this.data.poll_read(cx)) {
                Ok(Some(chunk)) => return Poll::Ready(Some(Ok(Frame::data(chunk)))),
                Ok(None) => {}
                Err(e) => {
                    let err = body_stream_error(e);
                    this.finish(Err(err.clone()));
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
        let Some(trailers) = this.trailers.as_mut() else {
            return Poll::Ready(None);
        };
        let result = ready!(trailers.poll_read(cx));
        this.trailers = None;
        match result {
            Ok(Some(Some(fields))) if !fields.is_empty() => {
                this.finish(Ok(()));
                Poll::Ready(Some(Ok(Frame::trailers(fields.to_header_map()))))
            }
            Ok(_) => {
                this.finish(Ok(()));
                Poll::Ready(None)
            }
            Err(err) => {
                this.finish(Err(err.clone()));
                Poll::Ready(Some(Err(err)))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_ended() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

impl Drop for OutgoingBody {
    fn drop(&mut self) {
        self.finish(Err(HttpError::with_detail(
            ErrorCode::ConnectionTerminated,
            "body dropped before it was fully sent",
        )));
    }
}

/// Forwards an incoming hyper body into a stream and a trailers future.
///
/// Each frame must arrive within `between_bytes` when it is set. The pump
/// stops early when the reader goes away; the trailers future is then
/// closed without a value.
pub(crate) fn pump_incoming<B>(
    body: B,
    between_bytes: Option<Duration>,
    forbidden: ForbiddenHeaders,
    map_err: fn(B::Error) -> HttpError,
) -> (StreamReader<Bytes>, Trailers)
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Send,
{
    let (tx, rx) = stream_pair();
    let (trailers_tx, trailers_rx) = future_pair();
    spawn_detached(pump(body, between_bytes, forbidden, map_err, tx, trailers_tx));
    (rx, trailers_rx)
}

async fn pump<B>(
    mut body: B,
    between_bytes: Option<Duration>,
    forbidden: ForbiddenHeaders,
    map_err: fn(B::Error) -> HttpError,
    mut tx: StreamWriter<Bytes>,
    trailers: FutureWriter<Option<Fields>, HttpError>,
) where
    B: Body<Data = Bytes> + Unpin,
{
    loop {
        let frame = match between_bytes {
            Some(limit) => match tokio::time::timeout(limit, body.frame()).await {
                Ok(frame) => frame,
                Err(_) => {
                    let err = HttpError::new(ErrorCode::BetweenBytesTimeout);
                    tx.abort(err.clone());
                    trailers.reject(err);
                    return;
                }
            },
            None => body.frame().await,
        };
        let frame = match frame {
            None => {
                tx.close();
                trailers.resolve(None);
                return;
            }
            Some(Err(e)) => {
                let err = map_err(e);
                tx.abort(err.clone());
                trailers.reject(err);
                return;
            }
            Some(Ok(frame)) => frame,
        };
        match frame.into_data() {
            Ok(data) => {
                if tx.write(data).await.is_err() {
                    return;
                }
            }
            Err(frame) => {
                if let Ok(map) = frame.into_trailers() {
                    tx.close();
                    trailers.resolve(Some(Fields::from_header_map(map, &forbidden)));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{Full, StreamBody};
    use std::convert::Infallible;

    #[tokio::test]
    async fn outgoing_body_yields_data_then_trailers() {
        let (mut tx, rx) = stream_pair();
        let (trailers_tx, trailers_rx) = future_pair();
        let (completion, mut done) = future_pair();
        let body = OutgoingBody::new(rx, trailers_rx, completion);
        tokio::spawn(async move {
            tx.write(Bytes::from_static(b"ab")).await.unwrap();
            tx.write(Bytes::from_static(b"c")).await.unwrap();
            drop(tx);
            let mut t = Fields::new();
            t.append("x-checksum", "abc").unwrap();
            trailers_tx.resolve(Some(t));
        });
        let collected = body.collect().await.unwrap();
        assert_eq!(
            collected.trailers().and_then(|t| t.get("x-checksum")).unwrap(),
            "abc"
        );
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"abc"));
        assert_eq!(done.read().await, Ok(Some(())));
    }

    #[tokio::test]
    async fn dropped_outgoing_body_reports_termination() {
        let (completion, mut done) = future_pair();
        let body = OutgoingBody::new(StreamReader::empty(), FutureReader::ready(None), completion);
        drop(body);
        let err = done.read().await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::ConnectionTerminated);
    }

    #[tokio::test]
    async fn incoming_trailers_arrive_after_the_data() {
        let frames = futures::stream::iter(vec![
            Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"hello "))),
            Ok(Frame::data(Bytes::from_static(b"world"))),
            Ok(Frame::trailers({
                let mut map = http::HeaderMap::new();
                map.insert("x-done", http::HeaderValue::from_static("1"));
                map.insert("connection", http::HeaderValue::from_static("close"));
                map
            })),
        ]);
        let (mut data, mut trailers) = pump_incoming(
            StreamBody::new(frames),
            None,
            ForbiddenHeaders::default(),
            |e| match e {},
        );
        assert_eq!(data.read_all().await.unwrap(), Bytes::from_static(b"hello world"));
        let trailers = trailers.read().await.unwrap().unwrap().unwrap();
        assert_eq!(trailers.get("x-done"), vec![b"1".to_vec()]);
        assert!(!trailers.has("connection"));
    }

    #[tokio::test]
    async fn stalled_bodies_time_out() {
        let body = StreamBody::new(futures::stream::pending::<Result<Frame<Bytes>, Infallible>>());
        let (mut data, mut trailers) = pump_incoming(
            body,
            Some(Duration::from_millis(20)),
            ForbiddenHeaders::default(),
            |e| match e {},
        );
        let err = body_stream_error(data.read().await.unwrap_err());
        assert_eq!(*err.code(), ErrorCode::BetweenBytesTimeout);
        let err = trailers.read().await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::BetweenBytesTimeout);
    }

    #[tokio::test]
    async fn full_bodies_end_without_trailers() {
        let (mut data, mut trailers) = pump_incoming(
            Full::new(Bytes::from_static(b"x")),
            None,
            ForbiddenHeaders::default(),
            |e| match e {},
        );
        assert_eq!(data.read_all().await.unwrap(), Bytes::from_static(b"x"));
        assert!(trailers.read().await.unwrap().unwrap().is_none());
    }
}
