use std::fmt;

use bytes::Bytes;

use super::body::{Contents, OutgoingBody, Trailers};
use super::{ErrorCode, Fields, HttpError, HttpResult};
use crate::future::{FutureReader, FutureWriter, future_pair};
use crate::stream::StreamReader;

/// An HTTP response, either returned by a handler or received by a client.
pub struct Response {
    status: http::StatusCode,
    headers: Fields,
    contents: Contents,
    completion: Option<FutureWriter<(), HttpError>>,
}

impl Response {
    /// Builds a `200 OK` response.
    ///
    /// `headers` become immutable. The returned future settles once the
    /// response has been fully transmitted, or with the error that stopped
    /// it.
    pub fn new(
        mut headers: Fields,
        contents: Option<StreamReader<Bytes>>,
        trailers: Trailers,
    ) -> (Response, FutureReader<(), HttpError>) {
        headers.lock();
        let (completion, transmitted) = future_pair();
        let response = Response {
            status: http::StatusCode::OK,
            headers,
            contents: Contents::new(contents, trailers),
            completion: Some(completion),
        };
        (response, transmitted)
    }

    /// A response received by a client.
    pub(crate) fn incoming(
        status: http::StatusCode,
        mut headers: Fields,
        body: StreamReader<Bytes>,
        trailers: Trailers,
    ) -> Response {
        headers.lock();
        Response {
            status,
            headers,
            contents: Contents::new(Some(body), trailers),
            completion: None,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Sets the status code, which must be within `100..=999`.
    pub fn set_status_code(&mut self, status: u16) -> HttpResult<()> {
        self.status = http::StatusCode::from_u16(status).map_err(|e| {
            HttpError::with_detail(ErrorCode::InvalidArgument, format!("{status}: {e}"))
        })?;
        Ok(())
    }

    /// The response headers, which are always immutable.
    pub fn headers(&self) -> &Fields {
        &self.headers
    }

    /// Takes the body stream.
    ///
    /// Fails with "invalid-state" on every call after the first.
    pub fn body(&mut self) -> HttpResult<StreamReader<Bytes>> {
        self.contents.take_body()
    }

    /// Takes the trailers future.
    pub fn trailers(&mut self) -> HttpResult<Trailers> {
        self.contents.take_trailers()
    }

    pub(crate) fn into_outgoing(mut self) -> HttpResult<hyper::Response<OutgoingBody>> {
        let completion = match self.completion.take() {
            Some(completion) => completion,
            None => future_pair().0,
        };
        let Response {
            status,
            headers,
            contents,
            ..
        } = self;
        let mut response = hyper::Response::new(contents.into_outgoing(completion)?);
        *response.status_mut() = status;
        *response.headers_mut() = headers.to_header_map();
        Ok(response)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn response() -> Response {
        Response::new(Fields::new(), None, FutureReader::ready(None)).0
    }

    #[test]
    fn status_defaults_to_ok() {
        assert_eq!(response().status_code(), 200);
    }

    #[test]
    fn status_range_is_enforced() {
        let mut res = response();
        res.set_status_code(999).unwrap();
        assert_eq!(res.status_code(), 999);
        for bad in [0, 99, 1000] {
            let err = res.set_status_code(bad).unwrap_err();
            assert_eq!(*err.code(), ErrorCode::InvalidArgument);
        }
        assert_eq!(res.status_code(), 999);
    }

    #[test]
    fn trailers_are_taken_once() {
        let mut res = response();
        res.trailers().unwrap();
        assert_eq!(*res.trailers().unwrap_err().code(), ErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn transmitted_future_settles_after_the_body() {
        let headers = Fields::from_list(&[("content-type", "text/plain")]).unwrap();
        let (mut res, mut transmitted) =
            Response::new(headers, None, FutureReader::ready(None));
        res.set_status_code(201).unwrap();
        let outgoing = res.into_outgoing().unwrap();
        assert_eq!(outgoing.status(), 201);
        assert_eq!(outgoing.headers()["content-type"], "text/plain");
        let collected = outgoing.into_body().collect().await.unwrap();
        assert!(collected.to_bytes().is_empty());
        assert_eq!(transmitted.read().await, Ok(Some(())));
    }

    #[test]
    fn a_consumed_body_cannot_be_sent() {
        let mut res = response();
        res.body().unwrap();
        let err = res.into_outgoing().unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InvalidState);
    }
}
