use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::uri::{Authority, PathAndQuery};

use super::body::{Contents, OutgoingBody, Trailers};
use super::fields::ForbiddenHeaders;
use super::{ErrorCode, Fields, HttpError, HttpResult};
use crate::future::{FutureReader, FutureWriter, future_pair};
use crate::stream::StreamReader;

/// An HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Other(String),
}

impl From<&http::Method> for Method {
    fn from(method: &http::Method) -> Self {
        if method == http::Method::GET {
            Method::Get
        } else if method == http::Method::HEAD {
            Method::Head
        } else if method == http::Method::POST {
            Method::Post
        } else if method == http::Method::PUT {
            Method::Put
        } else if method == http::Method::DELETE {
            Method::Delete
        } else if method == http::Method::CONNECT {
            Method::Connect
        } else if method == http::Method::OPTIONS {
            Method::Options
        } else if method == http::Method::TRACE {
            Method::Trace
        } else if method == http::Method::PATCH {
            Method::Patch
        } else {
            Method::Other(method.to_string())
        }
    }
}

impl TryFrom<&Method> for http::Method {
    type Error = http::method::InvalidMethod;

    fn try_from(method: &Method) -> Result<Self, Self::Error> {
        match method {
            Method::Get => Ok(http::Method::GET),
            Method::Head => Ok(http::Method::HEAD),
            Method::Post => Ok(http::Method::POST),
            Method::Put => Ok(http::Method::PUT),
            Method::Delete => Ok(http::Method::DELETE),
            Method::Connect => Ok(http::Method::CONNECT),
            Method::Options => Ok(http::Method::OPTIONS),
            Method::Trace => Ok(http::Method::TRACE),
            Method::Patch => Ok(http::Method::PATCH),
            Method::Other(s) => http::Method::from_bytes(s.as_bytes()),
        }
    }
}

/// The scheme of a request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Other(String),
}

impl From<&http::uri::Scheme> for Scheme {
    fn from(scheme: &http::uri::Scheme) -> Self {
        if *scheme == http::uri::Scheme::HTTP {
            Scheme::Http
        } else if *scheme == http::uri::Scheme::HTTPS {
            Scheme::Https
        } else {
            Scheme::Other(scheme.as_str().to_owned())
        }
    }
}

impl TryFrom<&Scheme> for http::uri::Scheme {
    type Error = http::uri::InvalidUri;

    fn try_from(scheme: &Scheme) -> Result<Self, Self::Error> {
        match scheme {
            Scheme::Http => Ok(http::uri::Scheme::HTTP),
            Scheme::Https => Ok(http::uri::Scheme::HTTPS),
            Scheme::Other(s) => s.as_str().try_into(),
        }
    }
}

/// Per-request timeouts; unset values fall back to the context defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// How long to wait for a connection to be established.
    pub connect_timeout: Option<Duration>,
    /// How long to wait for the head of the response.
    pub first_byte_timeout: Option<Duration>,
    /// How long to wait between frames of the response body.
    pub between_bytes_timeout: Option<Duration>,
}

/// An HTTP request, either built to be sent or received by a server.
pub struct Request {
    method: http::Method,
    scheme: Option<http::uri::Scheme>,
    authority: Option<Authority>,
    path_with_query: Option<PathAndQuery>,
    headers: Fields,
    contents: Contents,
    options: Option<RequestOptions>,
    completion: Option<FutureWriter<(), HttpError>>,
}

impl Request {
    /// Builds a `GET` request with no URL parts set.
    ///
    /// `headers` become immutable. The returned future settles once the
    /// request has been fully transmitted, or with the error that stopped
    /// it.
    pub fn new(
        mut headers: Fields,
        contents: Option<StreamReader<Bytes>>,
        trailers: Trailers,
        options: Option<RequestOptions>,
    ) -> (Request, FutureReader<(), HttpError>) {
        headers.lock();
        let (completion, transmitted) = future_pair();
        let request = Request {
            method: http::Method::GET,
            scheme: None,
            authority: None,
            path_with_query: None,
            headers,
            contents: Contents::new(contents, trailers),
            options,
            completion: Some(completion),
        };
        (request, transmitted)
    }

    /// A request received by a server.
    ///
    /// Origin-form requests take their authority from the `Host` header
    /// before forbidden headers are stripped.
    pub(crate) fn incoming(
        mut parts: http::request::Parts,
        forbidden: &ForbiddenHeaders,
        body: StreamReader<Bytes>,
        trailers: Trailers,
    ) -> Request {
        let uri = parts.uri.into_parts();
        let authority = uri.authority.or_else(|| {
            parts
                .headers
                .get(http::header::HOST)
                .and_then(|host| Authority::try_from(host.as_bytes()).ok())
        });
        let mut headers = Fields::from_header_map(std::mem::take(&mut parts.headers), forbidden);
        headers.lock();
        Request {
            method: parts.method,
            scheme: Some(uri.scheme.unwrap_or(http::uri::Scheme::HTTP)),
            authority,
            path_with_query: uri.path_and_query,
            headers,
            contents: Contents::new(Some(body), trailers),
            options: None,
            completion: None,
        }
    }

    pub fn method(&self) -> Method {
        Method::from(&self.method)
    }

    pub fn set_method(&mut self, method: Method) -> HttpResult<()> {
        self.method = http::Method::try_from(&method).map_err(invalid)?;
        Ok(())
    }

    pub fn scheme(&self) -> Option<Scheme> {
        self.scheme.as_ref().map(Scheme::from)
    }

    pub fn set_scheme(&mut self, scheme: Option<Scheme>) -> HttpResult<()> {
        self.scheme = match scheme {
            Some(scheme) => Some(http::uri::Scheme::try_from(&scheme).map_err(invalid)?),
            None => None,
        };
        Ok(())
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_ref().map(Authority::as_str)
    }

    /// Sets the `host[:port]` the request is sent to.
    ///
    /// A port separator without a valid port is rejected.
    pub fn set_authority(&mut self, authority: Option<&str>) -> HttpResult<()> {
        let Some(authority) = authority else {
            self.authority = None;
            return Ok(());
        };
        let has_port = authority.contains(':') && !authority.ends_with(']');
        let parsed = Authority::try_from(authority).map_err(invalid)?;
        if has_port && parsed.port_u16().is_none() {
            return Err(HttpError::with_detail(
                ErrorCode::InvalidArgument,
                format!("invalid port in authority {authority:?}"),
            ));
        }
        self.authority = Some(parsed);
        Ok(())
    }

    pub fn path_with_query(&self) -> Option<&str> {
        self.path_with_query.as_ref().map(PathAndQuery::as_str)
    }

    pub fn set_path_with_query(&mut self, path_with_query: Option<&str>) -> HttpResult<()> {
        self.path_with_query = match path_with_query {
            Some(pq) => Some(PathAndQuery::try_from(pq).map_err(invalid)?),
            None => None,
        };
        Ok(())
    }

    /// The request headers, which are always immutable.
    pub fn headers(&self) -> &Fields {
        &self.headers
    }

    pub fn options(&self) -> Option<&RequestOptions> {
        self.options.as_ref()
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

    /// Splits the request into what hyper sends and the options it was
    /// built with.
    ///
    /// The URI is left in origin form; the authority travels separately
    /// so the caller can connect to it.
    pub(crate) fn into_outgoing(
        mut self,
    ) -> HttpResult<(hyper::Request<OutgoingBody>, OutgoingTarget)> {
        let authority = self.authority.take().ok_or_else(|| {
            HttpError::with_detail(ErrorCode::InvalidArgument, "request has no authority")
        })?;
        let scheme = self.scheme.take().unwrap_or(http::uri::Scheme::HTTP);
        let path = self
            .path_with_query
            .take()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        let completion = match self.completion.take() {
            Some(completion) => completion,
            None => future_pair().0,
        };
        let Request {
            method,
            headers,
            contents,
            options,
            ..
        } = self;
        let body = contents.into_outgoing(completion)?;
        let mut request = hyper::Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = http::Uri::from(path);
        *request.headers_mut() = headers.to_header_map();
        let target = OutgoingTarget {
            scheme,
            authority,
            options: options.unwrap_or_default(),
        };
        Ok((request, target))
    }
}

/// Where an outgoing request goes.
#[derive(Debug)]
pub(crate) struct OutgoingTarget {
    pub(crate) scheme: http::uri::Scheme,
    pub(crate) authority: Authority,
    pub(crate) options: RequestOptions,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("scheme", &self.scheme)
            .field("authority", &self.authority)
            .field("path_with_query", &self.path_with_query)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

fn invalid(err: impl fmt::Display) -> HttpError {
    HttpError::with_detail(ErrorCode::InvalidArgument, err.to_string())
}
