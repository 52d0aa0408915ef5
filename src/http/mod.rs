//! HTTP/1.1 client and server over the HTTP background worker.
//!
//! Messages are [`Request`] and [`Response`] values whose headers are
//! immutable [`Fields`] and whose bodies are byte streams. Trailers travel
//! beside the body as a future, since they are only known once the body
//! has ended. Outgoing requests are sent with [`send_request`]; incoming
//! ones are served by an [`HttpServer`] calling a [`Handler`].

mod body;
mod client;
mod error;
mod fields;
mod io;
mod request;
mod response;
mod server;
mod worker;

pub use self::body::Trailers;
pub use self::client::send_request;
pub use self::error::{ErrorCode, HeaderError, HttpError, HttpResult};
pub use self::fields::Fields;
pub use self::request::{Method, Request, RequestOptions, Scheme};
pub use self::response::Response;
pub use self::server::{Handler, HttpServer};

pub(crate) use self::fields::ForbiddenHeaders;
pub(crate) use self::worker::ClientConfig;
