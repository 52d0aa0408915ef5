use super::worker::{ClientConfig, HttpRequest, ROUTER};
use super::{ErrorCode, HttpError, HttpResult, Request, RequestOptions, Response};
use crate::ctx::ShimCtx;

/// Sends `request` and waits for the head of its response.
///
/// The request body is streamed while the response is awaited; the future
/// returned by [`Request::new`] reports whether it was fully transmitted.
/// The response body and trailers arrive through the returned
/// [`Response`]. Timeouts not set on the request come from `ctx`.
pub async fn send_request(ctx: &ShimCtx, request: Request) -> HttpResult<Response> {
    let (request, target) = request.into_outgoing()?;
    if target.scheme == http::uri::Scheme::HTTPS {
        return Err(HttpError::with_detail(
            ErrorCode::InternalError,
            "TLS is not supported",
        ));
    }
    let config = effective_config(ctx.http_defaults(), &target.options);
    tracing::debug!(
        method = %request.method(),
        authority = %target.authority,
        path = %request.uri(),
        "sending request"
    );
    ROUTER
        .submit(HttpRequest::ClientRequest {
            request,
            target,
            config,
            forbidden: ctx.forbidden_headers().clone(),
        })
        .await?
        .response()
}

fn effective_config(defaults: ClientConfig, options: &RequestOptions) -> ClientConfig {
    ClientConfig {
        connect_timeout: options.connect_timeout.unwrap_or(defaults.connect_timeout),
        first_byte_timeout: options
            .first_byte_timeout
            .unwrap_or(defaults.first_byte_timeout),
        between_bytes_timeout: options
            .between_bytes_timeout
            .unwrap_or(defaults.between_bytes_timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureReader;
    use crate::http::{Fields, Scheme};
    use std::time::Duration;

    fn defaults() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(600),
            first_byte_timeout: Duration::from_secs(600),
            between_bytes_timeout: Duration::from_secs(600),
        }
    }

    #[test]
    fn request_options_override_defaults() {
        let options = RequestOptions {
            first_byte_timeout: Some(Duration::from_millis(5)),
            ..RequestOptions::default()
        };
        let config = effective_config(defaults(), &options);
        assert_eq!(config.connect_timeout, Duration::from_secs(600));
        assert_eq!(config.first_byte_timeout, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn https_is_rejected() {
        let (mut req, _) = Request::new(Fields::new(), None, FutureReader::ready(None), None);
        req.set_scheme(Some(Scheme::Https)).unwrap();
        req.set_authority(Some("localhost")).unwrap();
        let err = send_request(&ShimCtx::builder().build(), req).await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InternalError);
    }

    #[tokio::test]
    async fn missing_authority_is_invalid() {
        let (req, _) = Request::new(Fields::new(), None, FutureReader::ready(None), None);
        let err = send_request(&ShimCtx::builder().build(), req).await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InvalidArgument);
    }
}
