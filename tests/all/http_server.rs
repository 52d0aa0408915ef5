use anyhow::Result;
use bytes::Bytes;
use preview2_shim::future::FutureReader;
use preview2_shim::http::{
    ErrorCode, Fields, HttpServer, Method, Request, RequestOptions, Response, send_request,
};
use preview2_shim::stream::{StreamWriter, stream_pair};
use std::net::SocketAddr;
use std::time::Duration;

use crate::network_ctx;

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Answers every request with its own headers and body.
async fn echo(mut request: Request) -> Result<Response> {
    let body = request.body()?;
    let (response, _) = Response::new(
        request.headers().clone(),
        Some(body),
        FutureReader::ready(None),
    );
    Ok(response)
}

fn post_to(addr: SocketAddr, headers: Fields) -> Result<(Request, StreamWriter<Bytes>)> {
    let (tx, rx) = stream_pair();
    let (mut request, _) = Request::new(headers, Some(rx), FutureReader::ready(None), None);
    request.set_method(Method::Post)?;
    request.set_authority(Some(&addr.to_string()))?;
    request.set_path_with_query(Some("/echo?x=1"))?;
    Ok((request, tx))
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn echo_server_round_trip() -> Result<()> {
    let ctx = network_ctx();
    let mut server = HttpServer::new(&ctx, loopback(), echo).await?;
    let addr = server.local_addr();
    assert_ne!(addr.port(), 0);

    let headers = Fields::from_list(&[("x-echo", "yes"), ("X-Multi", "1"), ("x-multi", "2")])?;
    let (request, mut body) = post_to(addr, headers)?;
    let writer = tokio::spawn(async move {
        for chunk in ["first ", "second ", "third"] {
            body.write(Bytes::from(chunk)).await?;
        }
        anyhow::Ok(())
    });

    let mut response = send_request(&ctx, request).await?;
    writer.await??;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.headers().get("x-echo"), [b"yes".to_vec()]);
    assert_eq!(
        response.headers().get("x-multi"),
        [b"1".to_vec(), b"2".to_vec()]
    );
    let body = response.body()?.read_all().await?;
    assert_eq!(body, Bytes::from_static(b"first second third"));
    assert!(matches!(response.trailers()?.read().await?, Some(None)));

    server.stop();
    assert!(server.is_stopped());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn failing_handlers_answer_500() -> Result<()> {
    let ctx = network_ctx();
    let server = HttpServer::new(&ctx, loopback(), |_: Request| async {
        Err::<Response, _>(anyhow::anyhow!("no route"))
    })
    .await?;

    let (request, body) = post_to(server.local_addr(), Fields::new())?;
    drop(body);
    let mut response = send_request(&ctx, request).await?;
    assert_eq!(response.status_code(), 500);
    assert!(response.body()?.read_all().await?.is_empty());
    server.close();
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stopped_servers_refuse_connections() -> Result<()> {
    let ctx = network_ctx();
    let server = HttpServer::new(&ctx, loopback(), echo).await?;
    let addr = server.local_addr();
    server.close();
    // Let the worker release the listener.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (request, body) = post_to(addr, Fields::new())?;
    drop(body);
    let err = send_request(&ctx, request).await.unwrap_err();
    assert_eq!(*err.code(), ErrorCode::ConnectionRefused);
    Ok(())
}

fn get_with(addr: SocketAddr, options: RequestOptions) -> Result<Request> {
    let (mut request, _) = Request::new(
        Fields::new(),
        None,
        FutureReader::ready(None),
        Some(options),
    );
    request.set_authority(Some(&addr.to_string()))?;
    Ok(request)
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn silent_servers_hit_the_first_byte_timeout() -> Result<()> {
    let listener = tokio::net::TcpListener::bind(loopback()).await?;
    let addr = listener.local_addr()?;
    // Accept and hold the connection without ever answering.
    let _silent = tokio::spawn(async move {
        let (conn, _) = listener.accept().await?;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(conn);
        anyhow::Ok(())
    });

    let options = RequestOptions {
        first_byte_timeout: Some(Duration::from_millis(100)),
        ..RequestOptions::default()
    };
    let err = send_request(&network_ctx(), get_with(addr, options)?)
        .await
        .unwrap_err();
    assert_eq!(*err.code(), ErrorCode::ConnectionReadTimeout);
    Ok(())
}

// Once a listener's accept queue is full, Linux drops further SYNs, so a
// connect attempt hangs until its deadline.
#[cfg(target_os = "linux")]
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unanswered_connects_hit_the_connect_timeout() -> Result<()> {
    let socket = tokio::net::TcpSocket::new_v4()?;
    socket.bind(loopback())?;
    let listener = socket.listen(1)?;
    let addr = listener.local_addr()?;

    let mut backlog = Vec::new();
    let queue_full = tokio::task::spawn_blocking(move || {
        for _ in 0..16 {
            match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(conn) => backlog.push(conn),
                Err(_) => return Some(backlog),
            }
        }
        None
    })
    .await?;
    let Some(_backlog) = queue_full else {
        panic!("accept queue never filled up");
    };

    let options = RequestOptions {
        connect_timeout: Some(Duration::from_millis(200)),
        ..RequestOptions::default()
    };
    let err = send_request(&network_ctx(), get_with(addr, options)?)
        .await
        .unwrap_err();
    assert_eq!(*err.code(), ErrorCode::ConnectionTimeout);
    drop(listener);
    Ok(())
}
