use anyhow::{Context, Result};
use bytes::Bytes;
use preview2_shim::sockets::{ErrorCode, IpAddressFamily, TcpState, UdpState};
use preview2_shim::stream::stream_pair;
use std::net::SocketAddr;

use crate::network_ctx;

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn tcp_echo_over_loopback() -> Result<()> {
    let ctx = network_ctx();
    let mut listener = ctx.create_tcp_socket(IpAddressFamily::Ipv4)?;
    listener.bind(loopback()).await?;
    let mut accepted = listener.listen().await?;
    let addr = listener.local_address()?;
    assert_eq!(listener.state(), TcpState::Listening);

    let server = tokio::spawn(async move {
        let mut conn = accepted
            .read()
            .await?
            .context("listener ended without a connection")?;
        let (echo, _) = conn.receive()?;
        let mut sent = conn.send(echo)?;
        sent.read().await?;
        anyhow::Ok(())
    });

    let mut client = ctx.create_tcp_socket(IpAddressFamily::Ipv4)?;
    client.connect(addr).await?;
    assert_eq!(client.remote_address()?, addr);

    let (mut tx, rx) = stream_pair();
    let mut sent = client.send(rx)?;
    let (mut incoming, _) = client.receive()?;
    tx.write(Bytes::from_static(b"ping ")).await?;
    tx.write(Bytes::from_static(b"pong")).await?;
    drop(tx);
    sent.read().await?;

    assert_eq!(incoming.read_all().await?, Bytes::from_static(b"ping pong"));
    server.await??;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn tcp_connect_needs_a_listener() -> Result<()> {
    let ctx = network_ctx();
    // Reserve a port, then free it so nothing is listening there.
    let addr = {
        let mut probe = ctx.create_tcp_socket(IpAddressFamily::Ipv4)?;
        probe.bind(loopback()).await?;
        probe.local_address()?
    };
    let mut client = ctx.create_tcp_socket(IpAddressFamily::Ipv4)?;
    let err = client.connect(addr).await.unwrap_err();
    assert_eq!(*err.code(), ErrorCode::ConnectionRefused);
    assert_eq!(client.state(), TcpState::Closed);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn udp_send_to_self() -> Result<()> {
    let ctx = network_ctx();
    let mut socket = ctx.create_udp_socket(IpAddressFamily::Ipv4)?;
    socket.bind(loopback()).await?;
    let local = socket.local_address()?;

    socket.send(&b"hello"[..], Some(local)).await?;
    let datagram = socket.receive().await?;
    assert_eq!(datagram.data, Bytes::from_static(b"hello"));
    assert_eq!(datagram.remote_address, local);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn udp_connected_sockets_talk_to_their_peer() -> Result<()> {
    let ctx = network_ctx();
    let mut a = ctx.create_udp_socket(IpAddressFamily::Ipv4)?;
    let mut b = ctx.create_udp_socket(IpAddressFamily::Ipv4)?;
    a.bind(loopback()).await?;
    b.bind(loopback()).await?;
    let (a_addr, b_addr) = (a.local_address()?, b.local_address()?);

    a.connect(b_addr).await?;
    assert_eq!(a.state(), UdpState::Connected(b_addr));
    a.send(Bytes::from_static(b"to b"), None).await?;
    let got = b.receive().await?;
    assert_eq!(got.data, Bytes::from_static(b"to b"));
    assert_eq!(got.remote_address, a_addr);

    let err = a
        .send(Bytes::from_static(b"elsewhere"), Some(a_addr))
        .await
        .unwrap_err();
    assert_eq!(*err.code(), ErrorCode::InvalidArgument);

    a.disconnect().await?;
    assert_eq!(a.state(), UdpState::Bound);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unconnected_udp_needs_a_destination() -> Result<()> {
    let ctx = network_ctx();
    let mut socket = ctx.create_udp_socket(IpAddressFamily::Ipv4)?;
    let err = socket.send(Bytes::from_static(b"x"), None).await.unwrap_err();
    assert_eq!(*err.code(), ErrorCode::InvalidArgument);
    assert_eq!(socket.state(), UdpState::Unbound);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn localhost_resolves_when_allowed() -> Result<()> {
    let mut builder = preview2_shim::ShimCtx::builder();
    builder.allow_ip_name_lookup(true);
    let ctx = builder.build();
    let addrs = ctx.resolve_addresses("127.0.0.1").await?;
    assert_eq!(addrs, ["127.0.0.1".parse::<std::net::IpAddr>()?]);
    Ok(())
}
