mod filesystem;
mod http_server;
mod sockets;
mod streams;

use preview2_shim::ShimCtx;

/// A context that may bind and connect anywhere.
pub(crate) fn network_ctx() -> ShimCtx {
    let mut builder = ShimCtx::builder();
    builder.inherit_network();
    builder.build()
}
