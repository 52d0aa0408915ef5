//! Host-side resources for sandboxed guests: a preopen-rooted filesystem,
//! TCP and UDP sockets, name lookup and an HTTP/1.1 client and server.
//!
//! Every blocking OS operation runs on a per-subsystem background worker
//! reached through the [`dispatch`] protocol. Front-end objects such as
//! [`filesystem::Descriptor`], [`sockets::TcpSocket`] or [`http::Request`]
//! only hold opaque handles and talk to their worker by message; bulk data
//! moves through [`stream`]s and single results through [`future`]s.
//!
//! Failures are [`TaggedError`]s whose tag comes from the closed taxonomy
//! of the subsystem that raised them.
//!
//! A [`ShimCtx`] holds the host policy (preopens, network permissions, HTTP
//! timeouts) and is the entry point for creating resources:
//!
//! ```no_run
//! use preview2_shim::ShimCtx;
//! use preview2_shim::sockets::IpAddressFamily;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut builder = ShimCtx::builder();
//! builder.inherit_network();
//! let ctx = builder.build();
//! let mut socket = ctx.create_udp_socket(IpAddressFamily::Ipv4)?;
//! socket.bind("127.0.0.1:0".parse()?).await?;
//! # Ok(())
//! # }
//! ```

mod ctx;
mod error;
mod table;

pub mod dispatch;
pub mod filesystem;
pub mod future;
pub mod http;
pub mod runtime;
pub mod sockets;
pub mod stream;

pub use self::ctx::{DEFAULT_HTTP_TIMEOUT, ShimCtx, ShimCtxBuilder};
pub use self::error::{ErrorTag, TaggedError};
pub use self::filesystem::{DirPerms, FilePerms};
pub use self::table::{ResourceTable, TableError};
