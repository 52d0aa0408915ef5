use crate::filesystem::{Descriptor, Dir, DirPerms, FilePerms};
use crate::http::{ClientConfig, Fields, ForbiddenHeaders};
use crate::sockets::{
    AllowedNetworkUses, IpAddressFamily, SocketAddrCheck, SocketAddrUse, SocketResult, TcpSocket,
    UdpSocket,
};
use anyhow::Result;
use cap_std::ambient_authority;
use http::header::HeaderName;
use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Default budget for each of the three HTTP timeouts.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(600);

/// Builder-style structure used to create a [`ShimCtx`].
///
/// # Examples
///
/// ```
/// use preview2_shim::{DirPerms, FilePerms, ShimCtxBuilder};
///
/// # fn foo() -> anyhow::Result<()> {
/// let mut builder = ShimCtxBuilder::new();
/// builder
///     .preopened_dir("./data", "/data", DirPerms::READ, FilePerms::READ)?
///     .allow_ip_name_lookup(true)
///     .inherit_network();
/// let ctx = builder.build();
/// # Ok(())
/// # }
/// ```
pub struct ShimCtxBuilder {
    preopens: Vec<(cap_std::fs::Dir, DirPerms, FilePerms, String)>,
    socket_addr_check: SocketAddrCheck,
    allowed_network_uses: AllowedNetworkUses,
    allow_blocking_current_thread: bool,
    http: ClientConfig,
    forbidden_headers: HashSet<HeaderName>,
}

impl ShimCtxBuilder {
    /// Creates a builder for a new context with default parameters set.
    ///
    /// The current defaults are:
    ///
    /// * no preopens
    /// * TCP/UDP are allowed but all addresses are denied by default.
    /// * name lookup is denied by default.
    /// * filesystem calls run on tokio's blocking pool.
    /// * HTTP connect, first-byte and between-bytes timeouts are all
    ///   [`DEFAULT_HTTP_TIMEOUT`].
    pub fn new() -> Self {
        ShimCtxBuilder {
            preopens: Vec::new(),
            socket_addr_check: SocketAddrCheck::default(),
            allowed_network_uses: AllowedNetworkUses::default(),
            allow_blocking_current_thread: false,
            http: ClientConfig {
                connect_timeout: DEFAULT_HTTP_TIMEOUT,
                first_byte_timeout: DEFAULT_HTTP_TIMEOUT,
                between_bytes_timeout: DEFAULT_HTTP_TIMEOUT,
            },
            forbidden_headers: HashSet::new(),
        }
    }

    /// Configures a "preopened directory".
    ///
    /// Descriptors reached from it can never name anything outside of
    /// `host_path`; `..` cannot climb above it.
    ///
    /// * `host_path` - the directory on the host to expose.
    /// * `guest_path` - the name it is known by to callers of
    ///   [`ShimCtx::preopens`].
    /// * `dir_perms` - what may be done to this directory and the directories
    ///   beneath it.
    /// * `file_perms` - the most any file beneath it may be opened with.
    ///
    /// # Errors
    ///
    /// This method will return an error if `host_path` cannot be opened.
    pub fn preopened_dir(
        &mut self,
        host_path: impl AsRef<Path>,
        guest_path: impl AsRef<str>,
        dir_perms: DirPerms,
        file_perms: FilePerms,
    ) -> Result<&mut Self> {
        let dir = cap_std::fs::Dir::open_ambient_dir(host_path.as_ref(), ambient_authority())?;
        self.preopens
            .push((dir, dir_perms, file_perms, guest_path.as_ref().to_owned()));
        Ok(self)
    }

    /// Run filesystem calls on the calling thread instead of tokio's
    /// blocking pool.
    ///
    /// Cheaper for small operations, but stalls the executor for as long as
    /// the call blocks.
    pub fn allow_blocking_current_thread(&mut self, enable: bool) -> &mut Self {
        self.allow_blocking_current_thread = enable;
        self
    }

    /// Allow all network addresses accessible to the host.
    ///
    /// See also [`ShimCtxBuilder::socket_addr_check`].
    pub fn inherit_network(&mut self) -> &mut Self {
        self.socket_addr_check(|_, _| Box::pin(async { true }))
    }

    /// A check that will be called for each socket address that is used.
    ///
    /// Returning `true` will permit socket connections to the `SocketAddr`,
    /// while returning `false` will reject the connection.
    pub fn socket_addr_check<F>(&mut self, check: F) -> &mut Self
    where
        F: Fn(SocketAddr, SocketAddrUse) -> Pin<Box<dyn Future<Output = bool> + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.socket_addr_check = SocketAddrCheck::new(check);
        self
    }

    /// Allow resolving host names.
    ///
    /// By default this is disabled.
    pub fn allow_ip_name_lookup(&mut self, enable: bool) -> &mut Self {
        self.allowed_network_uses.ip_name_lookup = enable;
        self
    }

    /// Allow usage of UDP.
    ///
    /// This is enabled by default, but can be disabled if UDP should be blanket
    /// disabled.
    pub fn allow_udp(&mut self, enable: bool) -> &mut Self {
        self.allowed_network_uses.udp = enable;
        self
    }

    /// Allow usage of TCP
    ///
    /// This is enabled by default, but can be disabled if TCP should be blanket
    /// disabled.
    pub fn allow_tcp(&mut self, enable: bool) -> &mut Self {
        self.allowed_network_uses.tcp = enable;
        self
    }

    pub fn http_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.http.connect_timeout = timeout;
        self
    }

    pub fn http_first_byte_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.http.first_byte_timeout = timeout;
        self
    }

    pub fn http_between_bytes_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.http.between_bytes_timeout = timeout;
        self
    }

    /// Adds `name` to the headers that [`Fields`] refuse and that incoming
    /// messages are stripped of.
    pub fn forbidden_header(&mut self, name: HeaderName) -> &mut Self {
        self.forbidden_headers.insert(name);
        self
    }

    /// Uses the configuration so far to construct the final [`ShimCtx`].
    pub fn build(self) -> ShimCtx {
        let ShimCtxBuilder {
            preopens,
            socket_addr_check,
            allowed_network_uses,
            allow_blocking_current_thread,
            http,
            forbidden_headers,
        } = self;
        let preopens = preopens
            .into_iter()
            .map(|(dir, perms, file_perms, guest)| {
                let dir = Dir::preopen(dir, perms, file_perms, allow_blocking_current_thread);
                (dir, guest)
            })
            .collect();
        ShimCtx(Arc::new(Inner {
            preopens,
            socket_addr_check,
            allowed_network_uses,
            http,
            forbidden_headers: ForbiddenHeaders::new(forbidden_headers),
        }))
    }
}

impl Default for ShimCtxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Host configuration shared by every resource created through it.
///
/// Cheap to clone; clones share the same preopens and policies.
#[derive(Clone)]
pub struct ShimCtx(Arc<Inner>);

struct Inner {
    preopens: Vec<(Dir, String)>,
    socket_addr_check: SocketAddrCheck,
    allowed_network_uses: AllowedNetworkUses,
    http: ClientConfig,
    forbidden_headers: ForbiddenHeaders,
}

impl ShimCtx {
    /// Convenience function for calling [`ShimCtxBuilder::new`].
    pub fn builder() -> ShimCtxBuilder {
        ShimCtxBuilder::new()
    }

    /// A descriptor for each preopened directory, with its guest path.
    pub fn preopens(&self) -> Vec<(Descriptor, String)> {
        self.0
            .preopens
            .iter()
            .map(|(dir, guest)| (Descriptor::Dir(dir.clone()), guest.clone()))
            .collect()
    }

    pub fn create_tcp_socket(&self, family: IpAddressFamily) -> SocketResult<TcpSocket> {
        TcpSocket::new(
            &self.0.allowed_network_uses,
            self.0.socket_addr_check.clone(),
            family,
        )
    }

    pub fn create_udp_socket(&self, family: IpAddressFamily) -> SocketResult<UdpSocket> {
        UdpSocket::new(
            &self.0.allowed_network_uses,
            self.0.socket_addr_check.clone(),
            family,
        )
    }

    /// Resolves a host name or IP literal to its addresses.
    pub async fn resolve_addresses(&self, name: &str) -> SocketResult<Vec<IpAddr>> {
        crate::sockets::resolve_addresses(&self.0.allowed_network_uses, name).await
    }

    /// Empty fields that also refuse the extra forbidden headers configured
    /// here.
    pub fn fields(&self) -> Fields {
        Fields::with_forbidden(self.0.forbidden_headers.clone())
    }

    pub(crate) fn http_defaults(&self) -> ClientConfig {
        self.0.http
    }

    pub(crate) fn forbidden_headers(&self) -> &ForbiddenHeaders {
        &self.0.forbidden_headers
    }
}

impl std::fmt::Debug for ShimCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShimCtx")
            .field(
                "preopens",
                &self.0.preopens.iter().map(|(_, g)| g).collect::<Vec<_>>(),
            )
            .field("allowed_network_uses", &self.0.allowed_network_uses)
            .field("http", &self.0.http)
            .finish_non_exhaustive()
    }
}
