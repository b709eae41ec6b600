//! The listening side: accept MTA connections and dispatch them.
//!
//! One [`Client`] owns one listening endpoint. The accept loop allocates
//! a fresh [`Context`] per connection, hands it to the embedder's
//! `on_connection` callback for handler installation and schedules it as
//! a task; per-connection event ordering is preserved because exactly one
//! task drives each context.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::agent::Agent;
use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::connection_spec::ConnectionSpec;
use crate::context::{Context, DEFAULT_CONTEXT_TIMEOUT, DEFAULT_WRITE_TIMEOUT};
use crate::error::Error;

pub(crate) const DEFAULT_LISTEN_BACKLOG: i32 = 5;
pub(crate) const DEFAULT_UNIX_SOCKET_MODE: u32 = 0o660;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Listener policy knobs, all carrying their conventional defaults.
#[derive(Debug, Clone)]
pub(crate) struct ClientConfig {
    pub listen_backlog: i32,
    pub remove_unix_socket_on_create: bool,
    pub remove_unix_socket_on_close: bool,
    pub unix_socket_mode: u32,
    pub unix_socket_group: Option<String>,
    pub context_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            remove_unix_socket_on_create: true,
            remove_unix_socket_on_close: true,
            unix_socket_mode: DEFAULT_UNIX_SOCKET_MODE,
            unix_socket_group: None,
            context_timeout: DEFAULT_CONTEXT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Ask a running [`Client`] to stop. Cloneable and usable from signal
/// handlers or other tasks.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting, wind down live connections and release the
    /// listening socket.
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }
}

/// The milter endpoint: binds the configured connection spec and serves
/// MTA connections until shut down.
///
/// Built through [`ClientBuilder`](crate::client_builder::ClientBuilder).
pub struct Client {
    spec: ConnectionSpec,
    config: ClientConfig,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Client {
    pub(crate) fn new(spec: ConnectionSpec, config: ClientConfig) -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            spec,
            config,
            shutdown: Arc::new(sender),
            shutdown_rx: receiver,
        }
    }

    /// The connection spec this client will bind.
    pub fn connection_spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown.clone(),
        }
    }

    /// Bind, listen and serve until [`ShutdownHandle::shutdown`] is
    /// called or a listener-scope error occurs.
    ///
    /// `on_connection` runs once per accepted connection, before any
    /// bytes are processed; install the connection's handler there.
    pub async fn run<F>(&mut self, mut on_connection: F) -> Result<(), Error>
    where
        F: FnMut(&mut Context) + Send,
    {
        let listener = self.bind().await?;
        info!("listening on {}", self.spec);

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut tasks = JoinSet::new();
        let mut result = Ok(());

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("shutdown requested");
                    break;
                }
                accepted = Self::accept_split(&listener) => {
                    match accepted {
                        Ok((reader, writer)) => {
                            let mut context = Context::with_limits(
                                self.config.context_timeout,
                                self.config.write_timeout,
                                self.config.max_frame_size,
                            );
                            context.set_writer(writer);
                            on_connection(&mut context);
                            tasks.spawn(Agent::new(reader, context).run(self.shutdown_rx.clone()));
                        }
                        Err(source) => {
                            result = Err(Error::AcceptFailed { source });
                            break;
                        }
                    }
                }
            }
        }

        // Wind down: no new connections, live contexts drain their
        // current stage and close.
        let _ = self.shutdown.send(true);
        while tasks.join_next().await.is_some() {}
        drop(listener);

        if let Some(path) = self.spec.unix_path() {
            if self.config.remove_unix_socket_on_close {
                if let Err(error) = fs::remove_file(path) {
                    if error.kind() != io::ErrorKind::NotFound {
                        warn!("failed to remove {}: {}", path.display(), error);
                    }
                }
            }
        }

        result
    }

    async fn accept_split(listener: &Listener) -> io::Result<(BoxedReader, BoxedWriter)> {
        match listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!("accepted connection from {}", peer);
                let (reader, writer) = stream.into_split();
                let reader: BoxedReader = Box::new(reader);
                let writer: BoxedWriter = Box::new(writer);
                Ok((reader, writer))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("accepted connection on the UNIX socket");
                let (reader, writer) = stream.into_split();
                let reader: BoxedReader = Box::new(reader);
                let writer: BoxedWriter = Box::new(writer);
                Ok((reader, writer))
            }
        }
    }

    async fn bind(&self) -> Result<Listener, Error> {
        match &self.spec {
            ConnectionSpec::Unix { path } => self.bind_unix(path).map(Listener::Unix),
            _ => self.bind_tcp().await.map(Listener::Tcp),
        }
    }

    async fn bind_tcp(&self) -> Result<TcpListener, Error> {
        let (host, port) = self
            .spec
            .bind_endpoint()
            .expect("inet specs always carry an endpoint");
        let want_v6 = matches!(self.spec, ConnectionSpec::Inet6 { .. });

        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|source| Error::BindFailed {
                spec: self.spec.to_string(),
                source,
            })?
            .find(|addr| addr.is_ipv6() == want_v6)
            .ok_or_else(|| Error::BindFailed {
                spec: self.spec.to_string(),
                source: io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "host did not resolve to an address of the requested family",
                ),
            })?;

        let socket = self
            .new_tcp_socket(addr)
            .and_then(|socket| {
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                Ok(socket)
            })
            .map_err(|source| Error::BindFailed {
                spec: self.spec.to_string(),
                source,
            })?;

        socket
            .listen(self.config.listen_backlog as u32)
            .map_err(|source| Error::ListenFailed {
                spec: self.spec.to_string(),
                source,
            })
    }

    fn new_tcp_socket(&self, addr: SocketAddr) -> io::Result<TcpSocket> {
        if addr.is_ipv6() {
            TcpSocket::new_v6()
        } else {
            TcpSocket::new_v4()
        }
    }

    fn bind_unix(&self, path: &PathBuf) -> Result<UnixListener, Error> {
        let unix_error = |reason: String| Error::UnixSocket {
            path: path.clone(),
            reason,
        };

        if self.config.remove_unix_socket_on_create && path.exists() {
            fs::remove_file(path)
                .map_err(|error| unix_error(format!("failed to remove stale socket: {}", error)))?;
        }

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(|source| {
            Error::BindFailed {
                spec: self.spec.to_string(),
                source,
            }
        })?;
        let address = SockAddr::unix(path).map_err(|source| Error::BindFailed {
            spec: self.spec.to_string(),
            source,
        })?;
        socket.bind(&address).map_err(|source| Error::BindFailed {
            spec: self.spec.to_string(),
            source,
        })?;

        self.apply_unix_socket_policy(path)?;

        socket
            .listen(self.config.listen_backlog)
            .map_err(|source| Error::ListenFailed {
                spec: self.spec.to_string(),
                source,
            })?;
        socket
            .set_nonblocking(true)
            .map_err(|error| unix_error(format!("failed to set non-blocking: {}", error)))?;

        let listener: std::os::unix::net::UnixListener = socket.into();
        UnixListener::from_std(listener)
            .map_err(|error| unix_error(format!("failed to register with the runtime: {}", error)))
    }

    /// Apply the configured filesystem mode and group to a freshly bound
    /// UNIX socket path.
    fn apply_unix_socket_policy(&self, path: &Path) -> Result<(), Error> {
        let unix_error = |reason: String| Error::UnixSocket {
            path: path.to_path_buf(),
            reason,
        };

        fs::set_permissions(path, fs::Permissions::from_mode(self.config.unix_socket_mode))
            .map_err(|error| unix_error(format!("failed to change mode: {}", error)))?;

        if let Some(group_name) = &self.config.unix_socket_group {
            let group = nix::unistd::Group::from_name(group_name)
                .map_err(|error| unix_error(format!("failed to look up group: {}", error)))?
                .ok_or_else(|| unix_error(format!("no such group: {}", group_name)))?;
            nix::unistd::chown(path, None, Some(group.gid))
                .map_err(|error| unix_error(format!("failed to change group: {}", error)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    use crate::client_builder::ClientBuilder;
    use crate::codec::{Command, Reply};
    use crate::option_set::OptionSet;

    fn scratch_socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rumilter-{}-{}.sock", name, std::process::id()))
    }

    #[tokio::test]
    async fn serves_negotiate_over_a_unix_socket_and_cleans_up() {
        let _ = env_logger::builder().is_test(true).try_init();

        let path = scratch_socket_path("e2e");
        let _ = fs::remove_file(&path);

        let mut client = ClientBuilder::new()
            .connection_spec(&format!("unix:{}", path.display()))
            .unix_socket_mode(0o600)
            .build()
            .expect("building the client failed");
        let handle = client.shutdown_handle();

        let server = tokio::spawn(async move { client.run(|_context| {}).await });

        // The socket appears once the listener is bound.
        let mut bound = false;
        for _ in 0..200 {
            if path.exists() {
                bound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(bound, "listener never bound {}", path.display());

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(&Command::Negotiate(OptionSet::supported()).to_packet())
            .await
            .unwrap();

        let expected = Reply::Negotiate {
            option: OptionSet::supported(),
            macro_requests: Default::default(),
        }
        .to_packet();
        let mut reply = vec![0u8; expected.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, expected);

        drop(stream);
        handle.shutdown();
        server
            .await
            .expect("server task panicked")
            .expect("run returned an error");

        assert!(!path.exists(), "socket path survived shutdown");
    }

    #[test]
    fn builder_without_spec_is_refused() {
        assert!(matches!(
            ClientBuilder::new().build(),
            Err(Error::MissingSpec)
        ));
    }

    #[test]
    fn builder_rejects_bad_specs_before_binding() {
        assert!(matches!(
            ClientBuilder::new().connection_spec("inet:0").build(),
            Err(Error::BadSpec { .. })
        ));
    }
}
