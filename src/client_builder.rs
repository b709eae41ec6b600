use std::time::Duration;

use crate::client::{Client, ClientConfig};
use crate::connection_spec::ConnectionSpec;
use crate::error::Error;

/// Configures and builds a [`Client`].
///
/// Only the connection spec is mandatory; every other option carries its
/// conventional default.
///
/// # Example:
/// ```
/// use rumilter::client_builder::ClientBuilder;
///
/// let client = ClientBuilder::new()
///     .connection_spec("inet:10025@localhost")
///     .listen_backlog(16)
///     .context_timeout(std::time::Duration::from_secs(600))
///     .build()
///     .expect("valid listener configuration");
/// ```
#[derive(Debug, Default)]
pub struct ClientBuilder {
    spec: Option<String>,
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint to listen on: `inet:PORT[@HOST]`, `inet6:PORT[@HOST]`
    /// or `unix:PATH`. Mandatory.
    pub fn connection_spec(mut self, spec: &str) -> Self {
        self.spec = Some(spec.to_string());
        self
    }

    /// Backlog passed to `listen(2)`. Default 5.
    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.config.listen_backlog = backlog;
        self
    }

    /// Unlink a pre-existing UNIX socket path before binding. Default
    /// true.
    pub fn remove_unix_socket_on_create(mut self, remove: bool) -> Self {
        self.config.remove_unix_socket_on_create = remove;
        self
    }

    /// Unlink the UNIX socket path after the listener stopped. Default
    /// true.
    pub fn remove_unix_socket_on_close(mut self, remove: bool) -> Self {
        self.config.remove_unix_socket_on_close = remove;
        self
    }

    /// Filesystem mode applied to the UNIX socket after bind. Default
    /// 0660.
    pub fn unix_socket_mode(mut self, mode: u32) -> Self {
        self.config.unix_socket_mode = mode;
        self
    }

    /// Group ownership applied to the UNIX socket after bind. Default:
    /// left unchanged.
    pub fn unix_socket_group(mut self, group: &str) -> Self {
        self.config.unix_socket_group = Some(group.to_string());
        self
    }

    /// Per-connection inactivity timeout. Default 7210 seconds.
    pub fn context_timeout(mut self, timeout: Duration) -> Self {
        self.config.context_timeout = timeout;
        self
    }

    /// Deadline for a single reply write. Default 10 seconds.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Largest accepted frame size. Default 2^24 bytes.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Validate the configuration and produce a [`Client`].
    ///
    /// Fails with [`Error::MissingSpec`] when no connection spec was set
    /// and with [`Error::BadSpec`] when it does not parse; no socket is
    /// created before [`Client::run`].
    pub fn build(self) -> Result<Client, Error> {
        let spec = self.spec.ok_or(Error::MissingSpec)?;
        let spec = ConnectionSpec::parse(&spec)?;
        Ok(Client::new(spec, self.config))
    }
}
