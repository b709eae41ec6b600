//! Binds a [`Context`] to the read side of an accepted connection.
//!
//! The agent owns the inbound stream and pumps its bytes through the
//! context's decoder. Replies are written by the context itself, and each
//! write is awaited before the next packet is decoded, so a slow MTA
//! stalls decoding instead of reordering replies.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::context::Context;

const READ_BUFFER_SIZE: usize = 4096;

/// The per-connection read loop.
pub(crate) struct Agent<R> {
    reader: R,
    context: Context,
}

impl<R: AsyncRead + Unpin + Send> Agent<R> {
    pub fn new(reader: R, context: Context) -> Self {
        Self { reader, context }
    }

    /// Drive the connection until the MTA closes it, a fatal error
    /// occurs, the inactivity timeout fires or `shutdown` signals.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("shutdown requested, winding the connection down");
                    self.context.begin_shutdown().await;
                    return;
                }
                read = timeout(self.context.timeout(), self.reader.read(&mut buffer)) => {
                    let len = match read {
                        Err(_) => {
                            debug!("connection timed out, closing silently");
                            self.context.close();
                            return;
                        }
                        Ok(Ok(0)) => {
                            debug!("peer closed the connection");
                            self.context.close();
                            return;
                        }
                        Ok(Ok(len)) => len,
                        Ok(Err(error)) => {
                            warn!("read failed: {}", error);
                            self.context.close();
                            return;
                        }
                    };

                    match AssertUnwindSafe(self.context.feed(&buffer[..len]))
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(true)) => {}
                        Ok(Ok(false)) => return,
                        Ok(Err(error)) => {
                            // The context already answered tempfail and
                            // closed where the state allowed it.
                            warn!("closing connection: {}", error);
                            return;
                        }
                        Err(_) => {
                            warn!("handler panicked, answering tempfail");
                            self.context.fail_close().await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::io::{split, AsyncReadExt, AsyncWriteExt};

    use crate::codec::{Command, Reply, DEFAULT_MAX_FRAME_SIZE};
    use crate::context::DEFAULT_WRITE_TIMEOUT;
    use crate::handler::Handler;
    use crate::option_set::OptionSet;
    use crate::status::Status;

    fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn answers_negotiate_over_a_stream() {
        let (mta_side, filter_side) = tokio::io::duplex(8192);
        let (reader, writer) = split(filter_side);

        let mut context = Context::new();
        context.set_writer(writer);
        let agent = Agent::new(reader, context);

        let (_shutdown_tx, shutdown_rx) = shutdown_channel();
        let task = tokio::spawn(agent.run(shutdown_rx));

        let (mut mta_reader, mut mta_writer) = split(mta_side);
        mta_writer
            .write_all(&Command::Negotiate(OptionSet::supported()).to_packet())
            .await
            .unwrap();

        let expected = Reply::Negotiate {
            option: OptionSet::supported(),
            macro_requests: Default::default(),
        }
        .to_packet();
        let mut reply = vec![0u8; expected.len()];
        mta_reader.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, expected);

        drop(mta_reader);
        drop(mta_writer);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn inactivity_closes_the_connection() {
        let (mta_side, filter_side) = tokio::io::duplex(8192);
        let (reader, writer) = split(filter_side);

        let mut context = Context::with_limits(
            Duration::from_millis(20),
            DEFAULT_WRITE_TIMEOUT,
            DEFAULT_MAX_FRAME_SIZE,
        );
        context.set_writer(writer);
        let agent = Agent::new(reader, context);

        let (_shutdown_tx, shutdown_rx) = shutdown_channel();
        // No bytes ever arrive; the agent must give up on its own.
        tokio::time::timeout(Duration::from_secs(2), agent.run(shutdown_rx))
            .await
            .expect("agent did not time out");

        drop(mta_side);
    }

    #[tokio::test]
    async fn handler_panic_yields_tempfail_and_close() {
        struct PanicsOnHelo;

        #[async_trait]
        impl Handler for PanicsOnHelo {
            async fn on_helo(&mut self, _context: &mut Context, _fqdn: &str) -> Status {
                panic!("boom");
            }
        }

        let (mta_side, filter_side) = tokio::io::duplex(8192);
        let (reader, writer) = split(filter_side);

        let mut context = Context::new();
        context.set_handler(Box::new(PanicsOnHelo));
        context.set_writer(writer);
        let agent = Agent::new(reader, context);

        let (_shutdown_tx, shutdown_rx) = shutdown_channel();
        let task = tokio::spawn(agent.run(shutdown_rx));

        let (mut mta_reader, mut mta_writer) = split(mta_side);
        mta_writer
            .write_all(&Command::Negotiate(OptionSet::supported()).to_packet())
            .await
            .unwrap();
        mta_writer
            .write_all(
                &Command::Connect {
                    hostname: "mta".into(),
                    socket: crate::codec::SocketInfo {
                        family: crate::codec::SocketFamily::Inet,
                        port: 25,
                        address: "192.0.2.9".into(),
                    },
                }
                .to_packet(),
            )
            .await
            .unwrap();
        mta_writer
            .write_all(&Command::Helo { fqdn: "kaboom".into() }.to_packet())
            .await
            .unwrap();

        let mut received = Vec::new();
        mta_reader.read_to_end(&mut received).await.unwrap();
        task.await.unwrap();

        let mut expected = Reply::Negotiate {
            option: OptionSet::supported(),
            macro_requests: Default::default(),
        }
        .to_packet();
        expected.extend(Reply::Continue.to_packet());
        expected.extend(Reply::TempFail.to_packet());
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn shutdown_mid_message_answers_tempfail() {
        let (mta_side, filter_side) = tokio::io::duplex(8192);
        let (reader, writer) = split(filter_side);

        let mut context = Context::new();
        context.set_writer(writer);
        let agent = Agent::new(reader, context);

        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let task = tokio::spawn(agent.run(shutdown_rx));

        let (mut mta_reader, mut mta_writer) = split(mta_side);
        mta_writer
            .write_all(&Command::Negotiate(OptionSet::supported()).to_packet())
            .await
            .unwrap();
        mta_writer
            .write_all(
                &Command::Mail {
                    sender: "<alice@example.org>".into(),
                    args: vec![],
                }
                .to_packet(),
            )
            .await
            .unwrap();

        // Consume the negotiate reply and the envelope continue first so
        // the shutdown tempfail is the only byte sequence left.
        let mut upfront = vec![
            0u8;
            Reply::Negotiate {
                option: OptionSet::supported(),
                macro_requests: Default::default(),
            }
            .to_packet()
            .len() + Reply::Continue.to_packet().len()
        ];
        mta_reader.read_exact(&mut upfront).await.unwrap();

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let mut rest = Vec::new();
        mta_reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, Reply::TempFail.to_packet());
    }
}
