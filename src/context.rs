//! The per-connection protocol state machine.
//!
//! A [`Context`] consumes decoded commands, invokes the installed
//! [`Handler`] once per stage and writes the reply packets. It owns the
//! negotiated option set, the macros received for each stage and the
//! (detachable) writer the replies go to.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::codec::{Command, Decoder, Reply, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{ActionError, ProtocolError};
use crate::handler::{DefaultHandler, Handler};
use crate::macros::{MacroRequests, MacroSet, MacroStage};
use crate::option_set::{ActionFlags, OptionSet, StepFlags};
use crate::status::Status;

/// Default inactivity timeout, per milter convention.
pub const DEFAULT_CONTEXT_TIMEOUT: Duration = Duration::from_secs(7210);
/// Default deadline for a single reply write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a connection currently stands in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    Negotiated,
    Connected,
    Greeted,
    EnvelopeFrom,
    Recipient,
    Data,
    Header,
    EndOfHeader,
    Body,
    EndOfMessage,
    Aborted,
    Quitting,
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Start => "start",
            State::Negotiated => "negotiated",
            State::Connected => "connected",
            State::Greeted => "greeted",
            State::EnvelopeFrom => "envelope-from",
            State::Recipient => "recipient",
            State::Data => "data",
            State::Header => "header",
            State::EndOfHeader => "end-of-header",
            State::Body => "body",
            State::EndOfMessage => "end-of-message",
            State::Aborted => "aborted",
            State::Quitting => "quitting",
            State::Closed => "closed",
        }
    }

    /// Whether a message envelope is currently in flight.
    fn in_message(self) -> bool {
        matches!(
            self,
            State::EnvelopeFrom
                | State::Recipient
                | State::Data
                | State::Header
                | State::EndOfHeader
                | State::Body
                | State::EndOfMessage
        )
    }
}

// States a message-scoped command may arrive from. Negotiated steps can
// suppress any preceding stage, so each command accepts every state its
// suppressible predecessors would have left behind.
const ACCEPT_MAIL: &[State] = &[
    State::Negotiated,
    State::Connected,
    State::Greeted,
    State::EnvelopeFrom,
    State::Aborted,
    State::EndOfMessage,
];
const ACCEPT_RCPT: &[State] = &[State::EnvelopeFrom, State::Recipient];
const ACCEPT_DATA: &[State] = &[State::EnvelopeFrom, State::Recipient];
const ACCEPT_HEADER: &[State] = &[
    State::EnvelopeFrom,
    State::Recipient,
    State::Data,
    State::Header,
];
const ACCEPT_EOH: &[State] = &[
    State::EnvelopeFrom,
    State::Recipient,
    State::Data,
    State::Header,
];
const ACCEPT_BODY: &[State] = &[
    State::EnvelopeFrom,
    State::Recipient,
    State::Data,
    State::Header,
    State::EndOfHeader,
    State::Body,
];
const ACCEPT_EOM: &[State] = ACCEPT_BODY;

/// The per-connection protocol engine.
///
/// Feed it raw bytes from the MTA; it decodes them, drives the state
/// machine and answers through the attached writer. Constructed by the
/// listener for every accepted connection, or directly in tests and
/// embeddings that bring their own transport.
pub struct Context {
    state: State,
    option: OptionSet,
    macros: MacroSet,
    handler: Option<Box<dyn Handler>>,
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    decoder: Decoder,
    timeout: Duration,
    write_timeout: Duration,
}

impl Context {
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_CONTEXT_TIMEOUT,
            DEFAULT_WRITE_TIMEOUT,
            DEFAULT_MAX_FRAME_SIZE,
        )
    }

    pub(crate) fn with_limits(
        timeout: Duration,
        write_timeout: Duration,
        max_frame_size: usize,
    ) -> Self {
        Self {
            state: State::Start,
            option: OptionSet::supported(),
            macros: MacroSet::default(),
            handler: Some(Box::new(DefaultHandler)),
            writer: None,
            decoder: Decoder::new(max_frame_size),
            timeout,
            write_timeout,
        }
    }

    /// Install the handler receiving this connection's events.
    pub fn set_handler(&mut self, handler: Box<dyn Handler>) {
        self.handler = Some(handler);
    }

    /// Attach the sink replies are written to.
    pub fn set_writer(&mut self, writer: impl AsyncWrite + Send + Unpin + 'static) {
        self.writer = Some(Box::new(writer));
    }

    /// Detach the writer; subsequent reply emissions are silently
    /// dropped. Idempotent, and without effect on the state machine.
    pub fn detach_writer(&mut self) {
        self.writer = None;
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The negotiated option set. Before negotiation this is the full
    /// supported set.
    pub fn option(&self) -> &OptionSet {
        &self.option
    }

    /// The macros last received for `stage`.
    pub fn macros(&self, stage: MacroStage) -> Option<&HashMap<String, String>> {
        self.macros.stage(stage)
    }

    /// Look up a macro by symbol name across all stages.
    pub fn macro_value(&self, name: &str) -> Option<&str> {
        self.macros.lookup(name)
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Push bytes received from the MTA through the decoder and process
    /// every complete packet.
    ///
    /// Returns `true` while the connection should stay open. On a decode
    /// or state error a tempfail is attempted, the context closes and the
    /// error propagates; the connection is done either way.
    pub async fn feed(&mut self, bytes: &[u8]) -> Result<bool, ProtocolError> {
        match self.feed_decoded(bytes).await {
            Ok(keep_open) => Ok(keep_open),
            Err(error) => {
                let _ = self.send(Reply::TempFail).await;
                self.state = State::Closed;
                Err(error)
            }
        }
    }

    async fn feed_decoded(&mut self, bytes: &[u8]) -> Result<bool, ProtocolError> {
        self.decoder.feed(bytes);
        while let Some(command) = self.decoder.next_command()? {
            if !self.process(command).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn process(&mut self, command: Command) -> Result<bool, ProtocolError> {
        trace!("received {} in state {}", command, self.state.name());

        match self.state {
            State::Closed => return Ok(false),
            State::Quitting => {
                self.send(Reply::TempFail).await?;
                self.state = State::Closed;
                return Ok(false);
            }
            _ => {}
        }

        match command {
            Command::Negotiate(offered) => self.negotiate(offered).await,
            Command::Quit => {
                self.state = State::Closed;
                Ok(false)
            }
            Command::QuitNewConnection => {
                self.expect_live(b'K')?;
                self.macros.clear();
                self.state = State::Negotiated;
                Ok(true)
            }
            Command::Abort => {
                self.expect_live(b'A')?;
                self.state = State::Aborted;
                let mut handler = self.take_handler();
                handler.on_abort(self).await;
                self.handler = Some(handler);
                Ok(true)
            }
            Command::DefineMacro { stage, pairs } => {
                self.expect_live(b'D')?;
                let map: HashMap<String, String> = pairs.into_iter().collect();
                let mut handler = self.take_handler();
                handler.on_define_macro(self, stage, &map).await;
                self.handler = Some(handler);
                self.macros.define(stage, map);
                Ok(true)
            }
            Command::Unknown(verb) => {
                self.expect_live(b'U')?;
                let mut handler = self.take_handler();
                let status = handler.on_unknown(self, &verb).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::NR_UNKNOWN, self.state)
                    .await
            }
            Command::Connect { hostname, socket } => {
                self.expect_state(b'C', &[State::Negotiated])?;
                self.state = State::Connected;
                let mut handler = self.take_handler();
                let status = handler.on_connect(self, &hostname, &socket).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::NR_CONNECT, State::Connected)
                    .await
            }
            Command::Helo { fqdn } => {
                self.expect_state(b'H', &[State::Connected])?;
                self.state = State::Greeted;
                let mut handler = self.take_handler();
                let status = handler.on_helo(self, &fqdn).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::NR_HELO, State::Greeted)
                    .await
            }
            Command::Mail { sender, args } => {
                self.expect_state(b'M', ACCEPT_MAIL)?;
                self.state = State::EnvelopeFrom;
                let mut handler = self.take_handler();
                let status = handler.on_envelope_from(self, &sender, &args).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::NR_MAIL, State::Greeted)
                    .await
            }
            Command::Rcpt { recipient, args } => {
                self.expect_state(b'R', ACCEPT_RCPT)?;
                self.state = State::Recipient;
                let mut handler = self.take_handler();
                let status = handler.on_envelope_recipient(self, &recipient, &args).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::NR_RECIPIENT, State::EnvelopeFrom)
                    .await
            }
            Command::Data => {
                self.expect_state(b'T', ACCEPT_DATA)?;
                self.state = State::Data;
                let mut handler = self.take_handler();
                let status = handler.on_data(self).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::NR_DATA, State::EnvelopeFrom)
                    .await
            }
            Command::Header { name, value } => {
                self.expect_state(b'L', ACCEPT_HEADER)?;
                self.state = State::Header;
                let mut handler = self.take_handler();
                let status = handler.on_header(self, &name, &value).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::NR_HEADER, State::EnvelopeFrom)
                    .await
            }
            Command::EndOfHeader => {
                self.expect_state(b'N', ACCEPT_EOH)?;
                self.state = State::EndOfHeader;
                let mut handler = self.take_handler();
                let status = handler.on_end_of_header(self).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::NR_END_OF_HEADER, State::EnvelopeFrom)
                    .await
            }
            Command::Body(chunk) => {
                self.expect_state(b'B', ACCEPT_BODY)?;
                self.state = State::Body;
                let mut handler = self.take_handler();
                let status = handler.on_body(self, &chunk).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::NR_BODY, State::EnvelopeFrom)
                    .await
            }
            Command::EndOfMessage(final_chunk) => {
                self.expect_state(b'E', ACCEPT_EOM)?;
                self.state = State::EndOfMessage;
                let mut handler = self.take_handler();
                let status = handler.on_end_of_message(self, &final_chunk).await;
                self.handler = Some(handler);
                self.finish_stage(status, StepFlags::empty(), State::EndOfMessage)
                    .await
            }
        }
    }

    async fn negotiate(&mut self, offered: OptionSet) -> Result<bool, ProtocolError> {
        self.expect_state(b'O', &[State::Start])?;

        let mut option = match OptionSet::supported().intersect(&offered) {
            Ok(option) => option,
            Err(error) => {
                warn!("negotiation failed: {}", error);
                self.send(Reply::TempFail).await?;
                self.state = State::Closed;
                return Ok(false);
            }
        };

        let mut macro_requests = MacroRequests::new();
        let mut handler = self.take_handler();
        let status = handler
            .on_negotiate(self, &mut option, &mut macro_requests)
            .await;
        self.handler = Some(handler);

        if status.is_terminal() {
            self.send_terminal(status).await?;
            self.state = State::Closed;
            return Ok(false);
        }

        option.clamp_to(&offered);
        debug!(
            "negotiated version {}, actions {:?}, steps {:?}",
            option.version, option.actions, option.steps
        );
        self.option = option.clone();
        self.state = State::Negotiated;
        self.send(Reply::Negotiate {
            option,
            macro_requests,
        })
        .await?;
        Ok(true)
    }

    /// Write the reply for a completed stage and settle the follow-up
    /// state. `terminal_state` is where a terminal verdict leaves the
    /// connection, ready for the commands adjacent to the one just
    /// handled.
    async fn finish_stage(
        &mut self,
        status: Status,
        no_reply_bit: StepFlags,
        terminal_state: State,
    ) -> Result<bool, ProtocolError> {
        if !no_reply_bit.is_empty() && self.option.suppresses_reply(no_reply_bit) {
            if !matches!(status, Status::Continue | Status::NoReply) {
                warn!(
                    "dropping {:?}: the reply for this stage was negotiated away",
                    status
                );
            }
            return Ok(true);
        }

        let skip_allowed = self.option.steps.contains(StepFlags::SKIP);
        let terminal = status.is_terminal() || matches!(status, Status::Skip if !skip_allowed);

        match status {
            Status::NoReply => {}
            Status::Continue => self.send(Reply::Continue).await?,
            Status::Progress => self.send(Reply::Progress).await?,
            Status::Skip => {
                if skip_allowed {
                    self.send(Reply::Skip).await?;
                } else {
                    warn!("skip was not negotiated, answering tempfail");
                    self.send(Reply::TempFail).await?;
                }
            }
            terminal_status => self.send_terminal(terminal_status).await?,
        }

        if terminal {
            self.state = terminal_state;
        }
        Ok(true)
    }

    async fn send_terminal(&mut self, status: Status) -> Result<(), ProtocolError> {
        let reply = match status {
            Status::Accept => Reply::Accept,
            Status::Reject => Reply::Reject,
            Status::TempFail => Reply::TempFail,
            Status::Discard => Reply::Discard,
            Status::ReplyCode {
                code,
                enhanced,
                text,
            } => Reply::ReplyCode {
                code,
                enhanced,
                text,
            },
            other => {
                debug_assert!(false, "not a terminal status: {:?}", other);
                Reply::TempFail
            }
        };
        self.send(reply).await
    }

    fn expect_state(&self, tag: u8, allowed: &[State]) -> Result<(), ProtocolError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedCommand {
                command: char::from(tag),
                state: self.state.name(),
            })
        }
    }

    /// Commands legal in any state after negotiation.
    fn expect_live(&self, tag: u8) -> Result<(), ProtocolError> {
        match self.state {
            State::Start | State::Quitting | State::Closed => Err(ProtocolError::UnexpectedCommand {
                command: char::from(tag),
                state: self.state.name(),
            }),
            _ => Ok(()),
        }
    }

    fn take_handler(&mut self) -> Box<dyn Handler> {
        self.handler
            .take()
            .unwrap_or_else(|| Box::new(DefaultHandler))
    }

    async fn send(&mut self, reply: Reply) -> Result<(), ProtocolError> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => {
                trace!("writer detached, dropping reply {:?}", char::from(reply.tag()));
                return Ok(());
            }
        };

        let packet = reply.to_packet();
        let write = async {
            writer.write_all(&packet).await?;
            writer.flush().await
        };
        match timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ProtocolError::Io(error)),
            Err(_) => Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "reply write deadline exceeded",
            ))),
        }
    }

    async fn send_action(&mut self, reply: Reply) -> Result<(), ActionError> {
        match self.send(reply).await {
            Ok(()) => Ok(()),
            Err(ProtocolError::Io(source)) => Err(ActionError::Write { source }),
            Err(other) => Err(ActionError::Write {
                source: io::Error::new(io::ErrorKind::Other, other.to_string()),
            }),
        }
    }

    fn eom_action(&self, required: ActionFlags) -> Result<(), ActionError> {
        if self.state != State::EndOfMessage {
            return Err(ActionError::OutsideEndOfMessage);
        }
        if !self.option.actions.contains(required) {
            return Err(ActionError::NotNegotiated { required });
        }
        Ok(())
    }

    /// Emit a progress keep-alive so the MTA extends its reply timeout.
    /// Legal at any stage.
    pub async fn progress(&mut self) -> Result<(), ActionError> {
        self.send_action(Reply::Progress).await
    }

    /// Append a header to the message.
    pub async fn add_header(&mut self, name: &str, value: &str) -> Result<(), ActionError> {
        self.eom_action(ActionFlags::ADD_HEADERS)?;
        self.send_action(Reply::AddHeader {
            name: name.into(),
            value: value.into(),
        })
        .await
    }

    /// Insert a header at `index` (0 prepends).
    pub async fn insert_header(
        &mut self,
        index: u32,
        name: &str,
        value: &str,
    ) -> Result<(), ActionError> {
        self.eom_action(ActionFlags::CHANGE_HEADERS)?;
        self.send_action(Reply::InsertHeader {
            index,
            name: name.into(),
            value: value.into(),
        })
        .await
    }

    /// Replace the `index`th occurrence (1-based) of header `name`.
    pub async fn change_header(
        &mut self,
        name: &str,
        index: u32,
        value: &str,
    ) -> Result<(), ActionError> {
        self.eom_action(ActionFlags::CHANGE_HEADERS)?;
        self.send_action(Reply::ChangeHeader {
            name: name.into(),
            index,
            value: value.into(),
        })
        .await
    }

    /// Delete the `index`th occurrence (1-based) of header `name`,
    /// expressed on the wire as a change to the empty value.
    pub async fn delete_header(&mut self, name: &str, index: u32) -> Result<(), ActionError> {
        self.change_header(name, index, "").await
    }

    /// Replace a chunk of the message body. May be called repeatedly;
    /// each call emits one replacement packet.
    pub async fn replace_body(&mut self, chunk: &[u8]) -> Result<(), ActionError> {
        self.eom_action(ActionFlags::CHANGE_BODY)?;
        self.send_action(Reply::ReplaceBody(chunk.to_vec())).await
    }

    /// Add an envelope recipient, optionally with ESMTP arguments.
    pub async fn add_recipient(
        &mut self,
        recipient: &str,
        args: Option<&str>,
    ) -> Result<(), ActionError> {
        let required = if args.is_some() {
            ActionFlags::ADD_RECIPIENT_WITH_ARGS
        } else {
            ActionFlags::ADD_RECIPIENT
        };
        self.eom_action(required)?;
        self.send_action(Reply::AddRecipient {
            recipient: recipient.into(),
            args: args.map(Into::into),
        })
        .await
    }

    /// Remove an envelope recipient.
    pub async fn remove_recipient(&mut self, recipient: &str) -> Result<(), ActionError> {
        self.eom_action(ActionFlags::REMOVE_RECIPIENT)?;
        self.send_action(Reply::RemoveRecipient {
            recipient: recipient.into(),
        })
        .await
    }

    /// Quarantine the message with the given reason.
    pub async fn quarantine(&mut self, reason: &str) -> Result<(), ActionError> {
        self.eom_action(ActionFlags::QUARANTINE)?;
        self.send_action(Reply::Quarantine {
            reason: reason.into(),
        })
        .await
    }

    /// Enter cooperative shutdown: answer tempfail if a message is in
    /// flight. Any further command is refused with tempfail.
    pub(crate) async fn begin_shutdown(&mut self) {
        if self.state.in_message() {
            let _ = self.send(Reply::TempFail).await;
        }
        self.state = State::Quitting;
    }

    /// Close without a reply, for timeouts and dead peers.
    pub(crate) fn close(&mut self) {
        self.state = State::Closed;
    }

    /// Last-resort close after a handler panic: tempfail, then closed.
    pub(crate) async fn fail_close(&mut self) {
        let _ = self.send(Reply::TempFail).await;
        self.state = State::Closed;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
