use std::collections::HashMap;

use async_trait::async_trait;

use crate::codec::SocketInfo;
use crate::context::Context;
use crate::macros::{MacroRequests, MacroStage};
use crate::option_set::OptionSet;
use crate::status::Status;

/// Implement this trait to define the behavior of your milter.
///
/// One handler is installed per connection. Every method has a default
/// implementation returning [`Status::Continue`]; override the stages you
/// care about. The context passed to each stage gives access to received
/// macros, keep-alive emission and, at end-of-message, the modification
/// actions.
///
/// # Example:
/// ```
/// use async_trait::async_trait;
/// use rumilter::context::Context;
/// use rumilter::handler::Handler;
/// use rumilter::status::Status;
///
/// struct RejectBigBodies {
///     seen: usize,
/// }
///
/// #[async_trait]
/// impl Handler for RejectBigBodies {
///     async fn on_body(&mut self, _context: &mut Context, chunk: &[u8]) -> Status {
///         self.seen += chunk.len();
///         if self.seen > 1024 * 1024 {
///             Status::Reject
///         } else {
///             Status::Continue
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send {
    /// Option negotiation (SMFIC_OPTNEG).
    ///
    /// `option` holds the intersection of the MTA's offer and what this
    /// crate supports; `macro_requests` is empty. Both may be adjusted in
    /// place before the reply is written. Bits the MTA did not offer are
    /// cleared again after this returns.
    #[allow(unused_variables)]
    async fn on_negotiate(
        &mut self,
        context: &mut Context,
        option: &mut OptionSet,
        macro_requests: &mut MacroRequests,
    ) -> Status {
        Status::Continue
    }

    /// Connection information about the SMTP client (SMFIC_CONNECT).
    #[allow(unused_variables)]
    async fn on_connect(
        &mut self,
        context: &mut Context,
        hostname: &str,
        socket: &SocketInfo,
    ) -> Status {
        Status::Continue
    }

    /// The HELO/EHLO name sent by the SMTP client (SMFIC_HELO).
    #[allow(unused_variables)]
    async fn on_helo(&mut self, context: &mut Context, fqdn: &str) -> Status {
        Status::Continue
    }

    /// The envelope sender with its ESMTP arguments (SMFIC_MAIL).
    #[allow(unused_variables)]
    async fn on_envelope_from(
        &mut self,
        context: &mut Context,
        sender: &str,
        args: &[String],
    ) -> Status {
        Status::Continue
    }

    /// One envelope recipient (SMFIC_RCPT). Called once per recipient.
    #[allow(unused_variables)]
    async fn on_envelope_recipient(
        &mut self,
        context: &mut Context,
        recipient: &str,
        args: &[String],
    ) -> Status {
        Status::Continue
    }

    /// The DATA command was issued (SMFIC_DATA).
    #[allow(unused_variables)]
    async fn on_data(&mut self, context: &mut Context) -> Status {
        Status::Continue
    }

    /// A single message header (SMFIC_HEADER).
    ///
    /// Header names are not unique and arrive in message order. The value
    /// is passed as carried on the wire, no content decoding is applied.
    ///
    /// # Example:
    /// ```
    /// use async_trait::async_trait;
    /// use rumilter::context::Context;
    /// use rumilter::handler::Handler;
    /// use rumilter::status::Status;
    ///
    /// struct SubjectLogger;
    ///
    /// #[async_trait]
    /// impl Handler for SubjectLogger {
    ///     async fn on_header(&mut self, _context: &mut Context, name: &str, value: &str) -> Status {
    ///         if name.eq_ignore_ascii_case("subject") {
    ///             println!("subject: {}", value);
    ///         }
    ///         Status::Continue
    ///     }
    /// }
    /// ```
    #[allow(unused_variables)]
    async fn on_header(&mut self, context: &mut Context, name: &str, value: &str) -> Status {
        Status::Continue
    }

    /// All headers have been sent (SMFIC_EOH).
    #[allow(unused_variables)]
    async fn on_end_of_header(&mut self, context: &mut Context) -> Status {
        Status::Continue
    }

    /// A chunk of the message body (SMFIC_BODY). May be called many times.
    #[allow(unused_variables)]
    async fn on_body(&mut self, context: &mut Context, chunk: &[u8]) -> Status {
        Status::Continue
    }

    /// The message is complete (SMFIC_BODYEOB).
    ///
    /// `final_chunk` carries trailing body bytes, possibly empty. This is
    /// the only stage at which the modification actions on the context
    /// ([`add_header`](Context::add_header),
    /// [`replace_body`](Context::replace_body),
    /// [`quarantine`](Context::quarantine), ...) may be called; they are
    /// written before the reply for the returned status.
    #[allow(unused_variables)]
    async fn on_end_of_message(&mut self, context: &mut Context, final_chunk: &[u8]) -> Status {
        Status::Continue
    }

    /// The MTA aborted the current message (SMFIC_ABORT). The connection
    /// stays open; a new envelope may follow.
    #[allow(unused_variables)]
    async fn on_abort(&mut self, context: &mut Context) {}

    /// An SMTP command the MTA did not recognize (SMFIC_UNKNOWN).
    #[allow(unused_variables)]
    async fn on_unknown(&mut self, context: &mut Context, verb: &str) -> Status {
        Status::Continue
    }

    /// A macro set for `stage` (SMFIC_MACRO).
    ///
    /// The macros replace whatever the stage held before and stay
    /// readable through [`Context::macro_value`] while the stage is
    /// processed.
    #[allow(unused_variables)]
    async fn on_define_macro(
        &mut self,
        context: &mut Context,
        stage: MacroStage,
        macros: &HashMap<String, String>,
    ) {
    }
}

/// The handler a context starts out with: every stage continues.
#[derive(Debug, Default)]
pub struct DefaultHandler;

#[async_trait]
impl Handler for DefaultHandler {}
