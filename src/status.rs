/// The verdict a handler returns for a protocol stage.
///
/// Each variant maps to one reply packet, except `NoReply` which advances
/// the state machine without writing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Keep processing the message.
    Continue,
    /// Accept the message without further filtering.
    Accept,
    /// Reject the message without further filtering.
    Reject,
    /// Temporarily fail without further filtering.
    TempFail,
    /// Silently discard the message without further filtering.
    Discard,
    /// Ask the MTA to stop sending more of the current stage.
    ///
    /// Only honored when the negotiated step mask allowed skipping;
    /// otherwise it degrades to a tempfail.
    Skip,
    /// Reply with an explicit SMTP code, optional enhanced status code
    /// and text.
    ReplyCode {
        code: u16,
        enhanced: Option<String>,
        text: String,
    },
    /// Write no reply packet but advance the state machine. Meant for
    /// stages the filter promised not to answer during negotiation.
    NoReply,
    /// Emit a progress keep-alive. The MTA keeps waiting for the final
    /// verdict of this stage.
    Progress,
}

impl Status {
    /// Whether this status ends filtering of the current message.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Accept
                | Status::Reject
                | Status::TempFail
                | Status::Discard
                | Status::ReplyCode { .. }
        )
    }

    /// Reply with an SMTP code and text, without an enhanced status code.
    pub fn reply_code(code: u16, text: impl Into<String>) -> Self {
        Status::ReplyCode {
            code,
            enhanced: None,
            text: text.into(),
        }
    }
}
