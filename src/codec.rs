//! Wire framing for the milter protocol.
//!
//! Every packet is a 32-bit big-endian length, one tag byte and a
//! tag-specific payload. Commands travel MTA to filter, replies filter to
//! MTA; both directions can be encoded and decoded so the filter side and
//! tests share one codec.

use bytes::{Buf, BytesMut};

use crate::error::{Direction, ProtocolError};
use crate::macros::{MacroRequests, MacroStage};
use crate::option_set::{ActionFlags, OptionSet, StepFlags};

/// Default cap for a single frame's announced size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 24;

/// Address family of the connecting SMTP client, as carried in the
/// connect command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    Unknown,
    Unix,
    Inet,
    Inet6,
}

impl SocketFamily {
    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            b'U' => Some(SocketFamily::Unknown),
            b'L' => Some(SocketFamily::Unix),
            b'4' => Some(SocketFamily::Inet),
            b'6' => Some(SocketFamily::Inet6),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            SocketFamily::Unknown => b'U',
            SocketFamily::Unix => b'L',
            SocketFamily::Inet => b'4',
            SocketFamily::Inet6 => b'6',
        }
    }
}

/// Peer endpoint information delivered with the connect stage.
///
/// For [`SocketFamily::Unix`] the address is the socket path and the port
/// is zero; for [`SocketFamily::Unknown`] both are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    pub family: SocketFamily,
    pub port: u16,
    pub address: String,
}

/// A decoded command packet (MTA to filter).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    Negotiate(OptionSet),
    DefineMacro {
        stage: MacroStage,
        pairs: Vec<(String, String)>,
    },
    Connect {
        hostname: String,
        socket: SocketInfo,
    },
    Helo {
        fqdn: String,
    },
    Mail {
        sender: String,
        args: Vec<String>,
    },
    Rcpt {
        recipient: String,
        args: Vec<String>,
    },
    Data,
    Header {
        name: String,
        value: String,
    },
    EndOfHeader,
    Body(Vec<u8>),
    EndOfMessage(Vec<u8>),
    Unknown(String),
    Abort,
    Quit,
    QuitNewConnection,
}

/// An encoded reply packet (filter to MTA).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reply {
    Negotiate {
        option: OptionSet,
        macro_requests: MacroRequests,
    },
    Continue,
    Accept,
    Reject,
    TempFail,
    Discard,
    Progress,
    Skip,
    ReplyCode {
        code: u16,
        enhanced: Option<String>,
        text: String,
    },
    Quarantine {
        reason: String,
    },
    AddHeader {
        name: String,
        value: String,
    },
    InsertHeader {
        index: u32,
        name: String,
        value: String,
    },
    ChangeHeader {
        name: String,
        index: u32,
        value: String,
    },
    AddRecipient {
        recipient: String,
        args: Option<String>,
    },
    RemoveRecipient {
        recipient: String,
    },
    ReplaceBody(Vec<u8>),
    EndOfMessage,
}

lazy_static! {
    static ref ENHANCED_CODE: regex::Regex =
        regex::Regex::new(r"^[245]\.\d{1,3}\.\d{1,3}$").unwrap();
}

/// Incremental frame decoder for the command direction.
///
/// [`feed`](Decoder::feed) accepts arbitrary byte fragments;
/// [`next_command`](Decoder::next_command) yields a packet once a full
/// frame is buffered and `None` while bytes are still missing.
#[derive(Debug)]
pub(crate) struct Decoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_command(&mut self) -> Result<Option<Command>, ProtocolError> {
        let (tag, payload) = match self.next_frame()? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        Command::parse(tag, payload).map(Some)
    }

    fn next_frame(&mut self) -> Result<Option<(u8, BytesMut)>, ProtocolError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&self.buffer[..4]);
        let size = u32::from_be_bytes(size_bytes) as usize;

        if size > self.max_frame_size {
            return Err(ProtocolError::OversizeFrame {
                size,
                limit: self.max_frame_size,
            });
        }
        if size == 0 {
            return Err(ProtocolError::MalformedPayload {
                tag: '\u{0}',
                reason: "zero-length frame carries no tag".into(),
            });
        }
        if self.buffer.len() < 4 + size {
            return Ok(None);
        }

        self.buffer.advance(4);
        let mut frame = self.buffer.split_to(size);
        let tag = frame.get_u8();
        Ok(Some((tag, frame)))
    }
}

/// Split one NUL-terminated string off the front of `payload`.
fn take_string(tag: u8, payload: &mut BytesMut) -> Result<String, ProtocolError> {
    let end = payload
        .iter()
        .position(|byte| *byte == 0)
        .ok_or_else(|| ProtocolError::malformed(tag, "missing NUL terminator"))?;
    let bytes = payload.split_to(end);
    payload.advance(1);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Consume the remaining payload as a run of NUL-terminated strings.
fn take_strings(tag: u8, payload: &mut BytesMut) -> Result<Vec<String>, ProtocolError> {
    let mut strings = Vec::new();
    while !payload.is_empty() {
        strings.push(take_string(tag, payload)?);
    }
    Ok(strings)
}

fn expect_empty(tag: u8, payload: &BytesMut) -> Result<(), ProtocolError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::malformed(
            tag,
            format!("{} trailing bytes after payload", payload.len()),
        ))
    }
}

fn put_string(buffer: &mut Vec<u8>, value: &str) {
    buffer.extend_from_slice(value.as_bytes());
    buffer.push(0);
}

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(5 + payload.len());
    packet.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
    packet.push(tag);
    packet.extend_from_slice(payload);
    packet
}

fn parse_option_set(tag: u8, payload: &mut BytesMut) -> Result<OptionSet, ProtocolError> {
    if payload.len() < 12 {
        return Err(ProtocolError::short_payload(tag, 12, payload));
    }
    let version = payload.get_u32();
    let actions = ActionFlags::from_bits_truncate(payload.get_u32());
    let steps = StepFlags::from_bits_truncate(payload.get_u32());
    Ok(OptionSet {
        version,
        actions,
        steps,
    })
}

fn put_option_set(buffer: &mut Vec<u8>, option: &OptionSet) {
    buffer.extend_from_slice(&option.version.to_be_bytes());
    buffer.extend_from_slice(&option.actions.bits().to_be_bytes());
    buffer.extend_from_slice(&option.steps.bits().to_be_bytes());
}

impl Command {
    pub(crate) fn parse(tag: u8, mut payload: BytesMut) -> Result<Self, ProtocolError> {
        match tag {
            b'O' => {
                let option = parse_option_set(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Command::Negotiate(option))
            }
            b'D' => {
                if payload.is_empty() {
                    return Err(ProtocolError::malformed(tag, "missing macro stage code"));
                }
                let code = payload.get_u8();
                let stage = MacroStage::from_command_code(code).ok_or_else(|| {
                    ProtocolError::malformed(tag, format!("unknown macro stage {:?}", char::from(code)))
                })?;
                let strings = take_strings(tag, &mut payload)?;
                if strings.len() % 2 != 0 {
                    return Err(ProtocolError::malformed(tag, "macro name without a value"));
                }
                let pairs = strings
                    .chunks(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                Ok(Command::DefineMacro { stage, pairs })
            }
            b'C' => {
                let hostname = take_string(tag, &mut payload)?;
                if payload.is_empty() {
                    return Err(ProtocolError::malformed(tag, "missing address family"));
                }
                let family = SocketFamily::from_wire(payload.get_u8()).ok_or_else(|| {
                    ProtocolError::malformed(tag, "unknown address family")
                })?;
                let socket = if family == SocketFamily::Unknown {
                    expect_empty(tag, &payload)?;
                    SocketInfo {
                        family,
                        port: 0,
                        address: String::new(),
                    }
                } else {
                    if payload.len() < 2 {
                        return Err(ProtocolError::short_payload(tag, 2, &payload));
                    }
                    let port = payload.get_u16();
                    let address = take_string(tag, &mut payload)?;
                    expect_empty(tag, &payload)?;
                    SocketInfo {
                        family,
                        port,
                        address,
                    }
                };
                Ok(Command::Connect { hostname, socket })
            }
            b'H' => {
                let fqdn = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Command::Helo { fqdn })
            }
            b'M' => {
                let sender = take_string(tag, &mut payload)?;
                let args = take_strings(tag, &mut payload)?;
                Ok(Command::Mail { sender, args })
            }
            b'R' => {
                let recipient = take_string(tag, &mut payload)?;
                let args = take_strings(tag, &mut payload)?;
                Ok(Command::Rcpt { recipient, args })
            }
            b'T' => {
                expect_empty(tag, &payload)?;
                Ok(Command::Data)
            }
            b'L' => {
                let name = take_string(tag, &mut payload)?;
                let value = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Command::Header { name, value })
            }
            b'N' => {
                expect_empty(tag, &payload)?;
                Ok(Command::EndOfHeader)
            }
            b'B' => Ok(Command::Body(payload.to_vec())),
            b'E' => Ok(Command::EndOfMessage(payload.to_vec())),
            b'U' => {
                let verb = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Command::Unknown(verb))
            }
            b'A' => {
                expect_empty(tag, &payload)?;
                Ok(Command::Abort)
            }
            b'Q' => {
                expect_empty(tag, &payload)?;
                Ok(Command::Quit)
            }
            b'K' => {
                expect_empty(tag, &payload)?;
                Ok(Command::QuitNewConnection)
            }
            _ => Err(ProtocolError::UnknownTag {
                tag: char::from(tag),
                direction: Direction::Command,
            }),
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            Command::Negotiate(_) => b'O',
            Command::DefineMacro { .. } => b'D',
            Command::Connect { .. } => b'C',
            Command::Helo { .. } => b'H',
            Command::Mail { .. } => b'M',
            Command::Rcpt { .. } => b'R',
            Command::Data => b'T',
            Command::Header { .. } => b'L',
            Command::EndOfHeader => b'N',
            Command::Body(_) => b'B',
            Command::EndOfMessage(_) => b'E',
            Command::Unknown(_) => b'U',
            Command::Abort => b'A',
            Command::Quit => b'Q',
            Command::QuitNewConnection => b'K',
        }
    }

    /// Encode this command as a full framed packet. This is the MTA-side
    /// encoding, used by the in-crate tests to feed contexts.
    pub(crate) fn to_packet(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Command::Negotiate(option) => put_option_set(&mut payload, option),
            Command::DefineMacro { stage, pairs } => {
                payload.push(stage.command_code());
                for (name, value) in pairs {
                    put_string(&mut payload, name);
                    put_string(&mut payload, value);
                }
            }
            Command::Connect { hostname, socket } => {
                put_string(&mut payload, hostname);
                payload.push(socket.family.to_wire());
                if socket.family != SocketFamily::Unknown {
                    payload.extend_from_slice(&socket.port.to_be_bytes());
                    put_string(&mut payload, &socket.address);
                }
            }
            Command::Helo { fqdn } => put_string(&mut payload, fqdn),
            Command::Mail { sender, args } => {
                put_string(&mut payload, sender);
                for arg in args {
                    put_string(&mut payload, arg);
                }
            }
            Command::Rcpt { recipient, args } => {
                put_string(&mut payload, recipient);
                for arg in args {
                    put_string(&mut payload, arg);
                }
            }
            Command::Data | Command::EndOfHeader | Command::Abort | Command::Quit
            | Command::QuitNewConnection => {}
            Command::Header { name, value } => {
                put_string(&mut payload, name);
                put_string(&mut payload, value);
            }
            Command::Body(chunk) | Command::EndOfMessage(chunk) => {
                payload.extend_from_slice(chunk);
            }
            Command::Unknown(verb) => put_string(&mut payload, verb),
        }
        frame(self.tag(), &payload)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Negotiate(_) => "negotiate",
            Command::DefineMacro { .. } => "define-macro",
            Command::Connect { .. } => "connect",
            Command::Helo { .. } => "helo",
            Command::Mail { .. } => "mail-from",
            Command::Rcpt { .. } => "rcpt-to",
            Command::Data => "data",
            Command::Header { .. } => "header",
            Command::EndOfHeader => "end-of-header",
            Command::Body(_) => "body",
            Command::EndOfMessage(_) => "end-of-message",
            Command::Unknown(_) => "unknown",
            Command::Abort => "abort",
            Command::Quit => "quit",
            Command::QuitNewConnection => "quit-nc",
        };
        write!(f, "{}", name)
    }
}

impl Reply {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Reply::Negotiate { .. } => b'O',
            Reply::Continue => b'c',
            Reply::Accept => b'a',
            Reply::Reject => b'r',
            Reply::TempFail => b't',
            Reply::Discard => b'd',
            Reply::Progress => b'p',
            Reply::Skip => b's',
            Reply::ReplyCode { .. } => b'y',
            Reply::Quarantine { .. } => b'q',
            Reply::AddHeader { .. } => b'h',
            Reply::InsertHeader { .. } => b'i',
            Reply::ChangeHeader { .. } => b'm',
            Reply::AddRecipient { args: None, .. } => b'+',
            Reply::AddRecipient { args: Some(_), .. } => b'2',
            Reply::RemoveRecipient { .. } => b'-',
            Reply::ReplaceBody(_) => b'b',
            Reply::EndOfMessage => b'e',
        }
    }

    /// Encode this reply as a full framed packet. Identical input yields
    /// identical bytes.
    pub(crate) fn to_packet(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Reply::Negotiate {
                option,
                macro_requests,
            } => {
                put_option_set(&mut payload, option);
                for (stage, symbols) in macro_requests.iter_wire_order() {
                    payload.extend_from_slice(&(stage as u32).to_be_bytes());
                    put_string(&mut payload, &symbols.join(" "));
                }
            }
            Reply::Continue
            | Reply::Accept
            | Reply::Reject
            | Reply::TempFail
            | Reply::Discard
            | Reply::Progress
            | Reply::Skip
            | Reply::EndOfMessage => {}
            Reply::ReplyCode {
                code,
                enhanced,
                text,
            } => {
                let mut line = format!("{:03} ", code);
                if let Some(enhanced) = enhanced {
                    line.push_str(enhanced);
                    line.push(' ');
                }
                line.push_str(text);
                put_string(&mut payload, &line);
            }
            Reply::Quarantine { reason } => put_string(&mut payload, reason),
            Reply::AddHeader { name, value } => {
                put_string(&mut payload, name);
                put_string(&mut payload, value);
            }
            Reply::InsertHeader { index, name, value } => {
                payload.extend_from_slice(&index.to_be_bytes());
                put_string(&mut payload, name);
                put_string(&mut payload, value);
            }
            Reply::ChangeHeader { name, index, value } => {
                payload.extend_from_slice(&index.to_be_bytes());
                put_string(&mut payload, name);
                put_string(&mut payload, value);
            }
            Reply::AddRecipient { recipient, args } => {
                put_string(&mut payload, recipient);
                if let Some(args) = args {
                    put_string(&mut payload, args);
                }
            }
            Reply::RemoveRecipient { recipient } => put_string(&mut payload, recipient),
            Reply::ReplaceBody(chunk) => payload.extend_from_slice(chunk),
        }
        frame(self.tag(), &payload)
    }

    /// Decode a reply payload. The filter never receives replies; this is
    /// the mirror half that keeps the codec round-trippable and serves
    /// manager-side consumers and the tests.
    pub(crate) fn parse(tag: u8, mut payload: BytesMut) -> Result<Self, ProtocolError> {
        match tag {
            b'O' => {
                let option = parse_option_set(tag, &mut payload)?;
                let mut macro_requests = MacroRequests::new();
                while !payload.is_empty() {
                    if payload.len() < 4 {
                        return Err(ProtocolError::short_payload(tag, 4, &payload));
                    }
                    let index = payload.get_u32();
                    let stage = MacroStage::from_wire_index(index).ok_or_else(|| {
                        ProtocolError::malformed(tag, format!("unknown macro stage index {}", index))
                    })?;
                    let joined = take_string(tag, &mut payload)?;
                    macro_requests.set_symbols(stage, joined.split(' ').filter(|s| !s.is_empty()));
                }
                Ok(Reply::Negotiate {
                    option,
                    macro_requests,
                })
            }
            b'c' => empty_reply(tag, &payload, Reply::Continue),
            b'a' => empty_reply(tag, &payload, Reply::Accept),
            b'r' => empty_reply(tag, &payload, Reply::Reject),
            b't' => empty_reply(tag, &payload, Reply::TempFail),
            b'd' => empty_reply(tag, &payload, Reply::Discard),
            b'p' => empty_reply(tag, &payload, Reply::Progress),
            b's' => empty_reply(tag, &payload, Reply::Skip),
            b'e' => empty_reply(tag, &payload, Reply::EndOfMessage),
            b'y' => {
                let line = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                if line.len() < 3 || !line[..3].bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ProtocolError::malformed(tag, "reply code is not three digits"));
                }
                let code: u16 = line[..3]
                    .parse()
                    .map_err(|_| ProtocolError::malformed(tag, "unparsable reply code"))?;
                let rest = line[3..].strip_prefix(' ').unwrap_or("");
                let (enhanced, text) = match rest.split_once(' ') {
                    Some((first, remainder)) if ENHANCED_CODE.is_match(first) => {
                        (Some(first.to_string()), remainder.to_string())
                    }
                    _ => (None, rest.to_string()),
                };
                Ok(Reply::ReplyCode {
                    code,
                    enhanced,
                    text,
                })
            }
            b'q' => {
                let reason = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Reply::Quarantine { reason })
            }
            b'h' => {
                let name = take_string(tag, &mut payload)?;
                let value = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Reply::AddHeader { name, value })
            }
            b'i' => {
                if payload.len() < 4 {
                    return Err(ProtocolError::short_payload(tag, 4, &payload));
                }
                let index = payload.get_u32();
                let name = take_string(tag, &mut payload)?;
                let value = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Reply::InsertHeader { index, name, value })
            }
            b'm' => {
                if payload.len() < 4 {
                    return Err(ProtocolError::short_payload(tag, 4, &payload));
                }
                let index = payload.get_u32();
                let name = take_string(tag, &mut payload)?;
                let value = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Reply::ChangeHeader { name, index, value })
            }
            b'+' => {
                let recipient = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Reply::AddRecipient {
                    recipient,
                    args: None,
                })
            }
            b'2' => {
                let recipient = take_string(tag, &mut payload)?;
                let args = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Reply::AddRecipient {
                    recipient,
                    args: Some(args),
                })
            }
            b'-' => {
                let recipient = take_string(tag, &mut payload)?;
                expect_empty(tag, &payload)?;
                Ok(Reply::RemoveRecipient { recipient })
            }
            b'b' => Ok(Reply::ReplaceBody(payload.to_vec())),
            _ => Err(ProtocolError::UnknownTag {
                tag: char::from(tag),
                direction: Direction::Reply,
            }),
        }
    }
}

fn empty_reply(tag: u8, payload: &BytesMut, reply: Reply) -> Result<Reply, ProtocolError> {
    expect_empty(tag, payload)?;
    Ok(reply)
}

impl MacroStage {
    fn from_wire_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(MacroStage::Connect),
            1 => Some(MacroStage::Helo),
            2 => Some(MacroStage::Mail),
            3 => Some(MacroStage::Rcpt),
            4 => Some(MacroStage::Data),
            5 => Some(MacroStage::EndOfMessage),
            6 => Some(MacroStage::EndOfHeader),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn decode_one(packet: &[u8]) -> Command {
        let mut decoder = Decoder::default();
        decoder.feed(packet);
        decoder
            .next_command()
            .expect("decode failed")
            .expect("frame incomplete")
    }

    fn command_round_trip(command: Command) {
        assert_eq!(decode_one(&command.to_packet()), command);
    }

    fn reply_round_trip(reply: Reply) {
        let packet = reply.to_packet();
        assert_eq!(
            Reply::parse(packet[4], BytesMut::from(&packet[5..])).expect("reply decode failed"),
            reply
        );
    }

    #[test]
    fn decodes_fragmented_input() {
        let packet = Command::Helo {
            fqdn: "mail.example.org".into(),
        }
        .to_packet();

        let mut decoder = Decoder::default();
        for byte in &packet[..packet.len() - 1] {
            decoder.feed(&[*byte]);
            assert!(decoder.next_command().unwrap().is_none());
        }
        decoder.feed(&packet[packet.len() - 1..]);

        assert_eq!(
            decoder.next_command().unwrap(),
            Some(Command::Helo {
                fqdn: "mail.example.org".into()
            })
        );
    }

    #[test]
    fn decodes_back_to_back_frames_from_one_feed() {
        let mut bytes = Command::EndOfHeader.to_packet();
        bytes.extend_from_slice(&Command::Body(b"hello\r\n".to_vec()).to_packet());

        let mut decoder = Decoder::default();
        decoder.feed(&bytes);

        assert_eq!(decoder.next_command().unwrap(), Some(Command::EndOfHeader));
        assert_eq!(
            decoder.next_command().unwrap(),
            Some(Command::Body(b"hello\r\n".to_vec()))
        );
        assert_eq!(decoder.next_command().unwrap(), None);
    }

    #[test]
    fn rejects_oversize_frames() {
        let mut decoder = Decoder::new(16);
        decoder.feed(&[0, 0, 0, 17, b'B']);

        assert_matches!(
            decoder.next_command(),
            Err(ProtocolError::OversizeFrame { size: 17, limit: 16 })
        );
    }

    #[test]
    fn rejects_unknown_command_tags() {
        let mut decoder = Decoder::default();
        decoder.feed(&[0, 0, 0, 1, b'Z']);

        assert_matches!(
            decoder.next_command(),
            Err(ProtocolError::UnknownTag { tag: 'Z', .. })
        );
    }

    #[test]
    fn rejects_header_without_nul() {
        let mut decoder = Decoder::default();
        decoder.feed(&[0, 0, 0, 5, b'L', b'F', b'r', b'o', b'm']);

        assert_matches!(
            decoder.next_command(),
            Err(ProtocolError::MalformedPayload { tag: 'L', .. })
        );
    }

    #[test]
    fn parses_negotiate_fields() {
        let data = [0, 0, 0, 13, b'O', 0, 0, 0, 6, 0, 0, 0, 0x1f, 0, 0, 0, 0];

        match decode_one(&data) {
            Command::Negotiate(option) => {
                assert_eq!(option.version, 6);
                assert!(option.actions.contains(ActionFlags::CHANGE_HEADERS));
                assert_eq!(option.steps, StepFlags::empty());
            }
            other => panic!("expected a negotiate command, got {:?}", other),
        }
    }

    #[test]
    fn parses_connect_with_inet_family() {
        let packet = Command::Connect {
            hostname: "mta.example.org".into(),
            socket: SocketInfo {
                family: SocketFamily::Inet,
                port: 2525,
                address: "192.0.2.7".into(),
            },
        }
        .to_packet();

        match decode_one(&packet) {
            Command::Connect { hostname, socket } => {
                assert_eq!(hostname, "mta.example.org");
                assert_eq!(socket.family, SocketFamily::Inet);
                assert_eq!(socket.port, 2525);
                assert_eq!(socket.address, "192.0.2.7");
            }
            other => panic!("expected a connect command, got {:?}", other),
        }
    }

    #[test]
    fn connect_with_unknown_family_carries_no_endpoint() {
        command_round_trip(Command::Connect {
            hostname: "unknown".into(),
            socket: SocketInfo {
                family: SocketFamily::Unknown,
                port: 0,
                address: String::new(),
            },
        });
    }

    #[test]
    fn command_shapes_round_trip() {
        command_round_trip(Command::Negotiate(OptionSet::supported()));
        command_round_trip(Command::DefineMacro {
            stage: MacroStage::Connect,
            pairs: vec![("j".into(), "mail.example.org".into()), ("_".into(), "local".into())],
        });
        command_round_trip(Command::Helo {
            fqdn: "client.example.net".into(),
        });
        command_round_trip(Command::Mail {
            sender: "<alice@example.org>".into(),
            args: vec!["SIZE=1024".into(), "BODY=8BITMIME".into()],
        });
        command_round_trip(Command::Rcpt {
            recipient: "<bob@example.net>".into(),
            args: vec![],
        });
        command_round_trip(Command::Data);
        command_round_trip(Command::Header {
            name: "Subject".into(),
            value: "a plain subject".into(),
        });
        command_round_trip(Command::EndOfHeader);
        command_round_trip(Command::Body(vec![0, 159, 146, 150, b'\r', b'\n']));
        command_round_trip(Command::EndOfMessage(Vec::new()));
        command_round_trip(Command::Unknown("XCLIENT".into()));
        command_round_trip(Command::Abort);
        command_round_trip(Command::Quit);
        command_round_trip(Command::QuitNewConnection);
    }

    #[test]
    fn reply_shapes_round_trip() {
        let mut macro_requests = MacroRequests::new();
        macro_requests.set_symbols(MacroStage::Helo, vec!["G", "N", "U"]);
        reply_round_trip(Reply::Negotiate {
            option: OptionSet::supported(),
            macro_requests,
        });
        reply_round_trip(Reply::Continue);
        reply_round_trip(Reply::Accept);
        reply_round_trip(Reply::Reject);
        reply_round_trip(Reply::TempFail);
        reply_round_trip(Reply::Discard);
        reply_round_trip(Reply::Progress);
        reply_round_trip(Reply::Skip);
        reply_round_trip(Reply::EndOfMessage);
        reply_round_trip(Reply::ReplyCode {
            code: 550,
            enhanced: Some("5.7.1".into()),
            text: "no".into(),
        });
        reply_round_trip(Reply::ReplyCode {
            code: 451,
            enhanced: None,
            text: "try again later".into(),
        });
        reply_round_trip(Reply::Quarantine {
            reason: "virus mail!".into(),
        });
        reply_round_trip(Reply::AddHeader {
            name: "X-Scanned".into(),
            value: "yes".into(),
        });
        reply_round_trip(Reply::InsertHeader {
            index: 0,
            name: "X-First".into(),
            value: "1".into(),
        });
        reply_round_trip(Reply::ChangeHeader {
            name: "X-Spam".into(),
            index: 1,
            value: String::new(),
        });
        reply_round_trip(Reply::AddRecipient {
            recipient: "<carol@example.org>".into(),
            args: None,
        });
        reply_round_trip(Reply::AddRecipient {
            recipient: "<carol@example.org>".into(),
            args: Some("NOTIFY=SUCCESS".into()),
        });
        reply_round_trip(Reply::RemoveRecipient {
            recipient: "<bob@example.net>".into(),
        });
        reply_round_trip(Reply::ReplaceBody(b"replacement body\r\n".to_vec()));
    }

    #[test]
    fn negotiate_reply_bytes_are_exact() {
        let mut macro_requests = MacroRequests::new();
        macro_requests.set_symbols(MacroStage::Helo, vec!["G", "N", "U"]);

        let packet = Reply::Negotiate {
            option: OptionSet {
                version: 6,
                actions: ActionFlags::ADD_HEADERS,
                steps: StepFlags::empty(),
            },
            macro_requests,
        }
        .to_packet();

        let mut expected = vec![0, 0, 0, 23, b'O'];
        expected.extend_from_slice(&[0, 0, 0, 6]);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&[0, 0, 0, 0]);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(b"G N U\0");
        assert_eq!(packet, expected);
    }

    #[test]
    fn progress_reply_bytes_are_exact() {
        assert_eq!(Reply::Progress.to_packet(), vec![0, 0, 0, 1, b'p']);
    }
}
