//! Line protocol spoken between clients and the session server.
//!
//! Every message starts with an upper-case command word. Free-form fields (cell
//! contents, values, error reasons) are length-prefixed as `<bytes>:<data>` so
//! they can hold spaces, newlines and `=` freely. On a byte stream each message
//! is followed by `\n`; the terminator is only looked for after the last field.
//!
//! ```text
//! client:  LOGIN <username> <spreadsheet>
//!          EDIT <cell> <len>:<contents>
//!          UNDO | CLEAR | LOGOUT
//! server:  CELLS [<cell>=<len>:<value> ...]
//!          ERROR <len>:<reason>
//!          RESET
//! ```

use std::fmt::Write as _;
use std::str;

use cellsync_core::{CellChange, CellCoord};
use thiserror::Error;

/// Longest command word, username, spreadsheet name or cell identifier
pub const MAX_TOKEN_BYTES: usize = 64;

/// Longest length-prefixed field
pub const MAX_FIELD_BYTES: usize = 64 * 1024;

/// Messages that can never be valid, reported to the peer before disconnecting
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("expected {expected} at byte {position}")]
    Unexpected { expected: &'static str, position: usize },

    #[error("invalid cell '{0}'")]
    InvalidCell(String),

    #[error("invalid field length")]
    InvalidLength,

    #[error("field of {0} bytes exceeds the limit")]
    FieldTooLarge(usize),

    #[error("token exceeds {MAX_TOKEN_BYTES} bytes")]
    TokenTooLong,

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("connection closed mid-message")]
    Truncated,

    #[error("first message must be LOGIN")]
    NotLoggedIn,

    #[error("already logged in")]
    AlreadyLoggedIn,
}

/// Client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Login { username: String, spreadsheet: String },
    Edit { cell: CellCoord, contents: String },
    Undo,
    Clear,
    Logout,
}

/// A cell and its display value, as sent to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    pub cell: CellCoord,
    pub value: String,
}

impl CellUpdate {
    pub fn new(cell: CellCoord, value: impl Into<String>) -> Self {
        Self {
            cell,
            value: value.into(),
        }
    }
}

impl From<CellChange> for CellUpdate {
    fn from(change: CellChange) -> Self {
        Self::new(change.coord, change.value.as_text())
    }
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Cells(Vec<CellUpdate>),
    Error(String),
    Reset,
}

impl ServerMessage {
    pub fn cells(changes: impl IntoIterator<Item = CellChange>) -> Self {
        ServerMessage::Cells(changes.into_iter().map(CellUpdate::from).collect())
    }

    pub fn error(reason: impl ToString) -> Self {
        ServerMessage::Error(reason.to_string())
    }
}

/// A message with a text wire form
pub trait WireMessage: Sized {
    /// Encode without the stream terminator
    fn encode(&self) -> String;

    /// Decode one `\n`-terminated message from the front of `buf`
    ///
    /// Returns the message and the number of bytes it used, or `None` when `buf`
    /// holds only part of a message.
    fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError>;

    /// Decode a frame that carries exactly one message, terminated or not
    fn decode_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        if let Some((message, used)) = Self::decode(frame)? {
            if used == frame.len() {
                return Ok(message);
            }
        }

        let mut terminated = Vec::with_capacity(frame.len() + 1);
        terminated.extend_from_slice(frame);
        terminated.push(b'\n');
        match Self::decode(&terminated)? {
            Some((message, used)) if used == terminated.len() => Ok(message),
            Some((_, used)) => Err(ProtocolError::Unexpected {
                expected: "end of frame",
                position: used,
            }),
            None => Err(ProtocolError::Truncated),
        }
    }
}

impl WireMessage for ClientMessage {
    fn encode(&self) -> String {
        match self {
            ClientMessage::Login { username, spreadsheet } => format!("LOGIN {} {}", username, spreadsheet),
            ClientMessage::Edit { cell, contents } => {
                let mut out = format!("EDIT {} ", cell);
                push_sized(&mut out, contents);
                out
            }
            ClientMessage::Undo => "UNDO".to_string(),
            ClientMessage::Clear => "CLEAR".to_string(),
            ClientMessage::Logout => "LOGOUT".to_string(),
        }
    }

    fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        complete(buf, |r| {
            let message = match r.token(b" \n")? {
                "LOGIN" => {
                    r.expect(b' ', "space")?;
                    let username = r.required_token(b" \n", "username")?.to_string();
                    r.expect(b' ', "space")?;
                    let spreadsheet = r.required_token(b" \n", "spreadsheet name")?.to_string();
                    ClientMessage::Login { username, spreadsheet }
                }
                "EDIT" => {
                    r.expect(b' ', "space")?;
                    let cell = r.cell(b" \n")?;
                    r.expect(b' ', "space")?;
                    let contents = r.sized()?;
                    ClientMessage::Edit { cell, contents }
                }
                "UNDO" => ClientMessage::Undo,
                "CLEAR" => ClientMessage::Clear,
                "LOGOUT" => ClientMessage::Logout,
                "" => return Err(ProtocolError::MissingField("command").into()),
                other => return Err(ProtocolError::UnknownCommand(other.to_string()).into()),
            };
            r.expect(b'\n', "end of message")?;
            Ok(message)
        })
    }
}

impl WireMessage for ServerMessage {
    fn encode(&self) -> String {
        match self {
            ServerMessage::Cells(updates) => {
                let mut out = String::from("CELLS");
                for update in updates {
                    let _ = write!(out, " {}=", update.cell);
                    push_sized(&mut out, &update.value);
                }
                out
            }
            ServerMessage::Error(reason) => {
                let mut out = String::from("ERROR ");
                push_sized(&mut out, reason);
                out
            }
            ServerMessage::Reset => "RESET".to_string(),
        }
    }

    fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        complete(buf, |r| {
            let message = match r.token(b" \n")? {
                "CELLS" => {
                    let mut updates = Vec::new();
                    while r.peek()? == b' ' {
                        r.expect(b' ', "space")?;
                        let cell = r.cell(b"=\n")?;
                        r.expect(b'=', "'='")?;
                        updates.push(CellUpdate::new(cell, r.sized()?));
                    }
                    ServerMessage::Cells(updates)
                }
                "ERROR" => {
                    r.expect(b' ', "space")?;
                    ServerMessage::Error(r.sized()?)
                }
                "RESET" => ServerMessage::Reset,
                "" => return Err(ProtocolError::MissingField("command").into()),
                other => return Err(ProtocolError::UnknownCommand(other.to_string()).into()),
            };
            r.expect(b'\n', "end of message")?;
            Ok(message)
        })
    }
}

fn push_sized(out: &mut String, field: &str) {
    let _ = write!(out, "{}:{}", field.len(), field);
}

/// Accumulates bytes from a stream and yields whole messages
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete message off the front of the buffer
    pub fn next_message<M: WireMessage>(&mut self) -> Result<Option<M>, ProtocolError> {
        match M::decode(&self.buf)? {
            Some((message, used)) => {
                self.buf.drain(..used);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// =============================================================================
// Decoding
// =============================================================================

enum DecodeError {
    /// More bytes are needed
    Incomplete,
    Invalid(ProtocolError),
}

impl From<ProtocolError> for DecodeError {
    fn from(e: ProtocolError) -> Self {
        DecodeError::Invalid(e)
    }
}

fn complete<T>(
    buf: &[u8],
    parse: impl FnOnce(&mut Reader<'_>) -> Result<T, DecodeError>,
) -> Result<Option<(T, usize)>, ProtocolError> {
    let mut reader = Reader { buf, pos: 0 };
    match parse(&mut reader) {
        Ok(message) => Ok(Some((message, reader.pos))),
        Err(DecodeError::Incomplete) => Ok(None),
        Err(DecodeError::Invalid(e)) => Err(e),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn peek(&self) -> Result<u8, DecodeError> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::Incomplete)
    }

    fn expect(&mut self, byte: u8, expected: &'static str) -> Result<(), DecodeError> {
        if self.peek()? != byte {
            return Err(ProtocolError::Unexpected {
                expected,
                position: self.pos,
            }
            .into());
        }
        self.pos += 1;
        Ok(())
    }

    /// Bytes up to (not including) the first delimiter
    fn token(&mut self, delimiters: &[u8]) -> Result<&'a str, DecodeError> {
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos..];
        let len = match rest.iter().position(|b| delimiters.contains(b)) {
            Some(len) if len <= MAX_TOKEN_BYTES => len,
            Some(_) => return Err(ProtocolError::TokenTooLong.into()),
            None if rest.len() > MAX_TOKEN_BYTES => return Err(ProtocolError::TokenTooLong.into()),
            None => return Err(DecodeError::Incomplete),
        };

        let token = str::from_utf8(&rest[..len]).map_err(|_| ProtocolError::InvalidUtf8)?;
        self.pos += len;
        Ok(token)
    }

    fn required_token(&mut self, delimiters: &[u8], what: &'static str) -> Result<&'a str, DecodeError> {
        match self.token(delimiters)? {
            "" => Err(ProtocolError::MissingField(what).into()),
            token => Ok(token),
        }
    }

    fn cell(&mut self, delimiters: &[u8]) -> Result<CellCoord, DecodeError> {
        let label = self.required_token(delimiters, "cell")?;
        label
            .parse()
            .map_err(|_| ProtocolError::InvalidCell(label.to_string()).into())
    }

    /// A `<len>:<bytes>` field
    fn sized(&mut self) -> Result<String, DecodeError> {
        let digits = self.token(b":")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidLength.into());
        }
        let len: usize = digits.parse().map_err(|_| ProtocolError::InvalidLength)?;
        if len > MAX_FIELD_BYTES {
            return Err(ProtocolError::FieldTooLarge(len).into());
        }
        self.expect(b':', "':'")?;

        let end = self.pos + len;
        let bytes = self.buf.get(self.pos..end).ok_or(DecodeError::Incomplete)?;
        let field = str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        self.pos = end;
        Ok(field.to_string())
    }
}
