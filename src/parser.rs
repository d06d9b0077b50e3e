//! Byte-level line framing and Telnet escape handling.
//!
//! Implements the minimal Telnet grammar the multiplexer understands:
//! - lines terminated by LF (CR is stripped, not required)
//! - backspace editing of the line under construction
//! - IAC escape sequences of exactly three bytes (IAC, disposition,
//!   parameter), swallowed outside line framing and surfaced as opaque
//!   control events
//!
//! Full option negotiation is out of scope; the three-byte skip is enough to
//! keep typical Telnet clients usable while handing the raw control bytes to
//! the application.

use bytes::{BufMut, BytesMut};

/// Telnet "interpret as command" escape byte.
pub const IAC: u8 = 255;

/// Backspace control byte.
const BACKSPACE: u8 = 8;

/// Carriage return, ignored by the framer.
const CR: u8 = 13;

/// Line feed, terminates a line.
const LF: u8 = 10;

/// Parser state between bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Accumulating line text.
    Normal,
    /// Saw IAC, next byte is the disposition.
    Disposition,
    /// Saw the disposition, next byte is the parameter.
    Parameter,
}

/// Event produced by feeding a byte to the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// A complete line, CR/LF stripped and backspace-edited, with invalid
    /// UTF-8 sequences replaced.
    Line(String),
    /// A complete Telnet control sequence.
    Control {
        /// The byte following the disposition.
        parameter: u8,
        /// The byte following IAC.
        disposition: u8,
    },
}

/// Stateful per-byte line parser.
///
/// Owns the line under construction; the buffer is emptied every time a
/// complete line is produced. There is no terminal state; the parser lives
/// for the lifetime of its connection.
#[derive(Debug)]
pub struct LineParser {
    mode: Mode,
    disposition: u8,
    line: BytesMut,
}

impl LineParser {
    /// Create a parser in normal mode with an empty line buffer.
    pub fn new() -> Self {
        Self {
            mode: Mode::Normal,
            disposition: 0,
            line: BytesMut::new(),
        }
    }

    /// Consume one byte, possibly producing an event.
    pub fn feed(&mut self, byte: u8) -> Option<ParseEvent> {
        match self.mode {
            Mode::Normal => match byte {
                IAC => {
                    self.mode = Mode::Disposition;
                    None
                }
                BACKSPACE => {
                    if !self.line.is_empty() {
                        let len = self.line.len();
                        self.line.truncate(len - 1);
                    }
                    None
                }
                CR => None,
                LF => {
                    let raw = self.line.split();
                    Some(ParseEvent::Line(
                        String::from_utf8_lossy(&raw).into_owned(),
                    ))
                }
                _ => {
                    self.line.put_u8(byte);
                    None
                }
            },
            Mode::Disposition => {
                self.disposition = byte;
                self.mode = Mode::Parameter;
                None
            }
            Mode::Parameter => {
                self.mode = Mode::Normal;
                Some(ParseEvent::Control {
                    parameter: byte,
                    disposition: self.disposition,
                })
            }
        }
    }

    /// Length in bytes of the line currently under construction.
    pub fn line_len(&self) -> usize {
        self.line.len()
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}
