//! Minimal telnet option handling for interactive clients.
//!
//! The server asks the client for character mode (it will echo and suppress
//! go-ahead) and for window-size reports. Everything else the client says is
//! accepted and ignored.

use crunchy_sandbox::TerminalSize;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;
pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_NAWS: u8 = 31;

const MAX_SUBNEGOTIATION: usize = 64;

/// Options the server offers when a client connects.
pub fn negotiation() -> [u8; 9] {
    [IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA, IAC, DO, OPT_NAWS]
}

/// Double every IAC byte so output data is not read as a command.
pub fn escape_output(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        if byte == IAC {
            out.push(IAC);
        }
        out.push(byte);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Option,
    Sub,
    SubIac,
}

/// Bytes and window-size reports decoded from one chunk of client input.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub data: Vec<u8>,
    pub resizes: Vec<TerminalSize>,
}

/// Streaming decoder that strips telnet commands from client input.
#[derive(Debug)]
pub struct TelnetDecoder {
    state: State,
    after_cr: bool,
    sub: Vec<u8>,
}

impl Default for TelnetDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            after_cr: false,
            sub: Vec::new(),
        }
    }

    /// Decode one chunk. State carries over between calls.
    pub fn decode(&mut self, input: &[u8]) -> Decoded {
        let mut decoded = Decoded::default();
        for &byte in input {
            match self.state {
                State::Data => {
                    if byte == IAC {
                        self.state = State::Iac;
                        continue;
                    }
                    let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
                    // Telnet sends end of line as CR NUL or CR LF.
                    if after_cr && (byte == 0 || byte == b'\n') {
                        continue;
                    }
                    decoded.data.push(byte);
                }
                State::Iac => {
                    self.state = match byte {
                        IAC => {
                            self.after_cr = false;
                            decoded.data.push(IAC);
                            State::Data
                        }
                        WILL | WONT | DO | DONT => State::Option,
                        SB => {
                            self.sub.clear();
                            State::Sub
                        }
                        _ => State::Data,
                    };
                }
                State::Option => self.state = State::Data,
                State::Sub => {
                    if byte == IAC {
                        self.state = State::SubIac;
                    } else if self.sub.len() < MAX_SUBNEGOTIATION {
                        self.sub.push(byte);
                    }
                }
                State::SubIac => match byte {
                    SE => {
                        if let Some(size) = self.window_size() {
                            decoded.resizes.push(size);
                        }
                        self.state = State::Data;
                    }
                    IAC => {
                        if self.sub.len() < MAX_SUBNEGOTIATION {
                            self.sub.push(IAC);
                        }
                        self.state = State::Sub;
                    }
                    _ => self.state = State::Data,
                },
            }
        }
        decoded
    }

    fn window_size(&self) -> Option<TerminalSize> {
        let [OPT_NAWS, w_hi, w_lo, h_hi, h_lo, ..] = self.sub[..] else {
            return None;
        };
        let size = TerminalSize {
            cols: u16::from_be_bytes([w_hi, w_lo]),
            rows: u16::from_be_bytes([h_hi, h_lo]),
        };
        (size.cols > 0 && size.rows > 0).then_some(size)
    }
}

/// What arrived while waiting for the client's option replies.
#[derive(Debug, Default)]
pub struct Negotiated {
    /// Typed data received early, to be replayed into the session.
    pub pending: Vec<u8>,
    /// Last window size the client reported.
    pub size: Option<TerminalSize>,
}

/// Read client replies until a window size arrives, the client goes quiet
/// for `wait`, or the stream closes.
pub async fn negotiate<R>(
    reader: &mut R,
    decoder: &mut TelnetDecoder,
    wait: Duration,
) -> std::io::Result<Negotiated>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + wait;
    let mut negotiated = Negotiated::default();
    let mut buf = [0u8; 512];
    loop {
        let read = match tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => break,
        };
        if read == 0 {
            break;
        }
        let decoded = decoder.decode(&buf[..read]);
        negotiated.pending.extend(decoded.data);
        if let Some(size) = decoded.resizes.last() {
            negotiated.size = Some(*size);
            break;
        }
    }
    debug!(
        "telnet negotiation finished (window={:?}, pending_bytes={})",
        negotiated.size,
        negotiated.pending.len()
    );
    Ok(negotiated)
}
