//! Raw terminal line assembly.
//!
//! The peer's terminal is in character mode, so the server does its own
//! echo and backspace handling one byte at a time.

use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const DEL: u8 = 0x7f;
const BS: u8 = 0x08;
const ERASE: &[u8] = b"\x08 \x08";

/// Line terminator echoed back to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Newline {
    CrLf,
    Lf,
}

impl Newline {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Newline::CrLf => b"\r\n",
            Newline::Lf => b"\n",
        }
    }

    /// Rewrite bare `\n` line endings in `text` to this terminator.
    pub fn normalize(self, text: &str) -> String {
        match self {
            Newline::Lf => text.to_string(),
            Newline::CrLf => {
                let mut out = String::with_capacity(text.len() + text.len() / 16);
                let mut prev = '\0';
                for ch in text.chars() {
                    if ch == '\n' && prev != '\r' {
                        out.push('\r');
                    }
                    out.push(ch);
                    prev = ch;
                }
                out
            }
        }
    }
}

/// Effect of feeding one byte.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Feed {
    /// Bytes to echo back to the peer.
    pub echo: Vec<u8>,
    /// A completed line, if the byte terminated one.
    pub line: Option<String>,
}

/// Byte-at-a-time line editor with destructive backspace.
#[derive(Debug)]
pub struct LineEditor {
    buffer: String,
    echo: bool,
    newline: Newline,
    after_cr: bool,
    pending: VecDeque<u8>,
}

impl LineEditor {
    pub fn new(newline: Newline) -> Self {
        Self {
            buffer: String::new(),
            echo: true,
            newline,
            after_cr: false,
            pending: VecDeque::new(),
        }
    }

    /// Toggle echo of typed characters; line terminators are always echoed.
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn newline(&self) -> Newline {
        self.newline
    }

    /// Current, unterminated line contents.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Process a single input byte.
    pub fn feed(&mut self, byte: u8) -> Feed {
        let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
        match byte {
            // CR LF from a telnet client is one terminator.
            b'\n' if after_cr => Feed::default(),
            b'\r' | b'\n' => Feed {
                echo: self.newline.as_bytes().to_vec(),
                line: Some(std::mem::take(&mut self.buffer)),
            },
            DEL | BS => {
                if self.buffer.pop().is_some() && self.echo {
                    Feed {
                        echo: ERASE.to_vec(),
                        line: None,
                    }
                } else {
                    Feed::default()
                }
            }
            0x20..=0x7e => {
                self.buffer.push(byte as char);
                Feed {
                    echo: if self.echo { vec![byte] } else { Vec::new() },
                    line: None,
                }
            }
            _ => Feed::default(),
        }
    }

    /// Read bytes until a full line is assembled, echoing as it goes.
    ///
    /// Returns `Ok(None)` when the stream closes. Bytes that arrive after the
    /// terminator are kept for the next call.
    pub async fn read_line<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> std::io::Result<Option<String>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut chunk = [0u8; 1024];
        loop {
            while let Some(byte) = self.pending.pop_front() {
                let feed = self.feed(byte);
                if !feed.echo.is_empty() {
                    writer.write_all(&feed.echo).await?;
                }
                if let Some(line) = feed.line {
                    writer.flush().await?;
                    return Ok(Some(line));
                }
            }
            writer.flush().await?;
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                return Ok(None);
            }
            self.pending.extend(&chunk[..read]);
        }
    }
}
