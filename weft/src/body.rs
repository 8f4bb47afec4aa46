// src/body.rs
//
// Streaming request body. The handler may read part of it or none at
// all; after the handler returns, the connection drains whatever is left
// to the next message boundary before the connection is reused.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{WeftError, WeftResult};
use crate::http::Headers;
use crate::parser::{self, Framing, ParseError};
use crate::stream::Channel;

enum State {
    Identity { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Done,
}

struct BodyState {
    chan: Rc<RefCell<Channel>>,
    state: State,
    trailer: Option<Headers>,
}

/// Cloneable handle to one request's body stream.
#[derive(Clone)]
pub struct BodyReader {
    inner: Rc<RefCell<BodyState>>,
}

impl BodyReader {
    pub(crate) fn new(chan: Rc<RefCell<Channel>>, framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty => State::Done,
            Framing::Identity(n) => State::Identity { remaining: n },
            Framing::Chunked => State::ChunkSize,
        };
        BodyReader {
            inner: Rc::new(RefCell::new(BodyState {
                chan,
                state,
                trailer: None,
            })),
        }
    }

    /// Read body bytes into `out`. Returns 0 at the end of the body.
    pub async fn read(&self, out: &mut [u8]) -> WeftResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let chan = self.inner.borrow().chan.clone();
        loop {
            // Decide the next step under a short borrow; the I/O below
            // runs with the state borrow released.
            enum Step {
                Eof,
                Identity(u64),
                ChunkSize,
                ChunkData(u64),
                ChunkDataEnd,
                Trailers,
            }
            let step = {
                let st = self.inner.borrow();
                match &st.state {
                    State::Done => Step::Eof,
                    State::Identity { remaining } => Step::Identity(*remaining),
                    State::ChunkSize => Step::ChunkSize,
                    State::ChunkData { remaining } => Step::ChunkData(*remaining),
                    State::ChunkDataEnd => Step::ChunkDataEnd,
                    State::Trailers => Step::Trailers,
                }
            };
            match step {
                Step::Eof => return Ok(0),
                Step::Identity(remaining) => {
                    if remaining == 0 {
                        self.inner.borrow_mut().state = State::Done;
                        return Ok(0);
                    }
                    let want = (remaining.min(out.len() as u64)) as usize;
                    let n = chan.borrow_mut().read(&mut out[..want]).await?;
                    if n == 0 {
                        return Err(WeftError::ConnectionClosed);
                    }
                    self.inner.borrow_mut().state = State::Identity {
                        remaining: remaining - n as u64,
                    };
                    return Ok(n);
                }
                Step::ChunkSize => {
                    let line = chan
                        .borrow_mut()
                        .read_line()
                        .await?
                        .ok_or(WeftError::ConnectionClosed)?;
                    let size = parser::parse_chunk_size(&line)?;
                    self.inner.borrow_mut().state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                Step::ChunkData(remaining) => {
                    let want = (remaining.min(out.len() as u64)) as usize;
                    let n = chan.borrow_mut().read(&mut out[..want]).await?;
                    if n == 0 {
                        return Err(WeftError::ConnectionClosed);
                    }
                    let left = remaining - n as u64;
                    self.inner.borrow_mut().state = if left == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining: left }
                    };
                    return Ok(n);
                }
                Step::ChunkDataEnd => {
                    let line = chan
                        .borrow_mut()
                        .read_line()
                        .await?
                        .ok_or(WeftError::ConnectionClosed)?;
                    if !line.is_empty() {
                        return Err(WeftError::Parse(ParseError::BadChunk));
                    }
                    self.inner.borrow_mut().state = State::ChunkSize;
                }
                Step::Trailers => {
                    let mut trailer = Headers::new();
                    loop {
                        let line = chan
                            .borrow_mut()
                            .read_line()
                            .await?
                            .ok_or(WeftError::ConnectionClosed)?;
                        if line.is_empty() {
                            break;
                        }
                        let colon = line
                            .iter()
                            .position(|&b| b == b':')
                            .ok_or(WeftError::Parse(ParseError::BadChunk))?;
                        let name = String::from_utf8_lossy(&line[..colon]).into_owned();
                        let value = String::from_utf8_lossy(&line[colon + 1..])
                            .trim()
                            .to_string();
                        trailer.append(name, value);
                    }
                    let mut st = self.inner.borrow_mut();
                    st.trailer = Some(trailer);
                    st.state = State::Done;
                    return Ok(0);
                }
            }
        }
    }

    /// Read the whole body, erroring past `limit` bytes.
    pub async fn read_to_end(&self, limit: usize) -> WeftResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            if out.len() + n > limit {
                return Err(WeftError::with_code(413, "request body too large"));
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Consume whatever the handler left unread, up to the message
    /// boundary.
    pub async fn drain(&self) -> WeftResult<()> {
        let mut buf = [0u8; 4096];
        loop {
            if self.read(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    pub fn is_consumed(&self) -> bool {
        matches!(self.inner.borrow().state, State::Done)
    }

    /// Trailer headers, populated only after the body has been fully
    /// consumed (chunked bodies only).
    pub fn trailer(&self) -> Option<Headers> {
        self.inner.borrow().trailer.clone()
    }
}
