//! Incremental STOMP stream parser.
//!
//! Bytes are appended as they arrive and decoded by a small state machine:
//!
//! ```text
//! Command -> Headers -> BodyByLength -> WaitForNul -> Command
//!                    \-> BodyUntilNul ---------------/
//! ```
//!
//! A frame whose body is not followed by NUL is reported once and the rest
//! of it is skipped up to the next NUL.
//!
//! Every state either consumes a complete unit and advances, or leaves the
//! buffer untouched and reports that more input is needed, so a frame split
//! across any number of reads decodes exactly as if it arrived at once.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::header::{self, Header, Headers};
use crate::{MAX_BODY_SIZE, MAX_PARSE_STEPS};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Command text and headers collected so far for the frame being decoded.
#[derive(Debug)]
struct Staged {
    command: String,
    headers: Headers,
}

#[derive(Debug)]
enum State {
    Command,
    Headers(Staged),
    BodyByLength { staged: Staged, length: usize },
    BodyUntilNul(Staged),
    WaitForNul { staged: Staged, body: Bytes },
    SkipToNul,
}

enum Step {
    Progressed,
    NeedMore,
}

/// Decodes frames from an append-only byte buffer.
///
/// Decoded frames and recoverable decode errors are queued in arrival order
/// and handed out by [`StreamParser::next_frame`].
#[derive(Debug)]
pub struct StreamParser {
    buffer: BytesMut,
    state: State,
    ready: VecDeque<Result<Frame, ProtocolError>>,
    max_body_size: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            state: State::Command,
            ready: VecDeque::new(),
            max_body_size: MAX_BODY_SIZE,
        }
    }

    /// Sets the largest body accepted before the frame is rejected.
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of undecoded bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the number of decoded results waiting to be taken.
    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    /// Returns whether the parser sits between frames with nothing buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Command) && self.buffer.is_empty() && self.ready.is_empty()
    }

    /// Drops all buffered input and any partially decoded frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.ready.clear();
        self.state = State::Command;
    }

    /// Returns the next decoded frame or decode error, if any.
    ///
    /// When nothing is queued this drives the state machine first. `None`
    /// means no complete frame is available yet.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        if self.ready.is_empty() {
            self.parse();
        }
        self.ready.pop_front()
    }

    /// Runs up to [`MAX_PARSE_STEPS`] state transitions.
    ///
    /// Returns whether any input was consumed.
    pub fn parse(&mut self) -> bool {
        let mut progressed = false;
        for _ in 0..MAX_PARSE_STEPS {
            match self.step() {
                Step::Progressed => progressed = true,
                Step::NeedMore => break,
            }
        }
        progressed
    }

    fn step(&mut self) -> Step {
        match std::mem::replace(&mut self.state, State::Command) {
            State::Command => self.parse_command(),
            State::Headers(staged) => self.parse_headers(staged),
            State::BodyByLength { staged, length } => self.parse_body_by_length(staged, length),
            State::BodyUntilNul(staged) => self.parse_body_until_nul(staged),
            State::WaitForNul { staged, body } => self.parse_frame_end(staged, body),
            State::SkipToNul => self.skip_to_nul(),
        }
    }

    fn parse_command(&mut self) -> Step {
        let Some(line) = self.take_line() else {
            return Step::NeedMore;
        };

        // A bare newline between frames is a heart-beat.
        if line.is_empty() {
            return Step::Progressed;
        }

        match String::from_utf8(line.to_vec()) {
            Ok(command) => {
                self.state = State::Headers(Staged {
                    command,
                    headers: Headers::new(),
                });
                Step::Progressed
            }
            Err(_) => self.fail(ProtocolError::InvalidUtf8("command")),
        }
    }

    fn parse_headers(&mut self, mut staged: Staged) -> Step {
        let mut consumed = false;
        loop {
            let Some(line) = self.take_line() else {
                self.state = State::Headers(staged);
                return if consumed {
                    Step::Progressed
                } else {
                    Step::NeedMore
                };
            };
            consumed = true;

            if line.is_empty() {
                return self.begin_body(staged);
            }

            let Ok(text) = std::str::from_utf8(&line) else {
                return self.fail(ProtocolError::InvalidUtf8("header"));
            };
            match Header::parse(text) {
                Some(header) => {
                    staged.headers.push(header);
                }
                None => {
                    let line = text.to_string();
                    return self.fail(ProtocolError::InvalidHeader { line });
                }
            }
        }
    }

    fn begin_body(&mut self, staged: Staged) -> Step {
        let Some(value) = staged.headers.get(header::CONTENT_LENGTH) else {
            self.state = State::BodyUntilNul(staged);
            return Step::Progressed;
        };

        match value.trim().parse::<usize>() {
            Ok(length) if length > self.max_body_size => self.fail(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_body_size,
            }),
            Ok(length) => {
                self.state = State::BodyByLength { staged, length };
                Step::Progressed
            }
            Err(_) => {
                let value = value.to_string();
                self.fail(ProtocolError::InvalidContentLength(value))
            }
        }
    }

    fn parse_body_by_length(&mut self, staged: Staged, length: usize) -> Step {
        if self.buffer.len() < length {
            self.state = State::BodyByLength { staged, length };
            return Step::NeedMore;
        }

        let body = self.buffer.split_to(length).freeze();
        self.state = State::WaitForNul { staged, body };
        Step::Progressed
    }

    fn parse_body_until_nul(&mut self, staged: Staged) -> Step {
        match self.buffer.iter().position(|&b| b == 0) {
            Some(pos) => {
                let body = self.buffer.split_to(pos).freeze();
                self.buffer.advance(1);
                self.complete(staged, body)
            }
            None if self.buffer.len() > self.max_body_size => {
                let size = self.buffer.len();
                self.buffer.clear();
                self.fail(ProtocolError::FrameTooLarge {
                    size,
                    max: self.max_body_size,
                })
            }
            None => {
                self.state = State::BodyUntilNul(staged);
                Step::NeedMore
            }
        }
    }

    fn parse_frame_end(&mut self, staged: Staged, body: Bytes) -> Step {
        match self.buffer.first() {
            None => {
                self.state = State::WaitForNul { staged, body };
                Step::NeedMore
            }
            Some(0) => {
                self.buffer.advance(1);
                self.complete(staged, body)
            }
            Some(_) => {
                self.ready.push_back(Err(ProtocolError::MissingTerminator {
                    command: staged.command,
                }));
                self.state = State::SkipToNul;
                Step::Progressed
            }
        }
    }

    fn skip_to_nul(&mut self) -> Step {
        match self.buffer.iter().position(|&b| b == 0) {
            Some(pos) => {
                self.buffer.advance(pos + 1);
                Step::Progressed
            }
            None => {
                self.buffer.clear();
                self.state = State::SkipToNul;
                Step::NeedMore
            }
        }
    }

    fn complete(&mut self, staged: Staged, body: Bytes) -> Step {
        let frame = Frame::from_parts(staged.command, staged.headers, body);
        self.ready.push_back(Ok(frame));
        self.state = State::Command;
        Step::Progressed
    }

    fn fail(&mut self, error: ProtocolError) -> Step {
        self.ready.push_back(Err(error));
        self.state = State::Command;
        Step::Progressed
    }

    /// Removes one line from the buffer, without its `\n` or trailing `\r`.
    fn take_line(&mut self) -> Option<BytesMut> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        Some(line)
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}
