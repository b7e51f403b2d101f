//! Resumable http message parser.
//!
//! [`HttpParser::parse`] is handed every byte the caller has not seen consumed
//! yet. It walks the states below, each one looking for its delimiter inside
//! the bytes at hand only. A state that cannot finish records itself as the
//! resume point and the call returns [`Outcome::Indeterminate`] with the
//! number of bytes consumed so far; the caller keeps the rest, appends the
//! next read and calls again.
//!
//! ```text
//! request:  StartLine -> Method -> Url -> Version ------------+
//! response: StartLine -> Version -> Status -> ReasonPhrase ---+
//!                                                             v
//!           Header <-> HeaderName -> HeaderValue ... -> EntityBody[Chunked] -> ContentMd5 -> ContentMd5Name -> ContentMd5Value
//! ```

use http::{Method, StatusCode};
use std::fmt;
use tracing::trace;

use crate::codec::MAX_CHUNK_LEN;
use crate::http::message::{HttpRequest, HttpResponse, METHODS};
use crate::utils::{find_byte, find_crlf, parse_hex};

/// The result of one [`HttpParser::parse`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The message is complete and every byte handed in was consumed
    Good,
    /// The message is complete, bytes after it belong to the next message
    GoodWithLeftoverChunks,
    /// Malformed input
    Bad,
    /// More bytes are needed
    Indeterminate,
    /// The parser was used past the end of its message
    ParseError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseResult {
    pub outcome: Outcome,
    /// Bytes of this call's input that belong to the message
    pub consumed: usize,
}

impl ParseResult {
    fn new(outcome: Outcome, consumed: usize) -> Self {
        Self { outcome, consumed }
    }

    /// The numeric return contract: `-1` complete, `>= 0` bytes consumed
    /// (more data needed, or a complete message followed by leftover bytes),
    /// `-3` malformed, `-4` internal error.
    pub fn code(&self) -> isize {
        match self.outcome {
            Outcome::Good => -1,
            Outcome::Indeterminate | Outcome::GoodWithLeftoverChunks => {
                isize::try_from(self.consumed).unwrap_or(isize::MAX)
            }
            Outcome::Bad => -3,
            Outcome::ParseError => -4,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, Outcome::Good | Outcome::GoodWithLeftoverChunks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    StartLine,
    Method,
    Url,
    Version,
    Status,
    ReasonPhrase,
    Header,
    HeaderName,
    HeaderValue,
    EntityBody,
    EntityBodyChunked,
    ContentMd5,
    ContentMd5Name,
    ContentMd5Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Start,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// A message the parser can fill in.
pub trait ParseTarget: Default + fmt::Debug + Send {
    const KIND: MessageKind;

    /// Stores one start-line token. Returns `false` when the token is invalid.
    fn accept_token(&mut self, state: State, token: &[u8]) -> bool;

    fn headers(&self) -> &crate::http::Headers;

    fn headers_mut(&mut self) -> &mut crate::http::Headers;

    fn body_mut(&mut self) -> &mut Vec<u8>;

    fn reset(&mut self);
}

enum Step {
    Next(State, Phase),
    /// Delimiter not in sight, resume here on the next call
    Suspend,
    Done(Outcome),
}

use Phase::{Finish, Start};

/// Incremental parser for one message at a time, reused through [`reset`](HttpParser::reset).
#[derive(Debug, Default)]
pub struct HttpParser<T> {
    result: T,
    resume: Option<(State, Phase)>,
    header_name: String,
    chunk_len: Option<usize>,
    complete: bool,
}

pub type RequestParser = HttpParser<HttpRequest>;
pub type ResponseParser = HttpParser<HttpResponse>;

impl<T: ParseTarget> HttpParser<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data`, which must start with the first byte not yet consumed.
    pub fn parse(&mut self, data: &[u8]) -> ParseResult {
        if self.complete {
            return ParseResult::new(Outcome::ParseError, 0);
        }

        let (mut state, mut phase) = self.resume.take().unwrap_or((State::StartLine, Start));
        let mut pos = 0;
        loop {
            match self.transition(state, phase, data, &mut pos) {
                Step::Next(next_state, next_phase) => {
                    state = next_state;
                    phase = next_phase;
                }
                Step::Suspend => {
                    trace!(?state, consumed = pos, "need more data");
                    self.resume = Some((state, phase));
                    return ParseResult::new(Outcome::Indeterminate, pos);
                }
                Step::Done(Outcome::Good) => {
                    self.complete = true;
                    let outcome = if pos < data.len() { Outcome::GoodWithLeftoverChunks } else { Outcome::Good };
                    return ParseResult::new(outcome, pos);
                }
                Step::Done(outcome) => {
                    trace!(?state, ?outcome, position = pos, "parse stopped");
                    return ParseResult::new(outcome, pos);
                }
            }
        }
    }

    /// One state handler per `(state, phase)` pair; `Finish` picks the successor.
    fn transition(&mut self, state: State, phase: Phase, data: &[u8], pos: &mut usize) -> Step {
        let rest = &data[*pos..];
        match (state, phase) {
            (State::StartLine, Start) => match T::KIND {
                MessageKind::Request => Step::Next(State::Method, Start),
                MessageKind::Response => Step::Next(State::Version, Start),
            },
            (State::StartLine, Finish) => Step::Next(State::Header, Start),

            (State::Method | State::Url, Start) => match find_token_end(rest) {
                TokenEnd::Space(end) => self.take_token(state, &rest[..end], end + 1, pos),
                TokenEnd::Crlf(_) => Step::Done(Outcome::Bad),
                TokenEnd::Missing => Step::Suspend,
            },
            (State::Method, Finish) => Step::Next(State::Url, Start),
            (State::Url, Finish) => Step::Next(State::Version, Start),

            (State::Version, Start) => match (T::KIND, find_token_end(rest)) {
                (MessageKind::Request, TokenEnd::Crlf(end)) | (MessageKind::Response, TokenEnd::Space(end)) => {
                    let skip = if T::KIND == MessageKind::Request { 2 } else { 1 };
                    self.take_token(state, &rest[..end], end + skip, pos)
                }
                (_, TokenEnd::Missing) => Step::Suspend,
                _ => Step::Done(Outcome::Bad),
            },
            (State::Version, Finish) => match T::KIND {
                MessageKind::Request => Step::Next(State::StartLine, Finish),
                MessageKind::Response => Step::Next(State::Status, Start),
            },

            // a status line may end right after the code
            (State::Status, Start) => match find_token_end(rest) {
                TokenEnd::Space(end) => self.take_token(state, &rest[..end], end + 1, pos),
                TokenEnd::Crlf(end) => match self.take_token(state, &rest[..end], end + 2, pos) {
                    Step::Next(..) => Step::Next(State::StartLine, Finish),
                    other => other,
                },
                TokenEnd::Missing => Step::Suspend,
            },
            (State::Status, Finish) => Step::Next(State::ReasonPhrase, Start),
            (State::ReasonPhrase, Start) => match find_crlf(rest) {
                Some(end) => self.take_token(state, &rest[..end], end + 2, pos),
                None => Step::Suspend,
            },
            (State::ReasonPhrase, Finish) => Step::Next(State::StartLine, Finish),

            (State::Header, Start) => {
                if rest.starts_with(b"\r\n") {
                    *pos += 2;
                    Step::Next(State::Header, Finish)
                } else if rest.is_empty() || rest == b"\r" {
                    Step::Suspend
                } else {
                    Step::Next(State::HeaderName, Start)
                }
            }
            (State::Header, Finish) => Step::Next(State::EntityBody, Start),

            (State::HeaderName | State::ContentMd5Name, Start) => match read_name(rest) {
                Ok(Some((name, used))) => {
                    self.header_name = name;
                    *pos += used;
                    Step::Next(state, Finish)
                }
                Ok(None) => Step::Suspend,
                Err(()) => Step::Done(Outcome::Bad),
            },
            (State::HeaderName, Finish) => Step::Next(State::HeaderValue, Start),
            (State::ContentMd5Name, Finish) => Step::Next(State::ContentMd5Value, Start),

            (State::HeaderValue | State::ContentMd5Value, Start) => match find_crlf(rest) {
                Some(end) => {
                    let value = String::from_utf8_lossy(rest[..end].trim_ascii()).into_owned();
                    let name = std::mem::take(&mut self.header_name);
                    self.result.headers_mut().push(name, value);
                    *pos += end + 2;
                    Step::Next(state, Finish)
                }
                None => Step::Suspend,
            },
            (State::HeaderValue, Finish) => Step::Next(State::Header, Start),
            (State::ContentMd5Value, Finish) => Step::Next(State::ContentMd5, Finish),

            (State::EntityBody, Start) => self.read_body(rest, pos),
            (State::EntityBody, Finish) => {
                if self.result.headers().announces_md5_trailer() {
                    Step::Next(State::ContentMd5, Start)
                } else if rest.starts_with(b"\r\n") {
                    // a plain chunked body ends with an empty line
                    *pos += 2;
                    Step::Done(Outcome::Good)
                } else if rest.is_empty() || rest == b"\r" {
                    Step::Suspend
                } else {
                    Step::Done(Outcome::Bad)
                }
            }

            (State::EntityBodyChunked, Start) => self.read_chunk(rest, pos),
            (State::EntityBodyChunked, Finish) => Step::Next(State::EntityBody, Finish),

            (State::ContentMd5, Start) => match find_crlf(rest) {
                Some(0) => Step::Done(Outcome::Bad),
                Some(_) => Step::Next(State::ContentMd5Name, Start),
                None => Step::Suspend,
            },
            (State::ContentMd5, Finish) => Step::Done(Outcome::Good),
        }
    }

    fn take_token(&mut self, state: State, token: &[u8], used: usize, pos: &mut usize) -> Step {
        if !self.result.accept_token(state, token) {
            return Step::Done(Outcome::Bad);
        }
        *pos += used;
        Step::Next(state, Finish)
    }

    /// Exactly `Content-Length` bytes, or the chunked sub-states.
    fn read_body(&mut self, rest: &[u8], pos: &mut usize) -> Step {
        if self.result.headers().is_chunked() {
            return Step::Next(State::EntityBodyChunked, Start);
        }

        // without a length the message ends with its headers
        let len = match self.result.headers().content_length() {
            Ok(Some(len)) if len > 0 => len,
            Ok(_) => return Step::Done(Outcome::Good),
            Err(_) => return Step::Done(Outcome::Bad),
        };
        if rest.len() < len {
            return Step::Suspend;
        }
        if rest.len() > len {
            return Step::Done(Outcome::Bad);
        }
        self.result.body_mut().extend_from_slice(rest);
        *pos += len;
        Step::Done(Outcome::Good)
    }

    /// Appends every complete `<hex>\r\n<bytes>\r\n` frame at hand. A decoded
    /// size line is consumed and remembered while its payload is incomplete.
    fn read_chunk(&mut self, rest: &[u8], pos: &mut usize) -> Step {
        let mut rest = rest;
        loop {
            let len = match self.chunk_len {
                Some(len) => len,
                None => {
                    let Some(end) = find_crlf(rest) else {
                        return Step::Suspend;
                    };
                    let size_line = &rest[..end];
                    let digits = find_byte(size_line, b';').map_or(size_line, |ext| &size_line[..ext]);
                    let Some(len) = parse_hex(digits).filter(|len| *len <= MAX_CHUNK_LEN) else {
                        return Step::Done(Outcome::Bad);
                    };
                    *pos += end + 2;
                    rest = &rest[end + 2..];
                    if len == 0 {
                        return Step::Next(State::EntityBodyChunked, Finish);
                    }
                    self.chunk_len = Some(len);
                    len
                }
            };

            if rest.len() < len + 2 {
                return Step::Suspend;
            }
            if &rest[len..len + 2] != b"\r\n" {
                return Step::Done(Outcome::Bad);
            }
            trace!(len, "read chunk");
            self.result.body_mut().extend_from_slice(&rest[..len]);
            self.chunk_len = None;
            *pos += len + 2;
            rest = &rest[len + 2..];
        }
    }

    pub fn result(&self) -> &T {
        &self.result
    }

    /// Takes the parsed message and readies the parser for the next one.
    pub fn take_result(&mut self) -> T {
        let result = std::mem::take(&mut self.result);
        self.reset();
        result
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether the start line and headers are done and the body is being read.
    pub fn is_parsing_body(&self) -> bool {
        matches!(self.resume, Some((State::EntityBody | State::EntityBodyChunked, _)))
    }

    /// Where the next call resumes, `None` before the first byte.
    pub fn resume_state(&self) -> Option<(State, Phase)> {
        self.resume
    }

    pub fn reset(&mut self) {
        self.result.reset();
        self.resume = None;
        self.header_name.clear();
        self.chunk_len = None;
        self.complete = false;
    }
}

enum TokenEnd {
    Space(usize),
    Crlf(usize),
    Missing,
}

/// Finds the end of a start-line token: a space, or the end of the line.
fn find_token_end(rest: &[u8]) -> TokenEnd {
    match (find_byte(rest, b' '), find_crlf(rest)) {
        (Some(space), Some(crlf)) if crlf < space => TokenEnd::Crlf(crlf),
        (Some(space), _) => TokenEnd::Space(space),
        (None, Some(crlf)) => TokenEnd::Crlf(crlf),
        (None, None) => TokenEnd::Missing,
    }
}

/// Reads `Name:`. A line break before the colon or an empty name is malformed.
fn read_name(rest: &[u8]) -> Result<Option<(String, usize)>, ()> {
    let crlf = find_crlf(rest);
    match find_byte(rest, b':') {
        Some(colon) if crlf.is_none_or(|crlf| colon < crlf) => {
            let name = rest[..colon].trim_ascii();
            if name.is_empty() || !name.iter().all(|b| is_token_byte(*b)) {
                return Err(());
            }
            Ok(Some((String::from_utf8_lossy(name).into_owned(), colon + 1)))
        }
        _ if crlf.is_some() => Err(()),
        _ => Ok(None),
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

impl ParseTarget for HttpRequest {
    const KIND: MessageKind = MessageKind::Request;

    fn accept_token(&mut self, state: State, token: &[u8]) -> bool {
        match state {
            State::Method => {
                if !token.iter().all(|b| is_token_byte(*b)) || !METHODS.iter().any(|m| m.as_bytes() == token) {
                    return false;
                }
                match Method::from_bytes(token) {
                    Ok(method) => {
                        self.set_method(method);
                        true
                    }
                    Err(_) => false,
                }
            }
            State::Url => {
                if token.is_empty() || token.iter().any(u8::is_ascii_control) {
                    return false;
                }
                self.set_url(String::from_utf8_lossy(token).into_owned());
                true
            }
            State::Version => match accept_version(token) {
                Some(version) => {
                    self.set_version(version);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    fn headers(&self) -> &crate::http::Headers {
        HttpRequest::headers(self)
    }

    fn headers_mut(&mut self) -> &mut crate::http::Headers {
        HttpRequest::headers_mut(self)
    }

    fn body_mut(&mut self) -> &mut Vec<u8> {
        HttpRequest::body_mut(self)
    }

    fn reset(&mut self) {
        HttpRequest::reset(self);
    }
}

impl ParseTarget for HttpResponse {
    const KIND: MessageKind = MessageKind::Response;

    fn accept_token(&mut self, state: State, token: &[u8]) -> bool {
        match state {
            State::Version => match accept_version(token) {
                Some(version) => {
                    self.set_version(version);
                    true
                }
                None => false,
            },
            State::Status => {
                if token.len() != 3 {
                    return false;
                }
                match StatusCode::from_bytes(token) {
                    Ok(status) => {
                        self.set_status(status);
                        true
                    }
                    Err(_) => false,
                }
            }
            State::ReasonPhrase => {
                self.set_reason(String::from_utf8_lossy(token.trim_ascii()).into_owned());
                true
            }
            _ => false,
        }
    }

    fn headers(&self) -> &crate::http::Headers {
        HttpResponse::headers(self)
    }

    fn headers_mut(&mut self) -> &mut crate::http::Headers {
        HttpResponse::headers_mut(self)
    }

    fn body_mut(&mut self) -> &mut Vec<u8> {
        HttpResponse::body_mut(self)
    }

    fn reset(&mut self) {
        HttpResponse::reset(self);
    }
}

fn accept_version(token: &[u8]) -> Option<String> {
    let digits = token.strip_prefix(b"HTTP/")?;
    let valid = matches!(digits, [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit());
    valid.then(|| String::from_utf8_lossy(token).into_owned())
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Good => "good",
            Outcome::GoodWithLeftoverChunks => "good with leftover",
            Outcome::Bad => "bad",
            Outcome::Indeterminate => "indeterminate",
            Outcome::ParseError => "parse error",
        };
        f.write_str(name)
    }
}
