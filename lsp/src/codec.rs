//! LSP base-protocol framing.
//!
//! LSP delimits JSON-RPC messages with `Content-Length: N\r\n\r\n{json}`.
//! A TCP socket gives no guarantee that one read yields one message, so
//! [`MessageParser`] carries partial input across calls and turns each
//! chunk into zero or more decoded values. [`encode_frame`] is the
//! outbound counterpart.
//!
//! Content-Length is counted in bytes of the UTF-8 body on both sides.

use serde::Serialize;

use crate::reader::DataReader;

/// Default maximum body size (4 MiB) to prevent unbounded buffering.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Default maximum size of one header block.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const CONTENT_LENGTH_HEADER: &str = "Content-Length:";

const CONTENT_TYPE_HEADER: &str = "Content-Type: application/vscode-jsonrpc; charset=utf-8";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header block ended without a `Content-Length` header.
    #[error("missing Content-Length header in {headers:?}")]
    MissingContentLength { headers: String },
    #[error("invalid Content-Length value: {value:?}")]
    InvalidContentLength { value: String },
    #[error("Content-Length {length} exceeds maximum {max}")]
    Oversized { length: usize, max: usize },
    /// The header block grew past its limit, terminated or not.
    #[error("header block of {length} bytes exceeds maximum {max}")]
    HeadersTooLong { length: usize, max: usize },
    /// The body was complete but is not valid JSON.
    #[error("parsing JSON-RPC message body")]
    Body {
        #[source]
        source: serde_json::Error,
    },
}

impl FrameError {
    /// Framing errors leave the stream position unknown; body errors do not.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Body { .. })
    }
}

/// What the parser expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParsingState {
    #[default]
    Headers,
    Body { content_length: usize },
}

/// Stateful LSP message decoder that survives across socket reads.
#[derive(Debug)]
pub struct MessageParser {
    state: ParsingState,
    /// Received but unconsumed bytes. Consumed bytes are drained once per
    /// call, so a partial body is never copied again.
    leftover: Vec<u8>,
    /// How much of an unterminated header block was already searched.
    header_scanned: usize,
    max_frame_bytes: usize,
    max_header_bytes: usize,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageParser {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    #[must_use]
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            state: ParsingState::Headers,
            leftover: Vec::new(),
            header_scanned: 0,
            max_frame_bytes,
            max_header_bytes: MAX_HEADER_BYTES,
        }
    }

    pub fn with_max_header_bytes(mut self, max_header_bytes: usize) -> Self {
        self.max_header_bytes = max_header_bytes;
        self
    }

    #[must_use]
    pub fn state(&self) -> ParsingState {
        self.state
    }

    /// Bytes received but not yet consumed by a complete header block or body.
    #[must_use]
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    /// Feed one chunk and return every message it completes, in order.
    ///
    /// A body that is not valid JSON yields an `Err` in its slot and parsing
    /// goes on with the next frame. A framing error (bad or missing
    /// `Content-Length`, oversized header block) is pushed last: the
    /// offending header block is dropped and the unread bytes stay buffered.
    pub fn parse_message(&mut self, chunk: &[u8]) -> Vec<Result<serde_json::Value, FrameError>> {
        self.leftover.extend_from_slice(chunk);

        let mut reader = DataReader::new(&self.leftover);
        let mut messages = Vec::new();

        while reader.has_more_data() {
            match self.state {
                ParsingState::Headers => {
                    let pending = reader.remaining();
                    if !header_block_complete(pending, self.header_scanned) {
                        if pending.len() > self.max_header_bytes {
                            messages.push(Err(FrameError::HeadersTooLong {
                                length: pending.len(),
                                max: self.max_header_bytes,
                            }));
                            reader.take_remaining();
                            self.header_scanned = 0;
                        } else {
                            self.header_scanned = pending.len();
                        }
                        break;
                    }
                    self.header_scanned = 0;

                    let headers = reader.parse_headers();
                    debug_assert!(headers.is_complete);
                    if headers.content.len() > self.max_header_bytes {
                        messages.push(Err(FrameError::HeadersTooLong {
                            length: headers.content.len(),
                            max: self.max_header_bytes,
                        }));
                        break;
                    }

                    match self.content_length(headers.content) {
                        Ok(content_length) => {
                            self.state = ParsingState::Body { content_length };
                        }
                        Err(e) => {
                            messages.push(Err(e));
                            break;
                        }
                    }
                }
                ParsingState::Body { content_length } => {
                    if reader.remaining().len() < content_length {
                        break;
                    }

                    let body = reader.parse_content(content_length);
                    self.state = ParsingState::Headers;
                    messages.push(
                        serde_json::from_slice(body.content)
                            .map_err(|source| FrameError::Body { source }),
                    );
                }
            }
        }

        let consumed = reader.position();
        self.leftover.drain(..consumed);
        messages
    }

    fn content_length(&self, headers: &[u8]) -> Result<usize, FrameError> {
        let headers = String::from_utf8_lossy(headers);

        let value = headers
            .split("\r\n")
            .find_map(|line| {
                let prefix = line.get(..CONTENT_LENGTH_HEADER.len())?;
                prefix
                    .eq_ignore_ascii_case(CONTENT_LENGTH_HEADER)
                    .then(|| &line[CONTENT_LENGTH_HEADER.len()..])
            })
            .ok_or_else(|| FrameError::MissingContentLength {
                headers: headers.to_string(),
            })?;

        let length: usize = value
            .trim()
            .parse()
            .map_err(|_| FrameError::InvalidContentLength {
                value: value.trim().to_string(),
            })?;

        if length > self.max_frame_bytes {
            return Err(FrameError::Oversized {
                length,
                max: self.max_frame_bytes,
            });
        }

        Ok(length)
    }
}

/// Whether `pending` holds a whole header block. The terminator search
/// resumes just before `scanned`, so a slowly arriving block is searched
/// once overall.
fn header_block_complete(pending: &[u8], scanned: usize) -> bool {
    if pending.starts_with(b"\r\n") {
        return true;
    }
    let from = scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
    pending
        .get(from..)
        .is_some_and(|tail| tail.windows(HEADER_TERMINATOR.len()).any(|w| w == HEADER_TERMINATOR))
}

/// Serialize a message and prepend its LSP headers.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(message)?;
    let header = format!(
        "{CONTENT_TYPE_HEADER}\r\n{CONTENT_LENGTH_HEADER} {}\r\n\r\n",
        body.len()
    );

    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY_42: &str = r#"{"some":"json-payload-of-length-42-bytes"}"#;

    fn frame(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{body}", body.len())
    }

    fn feed_all(parser: &mut MessageParser, chunks: &[&[u8]]) -> Vec<serde_json::Value> {
        chunks
            .iter()
            .flat_map(|chunk| parser.parse_message(chunk))
            .map(|r| r.expect("frame should decode"))
            .collect()
    }

    fn expected_42() -> serde_json::Value {
        serde_json::json!({ "some": "json-payload-of-length-42-bytes" })
    }

    #[test]
    fn test_single_message() {
        let mut parser = MessageParser::new();
        let got = feed_all(&mut parser, &[frame(BODY_42).as_bytes()]);
        assert_eq!(got, vec![expected_42()]);
        assert_eq!(parser.state(), ParsingState::Headers);
        assert!(parser.leftover().is_empty());
    }

    #[test]
    fn test_two_messages_in_one_chunk() {
        let input = format!("{}{}", frame(BODY_42), frame(BODY_42));
        let mut parser = MessageParser::new();
        let got = feed_all(&mut parser, &[input.as_bytes()]);
        assert_eq!(got, vec![expected_42(), expected_42()]);
    }

    #[test]
    fn test_split_after_headers() {
        let mut parser = MessageParser::new();
        let first = parser.parse_message(b"Content-Length: 42\r\n\r\n");
        assert!(first.is_empty());
        assert_eq!(
            parser.state(),
            ParsingState::Body { content_length: 42 }
        );

        let got = feed_all(&mut parser, &[BODY_42.as_bytes()]);
        assert_eq!(got, vec![expected_42()]);
    }

    #[test]
    fn test_split_before_separator() {
        let second = format!("\r\n{BODY_42}");
        let mut parser = MessageParser::new();
        let got = feed_all(
            &mut parser,
            &[b"Content-Length: 42\r\n".as_slice(), second.as_bytes()],
        );
        assert_eq!(got, vec![expected_42()]);
    }

    #[test]
    fn test_split_inside_header_name() {
        let second = format!("Length: 42\r\n\r\n{BODY_42}");
        let mut parser = MessageParser::new();

        assert!(parser.parse_message(b"Content-").is_empty());
        assert_eq!(parser.leftover(), b"Content-");

        let got = feed_all(&mut parser, &[second.as_bytes()]);
        assert_eq!(got, vec![expected_42()]);
    }

    #[test]
    fn test_split_inside_body() {
        let mut parser = MessageParser::new();
        let first = "Content-Length: 42\r\n\r\n{\"some\":";
        assert!(parser.parse_message(first.as_bytes()).is_empty());
        assert_eq!(parser.leftover(), br#"{"some":"#);

        let got = feed_all(
            &mut parser,
            &[br#""json-payload-of-length-42-bytes"}"#.as_slice()],
        );
        assert_eq!(got, vec![expected_42()]);
    }

    #[test]
    fn test_every_split_point_yields_same_messages() {
        let bodies = [
            r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}"#,
            r#"{"jsonrpc":"2.0","method":"textDocument/publishDiagnostics","params":{"uri":"file:///a.yml","diagnostics":[]}}"#,
            r#"{"jsonrpc":"2.0","id":2,"result":null}"#,
        ];
        let stream: String = bodies.iter().map(|b| frame(b)).collect();
        let stream = stream.as_bytes();

        let mut whole = MessageParser::new();
        let expected = feed_all(&mut whole, &[stream]);
        assert_eq!(expected.len(), 3);

        for split in 0..=stream.len() {
            let mut parser = MessageParser::new();
            let got = feed_all(&mut parser, &[&stream[..split], &stream[split..]]);
            assert_eq!(got, expected, "split at {split}");
        }

        for first in (0..stream.len()).step_by(7) {
            for second in (first..stream.len()).step_by(11) {
                let mut parser = MessageParser::new();
                let got = feed_all(
                    &mut parser,
                    &[&stream[..first], &stream[first..second], &stream[second..]],
                );
                assert_eq!(got, expected, "splits at {first}/{second}");
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let input = format!("{}{}", frame(BODY_42), frame(r#"{"id":7}"#));
        let mut parser = MessageParser::new();
        let chunks: Vec<&[u8]> = input.as_bytes().chunks(1).collect();
        let got = feed_all(&mut parser, &chunks);
        assert_eq!(got, vec![expected_42(), serde_json::json!({ "id": 7 })]);
    }

    #[test]
    fn test_multibyte_body_split_mid_character() {
        let body = r#"{"k":"é"}"#;
        assert_eq!(body.len(), 10);
        let input = frame(body);
        let bytes = input.as_bytes();
        // Split between the two bytes of "é".
        let split = bytes.len() - 3;

        let mut parser = MessageParser::new();
        let got = feed_all(&mut parser, &[&bytes[..split], &bytes[split..]]);
        assert_eq!(got, vec![serde_json::json!({ "k": "é" })]);
    }

    #[test]
    fn test_case_insensitive_content_length_and_extra_headers() {
        let input = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: 42\r\n\r\n{BODY_42}"
        );
        let mut parser = MessageParser::new();
        let got = feed_all(&mut parser, &[input.as_bytes()]);
        assert_eq!(got, vec![expected_42()]);
    }

    #[test]
    fn test_missing_content_length_is_framing_error() {
        let mut parser = MessageParser::new();
        let results = parser.parse_message(b"Content-Type: application/json\r\n\r\n{}");
        assert_eq!(results.len(), 1);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(err, FrameError::MissingContentLength { .. }));
        assert!(err.is_fatal());
        assert_eq!(parser.state(), ParsingState::Headers);
        assert_eq!(parser.leftover(), b"{}");
    }

    #[test]
    fn test_invalid_content_length_value() {
        let mut parser = MessageParser::new();
        let results = parser.parse_message(b"Content-Length: not_a_number\r\n\r\n");
        assert!(matches!(
            results.as_slice(),
            [Err(FrameError::InvalidContentLength { value })] if value == "not_a_number"
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut parser = MessageParser::with_max_frame_bytes(16);
        let results = parser.parse_message(frame(BODY_42).as_bytes());
        assert!(matches!(
            results.as_slice(),
            [Err(FrameError::Oversized { length: 42, max: 16 })]
        ));
    }

    #[test]
    fn test_unterminated_headers_past_limit_are_rejected() {
        let mut parser = MessageParser::new().with_max_header_bytes(64);
        let filler = [b'a'; 40];

        assert!(parser.parse_message(&filler).is_empty());
        assert_eq!(parser.leftover().len(), 40);

        let results = parser.parse_message(&filler);
        assert!(matches!(
            results.as_slice(),
            [Err(FrameError::HeadersTooLong { length: 80, max: 64 })]
        ));
        assert!(results[0].as_ref().unwrap_err().is_fatal());
        assert!(parser.leftover().is_empty());
        assert_eq!(parser.state(), ParsingState::Headers);

        // A well-formed frame afterwards still decodes.
        let got = feed_all(&mut parser, &[frame(BODY_42).as_bytes()]);
        assert_eq!(got, vec![expected_42()]);
    }

    #[test]
    fn test_endless_header_line_stays_bounded() {
        let mut parser = MessageParser::new();
        let chunk = vec![b'a'; 1024];
        let mut errors = 0;
        for _ in 0..64 {
            errors += parser.parse_message(&chunk).len();
            assert!(parser.leftover().len() <= MAX_HEADER_BYTES);
        }
        assert!(errors > 0);
    }

    #[test]
    fn test_terminated_headers_past_limit_are_rejected() {
        let padding = "X".repeat(100);
        let input = format!("X-Padding: {padding}\r\nContent-Length: 2\r\n\r\n{{}}");
        let mut parser = MessageParser::new().with_max_header_bytes(64);
        let results = parser.parse_message(input.as_bytes());
        assert!(matches!(
            results.as_slice(),
            [Err(FrameError::HeadersTooLong { max: 64, .. })]
        ));
        assert_eq!(parser.leftover(), b"{}");
    }

    #[test]
    fn test_header_terminator_split_across_chunks() {
        let mut parser = MessageParser::new();
        assert!(parser.parse_message(b"Content-Length: 2\r\n\r").is_empty());
        assert_eq!(parser.state(), ParsingState::Headers);
        let got = feed_all(&mut parser, &[b"\n{}".as_slice()]);
        assert_eq!(got, vec![serde_json::json!({})]);
    }

    #[test]
    fn test_large_body_in_small_chunks() {
        let text = "x".repeat(1024 * 1024);
        let body = serde_json::to_string(&serde_json::json!({ "text": text })).unwrap();
        let input = frame(&body);
        let header_len = input.len() - body.len();

        let mut parser = MessageParser::new();
        let mut got = Vec::new();
        let mut fed = 0;
        for chunk in input.as_bytes().chunks(8 * 1024) {
            got.extend(parser.parse_message(chunk).into_iter().map(Result::unwrap));
            fed += chunk.len();
            if got.is_empty() && fed > header_len {
                // Only the unread part of the body is buffered.
                assert_eq!(parser.leftover().len(), fed - header_len);
            }
        }

        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["text"].as_str().map(str::len), Some(1024 * 1024));
        assert!(parser.leftover().is_empty());
    }

    #[test]
    fn test_invalid_json_body_does_not_stop_parsing() {
        let input = format!("{}{}", frame("not valid json!!!"), frame(BODY_42));
        let mut parser = MessageParser::new();
        let results = parser.parse_message(input.as_bytes());

        assert_eq!(results.len(), 2);
        let mut results = results.into_iter();
        let first = results.next().unwrap().unwrap_err();
        assert!(matches!(first, FrameError::Body { .. }));
        assert!(!first.is_fatal());
        assert_eq!(results.next().unwrap().unwrap(), expected_42());
        assert_eq!(parser.state(), ParsingState::Headers);
    }

    #[test]
    fn test_encode_frame_headers_and_byte_length() {
        let msg = serde_json::json!({ "k": "é" });
        let encoded = encode_frame(&msg).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        let body = serde_json::to_string(&msg).unwrap();

        assert_eq!(
            text,
            format!(
                "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            )
        );
    }

    #[test]
    fn test_encoded_frames_decode() {
        let first = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} });
        let second = serde_json::json!({ "jsonrpc": "2.0", "method": "initialized", "params": {} });
        let mut stream = encode_frame(&first).unwrap();
        stream.extend(encode_frame(&second).unwrap());

        let mut parser = MessageParser::new();
        let got = feed_all(&mut parser, &[stream.as_slice()]);
        assert_eq!(got, vec![first, second]);
    }
}
