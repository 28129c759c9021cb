//! Cursor over a buffered slice of LSP wire data.
//!
//! [`DataReader`] hands out one header block or one fixed-size body slice
//! at a time and reports whether the piece was complete. It never copies:
//! every [`Extraction`] borrows from the slice the reader was built over,
//! so the caller decides what to keep for the next chunk.

/// Line terminator for LSP header lines.
pub(crate) const HEADER_LINE_SEPARATOR: &[u8] = b"\r\n";

/// A piece of data taken out of a [`DataReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extraction<'a> {
    /// Whether the requested piece was fully available.
    pub is_complete: bool,
    /// What was consumed. For an incomplete extraction this is everything
    /// that was left in the reader.
    pub content: &'a [u8],
}

/// Reads header blocks and bodies out of a single buffer, advancing an
/// internal cursor as data is consumed.
#[derive(Debug)]
pub struct DataReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DataReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Whether any unconsumed data remains.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.pos < self.data.len()
    }

    /// Unconsumed data, without consuming it.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Number of bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Consume header lines up to and including the blank separator line.
    ///
    /// On success the content holds every header line with its CRLF, but not
    /// the separator. If the data runs out first, the content is everything
    /// consumed (possibly ending mid-line) and the reader is left empty.
    pub fn parse_headers(&mut self) -> Extraction<'a> {
        let start = self.pos;

        while self.has_more_data() {
            let line_start = self.pos;
            let line = self.next_line();
            if line == HEADER_LINE_SEPARATOR {
                return Extraction {
                    is_complete: true,
                    content: &self.data[start..line_start],
                };
            }
        }

        Extraction {
            is_complete: false,
            content: &self.data[start..],
        }
    }

    /// Consume exactly `length` bytes, or everything left if fewer are
    /// available.
    pub fn parse_content(&mut self, length: usize) -> Extraction<'a> {
        let remaining = self.remaining();
        let take = length.min(remaining.len());
        let content = &remaining[..take];
        self.pos += take;

        Extraction {
            is_complete: take == length,
            content,
        }
    }

    /// Consume everything that is left.
    pub fn take_remaining(&mut self) -> &'a [u8] {
        let remaining = self.remaining();
        self.pos = self.data.len();
        remaining
    }

    /// Next line including its terminator, or the unterminated tail.
    fn next_line(&mut self) -> &'a [u8] {
        let remaining = self.remaining();
        let end = remaining
            .windows(HEADER_LINE_SEPARATOR.len())
            .position(|w| w == HEADER_LINE_SEPARATOR)
            .map_or(remaining.len(), |idx| idx + HEADER_LINE_SEPARATOR.len());
        self.pos += end;
        &remaining[..end]
    }
}
