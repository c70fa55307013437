//! Streaming RFC 5322 / MIME message parser
//!
//! The parser walks an arbitrary byte stream one logical line at a time and
//! produces a tree of MIME parts, decoding transfer encodings on the fly.
//! Bodies are never buffered: each leaf body is exposed to the caller as a
//! readable stream that ends precisely at the next multipart boundary.
//!
//! Structured header fields (addresses, dates, message identifiers) can be
//! collected through [`structured::StructuredMime`] from the root-header
//! callback.

#![warn(missing_docs)]
pub mod address;
pub mod body;
pub mod decode;
pub mod header;
mod line;
pub mod structured;

use header::{ContentDisposition, ContentType, HeaderMap};
pub use line::MAX_LINE_LEN;
use line::LineReader;
use std::io::Read;
use thiserror::Error as ThisError;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, warn};

pub(crate) const CR: u8 = b'\r';
pub(crate) const LF: u8 = b'\n';
const WSP: &[u8] = &[b' ', b'\t'];

/// The maximum number of MIME parts per message
pub const MAX_MIME_PARTS: usize = 99;
/// The maximum number of header lines per part
pub const MAX_HEADER_LINES: usize = 1000;

/// Header fields which carry at most one value; when producers repeat
/// them, the last value wins
const SINGLE_VALUE_FIELDS: &[&str] = &[
    "content-transfer-encoding",
    "content-id",
    "content-description",
    "content-language",
    "content-md5",
    "content-location",
    "content-type",
    "content-disposition",
];

/// The parser error
#[derive(Debug, ThisError)]
pub enum Error {
    /// A logical line exceeded the line length cap
    #[error("reached maximum read limit for a line")]
    MaxLineLength,
    /// A part header block exceeded the header line cap
    #[error("reached maximum limit for number of header lines")]
    MaxHeaderLines,
    /// The message exceeded the part count cap
    #[error("maximum MIME part count crossed")]
    MaxMimeParts,
    /// A multipart part lacks the mandatory boundary parameter
    #[error("multipart content without a boundary parameter")]
    NoBoundary,
    /// An unsupported `Content-Transfer-Encoding` was declared
    #[error("unhandled content-transfer-encoding {0:?}")]
    UnhandledEncoding(String),
    /// The stream ended in the middle of a bounded part body
    #[error("unexpected end of stream while reading a part body")]
    UnexpectedEof,
    /// A base64 body contained bytes outside the alphabet
    #[error("invalid base64 data in part body")]
    InvalidBase64,
    /// An atom was expected but not found (recoverable in lenient paths)
    #[error("empty atom")]
    EmptyAtom,
    /// An address list carried adjacent mailboxes with no separator
    #[error("expected comma in address list")]
    ExpectedComma,
    /// A malformed header construct
    #[error("{0}")]
    Header(String),
    /// Wrapper for [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html)
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Boxes the error into an [`std::io::Error`] for use inside `Read`
    /// chains; [`from_io`](Self::from_io) undoes this losslessly
    pub(crate) fn into_io(self) -> std::io::Error {
        let kind = match &self {
            Error::UnexpectedEof => std::io::ErrorKind::UnexpectedEof,
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, self)
    }

    /// Recovers a crate error carried through a `Read` chain
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        if e.get_ref().map(|r| r.is::<Error>()).unwrap_or(false) {
            *e.into_inner().unwrap().downcast::<Error>().unwrap()
        } else {
            Error::Io(e)
        }
    }
}

/// The values of the `Content-Transfer-Encoding` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    /// 7bit (the default)
    SevenBit,
    /// 8bit
    EightBit,
    /// binary
    Binary,
    /// quoted-printable
    QuotedPrintable,
    /// base64
    Base64,
}

impl TransferEncoding {
    /// Maps a header value to the encoding; anything unrecognized is fatal
    fn from_header(value: Option<&str>) -> Result<Self, Error> {
        let value = match value {
            None => return Ok(TransferEncoding::SevenBit),
            Some(v) => v,
        };
        Ok(match value.trim().to_ascii_lowercase().as_str() {
            "" | "7bit" => TransferEncoding::SevenBit,
            "8bit" => TransferEncoding::EightBit,
            "binary" => TransferEncoding::Binary,
            "quoted-printable" => TransferEncoding::QuotedPrintable,
            "base64" => TransferEncoding::Base64,
            other => return Err(Error::UnhandledEncoding(other.to_string())),
        })
    }

    /// Whether the encoding transforms the body at all
    pub fn is_identity(&self) -> bool {
        !matches!(
            self,
            TransferEncoding::QuotedPrintable | TransferEncoding::Base64
        )
    }
}

/// A MIME part
///
/// Can be the whole message or a portion of it in case the mail has
/// `Content-Type` set to `multipart/*`
#[derive(Debug, Clone, Default)]
pub struct Part {
    /// Unfolded header values keyed by their lowercased names
    pub headers: HeaderMap,
    /// Values whose keys failed the validity test; kept apart but kept
    pub bad_headers: HeaderMap,
    /// The parsed `Content-Type` (`text/plain` when absent)
    pub content_type: ContentType,
    /// The parsed `Content-Disposition`, if present
    pub content_disposition: Option<ContentDisposition>,
    /// The multipart subtype (e.g. `mixed`); empty for leaves
    pub multipart: String,
    /// The multipart boundary; empty for leaves
    pub boundary: String,
    /// Child parts, in document order; `None` for childless parts
    pub children: Option<Vec<Part>>,
    /// Decoded body bytes streamed out of this part
    pub size: u64,
}

impl Part {
    /// Returns whether the part is multipart
    pub fn is_multipart(&self) -> bool {
        !self.boundary.is_empty()
    }

    /// Returns whether the part is declared as containing text
    pub fn is_text(&self) -> bool {
        self.content_type.ctype == "text"
    }

    /// Returns the part charset (as set in the `Content-Type` header)
    /// if the part contains text, `None` otherwise
    pub fn charset(&self) -> Option<&str> {
        if self.is_text() {
            Some(self.content_type.get_param("charset").unwrap_or("us-ascii"))
        } else {
            None
        }
    }

    /// Indicates if the part is inline or attached
    pub fn is_inline(&self) -> bool {
        self.content_disposition
            .as_ref()
            .map(|cd| cd.media_type != "attachment")
            .unwrap_or(true)
    }

    /// Returns the value of the `Content-Transfer-Encoding` header
    pub fn content_transfer_encoding(&self) -> Option<&str> {
        self.headers.last("content-transfer-encoding")
    }

    /// Returns the encoding of the part as set in the
    /// `Content-Transfer-Encoding` header
    pub fn transfer_encoding(&self) -> Result<TransferEncoding, Error> {
        TransferEncoding::from_header(self.content_transfer_encoding())
    }

    /// Returns the name of the part, in MUA preference order: the
    /// disposition `filename` wins over the content-type `name`
    pub fn filename(&self) -> Option<&str> {
        self.content_disposition
            .as_ref()
            .and_then(|cd| cd.get_param("filename"))
            .or_else(|| self.content_type.get_param("name"))
    }
}

/// The decoded body stream handed to the body callback
///
/// Reading from it drains the underlying part body (transfer decoding
/// applied) and accounts the bytes into the part [`size`](Part::size)
pub struct PartBody<'a, R: Read> {
    part: &'a mut Part,
    reader: decode::DecodingReader<body::BodyReader<'a, R>>,
}

impl<R: Read> PartBody<'_, R> {
    /// The part whose body is being streamed
    pub fn part(&self) -> &Part {
        self.part
    }
}

impl<R: Read> Read for PartBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        let n = self.reader.read(buf)?;
        self.part.size += n as u64;
        Ok(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Body,
}

/// One arena slot: a part under construction plus its transient state
struct Node {
    part: Part,
    parent: usize,
    children: Vec<usize>,
    state: State,
    lines: Vec<Vec<u8>>,
    parent_boundary: String,
    body_done: bool,
}

/// The MIME tree parser
///
/// Drives a line-oriented state machine over the input and materializes one
/// [`Part`] per MIME entity; parts live in an arena indexed by handle until
/// [`parse`](Self::parse) reassembles them into an owned tree
pub struct MimeTree<R: Read> {
    r: LineReader<R>,
    nodes: Vec<Node>,
    current: usize,
    node_count: usize,
    root_done: bool,
}

/// Checks a line (terminator already stripped) against a boundary
/// delimiter, opening or closing
fn is_delim(content: &[u8], boundary: &str, closing: bool) -> bool {
    let blen = boundary.len();
    let want = blen + if closing { 4 } else { 2 };
    content.len() == want
        && content.starts_with(b"--")
        && &content[2..(blen + 2)] == boundary.as_bytes()
        && (!closing || content.ends_with(b"--"))
}

impl<R: Read> MimeTree<R> {
    /// Creates a parser over `source`
    pub fn new(source: R) -> Self {
        let root = Node {
            part: Part::default(),
            parent: 0,
            children: Vec::new(),
            state: State::Body,
            lines: Vec::new(),
            parent_boundary: String::new(),
            body_done: false,
        };
        let mut tree = Self {
            r: LineReader::new(source),
            nodes: vec![root],
            current: 0,
            node_count: 0,
            root_done: false,
        };
        // The transient root holds the actual message as its only child
        tree.current = tree.create_node(0);
        tree
    }

    fn create_node(&mut self, parent: usize) -> usize {
        self.node_count += 1;
        let id = self.nodes.len();
        let parent_boundary = self.nodes[parent].part.boundary.clone();
        self.nodes.push(Node {
            part: Part::default(),
            parent,
            children: Vec::new(),
            state: State::Header,
            lines: Vec::new(),
            parent_boundary,
            body_done: false,
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Consumes the source to EOF and returns the outermost part
    ///
    /// `body_cb` is invoked once per leaf body with a [`PartBody`] it is
    /// expected to drain; `root_header_cb` is invoked once, right after the
    /// outermost part's headers have been processed. An error returned from
    /// either aborts the parse and discards all state.
    #[instrument(skip_all)]
    pub fn parse<B, H>(mut self, mut body_cb: B, mut root_header_cb: H) -> Result<Part, Error>
    where
        B: FnMut(&mut PartBody<'_, R>) -> Result<(), Error>,
        H: FnMut(&Part) -> Result<(), Error>,
    {
        loop {
            let (line, eol) = {
                let (line, eol) = self.r.read_line()?;
                (line.to_vec(), eol)
            };
            if line.is_empty() {
                break;
            }
            let content_len = line.len() - eol.as_bytes().len();
            match self.nodes[self.current].state {
                State::Header => {
                    if content_len == 0 {
                        // End of the header section, start of the body
                        self.process_header()?;
                        self.process_content_type()?;
                        if self.nodes[self.current].parent == 0 && !self.root_done {
                            self.root_done = true;
                            root_header_cb(&self.nodes[self.current].part)?;
                        }
                        self.nodes[self.current].state = State::Body;
                    } else {
                        let node = &mut self.nodes[self.current];
                        if node.lines.len() >= MAX_HEADER_LINES {
                            return Err(Error::MaxHeaderLines);
                        }
                        node.lines.push(line[0..content_len].to_vec());
                    }
                }
                State::Body => {
                    let content = &line[0..content_len];
                    let node = &self.nodes[self.current];
                    let parent_boundary = node.parent_boundary.clone();
                    let own_boundary = node.part.boundary.clone();
                    if !parent_boundary.is_empty() && is_delim(content, &parent_boundary, false) {
                        // A sibling part begins
                        debug!("Part ends (sibling begins)");
                        let parent = self.nodes[self.current].parent;
                        self.current = self.create_node(parent);
                    } else if !parent_boundary.is_empty()
                        && is_delim(content, &parent_boundary, true)
                    {
                        // The enclosing multipart is complete
                        debug!("Parent ends (closing boundary)");
                        self.current = self.nodes[self.current].parent;
                    } else if !own_boundary.is_empty() && is_delim(content, &own_boundary, false) {
                        // The first child of this multipart begins
                        debug!("Child part begins");
                        self.current = self.create_node(self.current);
                    } else if !own_boundary.is_empty() && is_delim(content, &own_boundary, true) {
                        // Closing delimiter of a childless multipart
                        debug!("Multipart closes empty");
                        self.nodes[self.current].body_done = true;
                    } else {
                        self.stream_body(line, &mut body_cb)?;
                    }
                }
            }
            if self.node_count > MAX_MIME_PARTS {
                return Err(Error::MaxMimeParts);
            }
        }
        self.finalize(&mut root_header_cb)
    }

    /// Streams the current part body (starting with the already-read
    /// `head` line) through the decoder chain and the body callback
    fn stream_body<B>(&mut self, head: Vec<u8>, body_cb: &mut B) -> Result<(), Error>
    where
        B: FnMut(&mut PartBody<'_, R>) -> Result<(), Error>,
    {
        let Self {
            r, nodes, current, ..
        } = self;
        let node = &mut nodes[*current];
        let is_multipart = !node.part.boundary.is_empty();
        // Preambles stop at the own boundary, everything else at the
        // enclosing one; a top-level body runs to EOF
        let boundary = if is_multipart && node.children.is_empty() && !node.body_done {
            Some(node.part.boundary.clone())
        } else if !node.parent_boundary.is_empty() {
            Some(node.parent_boundary.clone())
        } else {
            None
        };
        let enc = TransferEncoding::from_header(node.part.headers.last("content-transfer-encoding"))?;
        let body = body::BodyReader::new(r, boundary.as_deref(), head);
        let reader = match enc {
            TransferEncoding::QuotedPrintable => decode::DecodingReader::quoted_printable(body),
            TransferEncoding::Base64 => decode::DecodingReader::base64(body),
            _ => decode::DecodingReader::identity(body),
        };
        let mut scratch = [0u8; 4096];
        if is_multipart {
            // Multipart preamble or epilogue: no leaf body, nothing to
            // deliver; drained so the walker lands on the next boundary
            let mut reader = reader;
            loop {
                match reader.read(&mut scratch) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => return Err(Error::from_io(e)),
                }
            }
        } else {
            let first = !node.body_done;
            node.body_done = true;
            let mut part_body = PartBody {
                part: &mut node.part,
                reader,
            };
            if first {
                body_cb(&mut part_body)?;
            }
            // The callback is expected to drain; make sure of it before
            // line reads resume
            loop {
                match part_body.read(&mut scratch) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => return Err(Error::from_io(e)),
                }
            }
        }
        Ok(())
    }

    /// Ingests the accumulated raw header lines into the current part
    fn process_header(&mut self) -> Result<(), Error> {
        let node = &mut self.nodes[self.current];
        let mut lines = std::mem::take(&mut node.lines);

        // Unfold in reverse: each folded line is glued to its predecessor
        let mut i = lines.len();
        while i > 1 {
            i -= 1;
            if WSP.contains(lines[i].first().unwrap_or(&0)) {
                let folded = lines.remove(i);
                let prev = &mut lines[i - 1];
                prev.extend_from_slice(b"\r\n");
                prev.extend_from_slice(&folded);
            }
        }

        for raw in &lines {
            let (key_raw, value_raw) = match raw.iter().position(|&b| b == b':') {
                Some(pos) => (&raw[0..pos], &raw[(pos + 1)..]),
                None => (raw.as_slice(), &raw[raw.len()..]),
            };
            let key = String::from_utf8_lossy(key_raw).trim().to_lowercase();
            let value = header::collapse_folds(value_raw);
            if header::is_valid_key(&key) {
                node.part.headers.append(&key, value);
            } else {
                debug!("Odd header key {:?}", key);
                node.part.bad_headers.append(&key, value);
            }
        }

        // Make sure Content-Type is always there
        if !node.part.headers.contains("content-type") {
            node.part
                .headers
                .append("content-type", "text/plain".to_string());
        }

        for key in SINGLE_VALUE_FIELDS {
            node.part.headers.keep_last(key);
        }

        if let Some(value) = node.part.headers.last("content-disposition") {
            let cd = header::parse_content_disposition(value)?;
            if cd.media_type != "inline" && cd.media_type != "attachment" {
                return Err(Error::Header(format!(
                    "invalid content-disposition {:?}",
                    cd.media_type
                )));
            }
            node.part.content_disposition = Some(cd);
        }
        Ok(())
    }

    /// Parses the current part `Content-Type` and primes the multipart
    /// boundary
    fn process_content_type(&mut self) -> Result<(), Error> {
        let node = &mut self.nodes[self.current];
        let value = match node.part.headers.last("content-type") {
            Some(v) => v.to_string(),
            None => return Ok(()),
        };
        let ct = header::parse_content_type(&value)?;
        if ct.ctype == "multipart" {
            match ct.get_param("boundary") {
                Some(bound) if !bound.is_empty() => {
                    node.part.multipart = ct.subtype.clone();
                    node.part.boundary = bound.to_string();
                }
                _ => return Err(Error::NoBoundary),
            }
        }
        node.part.content_type = ct;
        Ok(())
    }

    /// Completes a possibly truncated parse and reassembles the arena into
    /// an owned tree, clearing all transient state
    fn finalize<H>(mut self, root_header_cb: &mut H) -> Result<Part, Error>
    where
        H: FnMut(&Part) -> Result<(), Error>,
    {
        if self.nodes[self.current].state == State::Header {
            // The stream ended inside a header block; the tree is
            // completed all the same
            self.process_header()?;
            self.process_content_type()?;
            if self.nodes[self.current].parent == 0 && !self.root_done {
                self.root_done = true;
                root_header_cb(&self.nodes[self.current].part)?;
            }
        }

        // Children always carry higher ids than their parent, so a single
        // reverse sweep moves every part under its parent in order
        let mut slots: Vec<Option<Node>> = self.nodes.into_iter().map(Some).collect();
        for id in (1..slots.len()).rev() {
            let node = slots[id].take().unwrap();
            let parent = slots[node.parent].as_mut().unwrap();
            parent
                .part
                .children
                .get_or_insert_with(Vec::new)
                .insert(0, node.part);
        }
        let root = slots[0].take().unwrap();
        let mut outer = root.part.children.unwrap_or_default();
        Ok(outer.remove(0))
    }
}

/// Parses a complete message from `source`
///
/// Convenience wrapper around [`MimeTree::new`] + [`MimeTree::parse`]
pub fn parse<R, B, H>(source: R, body_cb: B, root_header_cb: H) -> Result<Part, Error>
where
    R: Read,
    B: FnMut(&mut PartBody<'_, R>) -> Result<(), Error>,
    H: FnMut(&Part) -> Result<(), Error>,
{
    MimeTree::new(source).parse(body_cb, root_header_cb)
}
