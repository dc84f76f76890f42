//! draw.io (mxGraph) diagram parser
//!
//! Reads an `mxfile` document and yields one [`Element`] per styled cell,
//! lazily, as the document is read:
//!
//! ```text
//! <mxfile>
//!   <diagram id="..." name="Page-1">
//!     <mxGraphModel>
//!       <root>
//!         <mxCell id="3" style="shape=mxgraph.electrical.resistors.resistor_1;" .../>
//!         <mxCell id="7" style="endArrow=none;exitX=1;..." source="3" target="6" .../>
//!       </root>
//!     </mxGraphModel>
//!   </diagram>
//! </mxfile>
//! ```
//!
//! Only the first `diagram` page is read. Cells without a style are
//! structural (the layer and background cells draw.io always writes) and
//! are skipped.

use std::borrow::Cow;
use std::io::BufRead;

use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::schema::{Diagram, Element, Link, Terminal};
use super::style::decode_style;

const DIAGRAM: &[u8] = b"diagram";
const GRAPH_MODEL: &[u8] = b"mxGraphModel";
const ROOT: &[u8] = b"root";
const CELL: &[u8] = b"mxCell";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("no diagram id in document")]
    MissingDiagramId,
    #[error("malformed document at byte {position}: {message}")]
    Xml { position: u64, message: String },
    #[error("invalid cell reference {value:?}: expected a non-negative integer")]
    InvalidCellId { value: String },
    #[error("document truncated inside <{open}>")]
    Truncated { open: String },
    #[error("failed to read document: {message}")]
    Read { message: String },
}

/// Parser knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserOptions {
    /// Accept a document that stops after the cell list was fully read
    /// but before its enclosing elements were closed.
    pub tolerate_truncated_tail: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            tolerate_truncated_tail: true,
        }
    }
}

/// Entry point: wraps a reader and locates the diagram header.
pub struct DiagramParser<R: BufRead> {
    reader: Reader<R>,
    options: ParserOptions,
}

impl<'a> DiagramParser<&'a [u8]> {
    pub fn from_str(document: &'a str) -> Self {
        Self::new(document.as_bytes())
    }
}

impl<R: BufRead> DiagramParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Reader::from_reader(reader),
            options: ParserOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ParserOptions) -> Self {
        self.options = options;
        self
    }

    /// Read up to the `<diagram>` element and return the element stream.
    ///
    /// Fails with [`ParseError::MissingDiagramId`] before any element is
    /// produced when the document has no diagram or the id is empty.
    pub fn open(mut self) -> Result<ElementStream<R>, ParseError> {
        let mut buf = Vec::new();
        let mut stack: Vec<Vec<u8>> = Vec::new();

        loop {
            let event = self
                .reader
                .read_event_into(&mut buf)
                .map_err(|e| xml_error(&self.reader, e))?;

            match event {
                Event::Start(e) => {
                    if e.name().as_ref() == DIAGRAM {
                        let (uuid, name) = diagram_header(&e)?;
                        let diagram_depth = stack.len();
                        stack.push(DIAGRAM.to_vec());
                        debug!(diagram = %uuid, name = %name, "diagram header found");
                        return Ok(ElementStream::new(
                            self.reader,
                            self.options,
                            uuid,
                            name,
                            stack,
                            diagram_depth,
                            false,
                        ));
                    }
                    stack.push(e.name().as_ref().to_vec());
                }
                Event::Empty(e) if e.name().as_ref() == DIAGRAM => {
                    let (uuid, name) = diagram_header(&e)?;
                    let diagram_depth = stack.len();
                    debug!(diagram = %uuid, "diagram has no content");
                    return Ok(ElementStream::new(
                        self.reader,
                        self.options,
                        uuid,
                        name,
                        stack,
                        diagram_depth,
                        true,
                    ));
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Eof => return Err(ParseError::MissingDiagramId),
                _ => {}
            }
            buf.clear();
        }
    }
}

/// Lazy, single-pass sequence of elements of one diagram.
///
/// After an error has been yielded the stream is exhausted.
pub struct ElementStream<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    options: ParserOptions,
    uuid: String,
    name: String,
    /// Names of the currently open elements, outermost first.
    stack: Vec<Vec<u8>>,
    /// Index of the `diagram` element in `stack`.
    diagram_depth: usize,
    diagram_closed: bool,
    cells_closed: bool,
    done: bool,
    skipped: usize,
    yielded: usize,
}

impl<R: BufRead> ElementStream<R> {
    fn new(
        reader: Reader<R>,
        options: ParserOptions,
        uuid: String,
        name: String,
        stack: Vec<Vec<u8>>,
        diagram_depth: usize,
        diagram_closed: bool,
    ) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            options,
            uuid,
            name,
            stack,
            diagram_depth,
            diagram_closed,
            cells_closed: diagram_closed,
            done: false,
            skipped: 0,
            yielded: 0,
        }
    }

    /// The diagram identifier every element carries.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The diagram page name (may be empty).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of structural cells skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Number of elements yielded so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    fn at_cell_level(&self) -> bool {
        let d = self.diagram_depth;
        !self.diagram_closed
            && self.stack.len() == d + 3
            && self.stack[d + 1] == GRAPH_MODEL
            && self.stack[d + 2] == ROOT
    }

    fn fail(&mut self, error: ParseError) -> Option<Result<Element, ParseError>> {
        self.done = true;
        warn!(diagram = %self.uuid, error = %error, "diagram parsing aborted");
        Some(Err(error))
    }

    fn cell(&mut self, start: &BytesStart<'_>) -> Result<Option<Element>, ParseError> {
        let raw = RawCell::from_start(start, &self.reader)?;
        match raw.into_element(&self.uuid)? {
            Some(element) => {
                self.yielded += 1;
                Ok(Some(element))
            }
            None => {
                self.skipped += 1;
                Ok(None)
            }
        }
    }
}

impl<R: BufRead> Iterator for ElementStream<R> {
    type Item = Result<Element, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            self.buf.clear();
            let read = self
                .reader
                .read_event_into(&mut self.buf)
                .map(Event::into_owned);
            let event = match read {
                Ok(event) => event,
                Err(e) => {
                    let error = xml_error(&self.reader, e);
                    return self.fail(error);
                }
            };

            match event {
                Event::Start(e) => {
                    let found = if self.at_cell_level() && e.name().as_ref() == CELL {
                        match self.cell(&e) {
                            Ok(found) => found,
                            Err(error) => return self.fail(error),
                        }
                    } else {
                        None
                    };
                    self.stack.push(e.name().as_ref().to_vec());
                    if found.is_some() {
                        return found.map(Ok);
                    }
                }
                Event::Empty(e) => {
                    if self.at_cell_level() && e.name().as_ref() == CELL {
                        match self.cell(&e) {
                            Ok(Some(element)) => return Some(Ok(element)),
                            Ok(None) => {}
                            Err(error) => return self.fail(error),
                        }
                    }
                }
                Event::End(_) => {
                    let closed = self.stack.pop();
                    let depth = self.stack.len();
                    if depth == self.diagram_depth + 2 && closed.as_deref() == Some(ROOT) {
                        self.cells_closed = true;
                    }
                    if depth == self.diagram_depth && closed.as_deref() == Some(DIAGRAM) {
                        if !self.diagram_closed {
                            debug!(
                                diagram = %self.uuid,
                                elements = self.yielded,
                                skipped = self.skipped,
                                "diagram fully read"
                            );
                        }
                        self.diagram_closed = true;
                        self.cells_closed = true;
                    }
                }
                Event::Eof => {
                    self.done = true;
                    let Some(open) = self.stack.last() else {
                        return None;
                    };
                    let open = String::from_utf8_lossy(open).into_owned();
                    if self.cells_closed && self.options.tolerate_truncated_tail {
                        warn!(diagram = %self.uuid, open = %open, "document ends early after complete cell list; accepting");
                        return None;
                    }
                    return self.fail(ParseError::Truncated { open });
                }
                _ => {}
            }
        }
    }
}

impl Diagram {
    /// Parse a whole document eagerly.
    pub fn parse(body: &str, options: ParserOptions) -> Result<Diagram, ParseError> {
        let stream = DiagramParser::from_str(body).with_options(options).open()?;
        let uuid = stream.uuid().to_string();
        let name = stream.name().to_string();
        let elements = stream.collect::<Result<Vec<_>, _>>()?;

        Ok(Diagram {
            uuid,
            name,
            body: body.to_string(),
            elements,
            versions: Vec::new(),
        })
    }
}

/// Attributes of one `mxCell`, before interpretation.
#[derive(Debug, Default)]
struct RawCell {
    id: String,
    value: String,
    style: String,
    source: Option<String>,
    target: Option<String>,
}

impl RawCell {
    fn from_start<R>(start: &BytesStart<'_>, reader: &Reader<R>) -> Result<Self, ParseError> {
        let mut cell = RawCell::default();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| ParseError::Xml {
                position: reader.buffer_position() as u64,
                message: e.to_string(),
            })?;
            let value = attribute_text(&attr.value);
            match attr.key.as_ref() {
                b"id" => cell.id = value,
                b"value" => cell.value = value,
                b"style" => cell.style = value,
                b"source" => cell.source = present(value),
                b"target" => cell.target = present(value),
                _ => {}
            }
        }
        Ok(cell)
    }

    fn into_element(self, uuid: &str) -> Result<Option<Element>, ParseError> {
        let style = decode_style(&self.style);
        if style.is_empty() {
            debug!(diagram = %uuid, cell = %self.id, "skipping cell without style");
            return Ok(None);
        }

        let id = parse_cell_id(&self.id)?;

        if style.contains("endArrow") {
            let link = Link {
                source_id: self.source.as_deref().map(parse_cell_id).transpose()?,
                target_id: self.target.as_deref().map(parse_cell_id).transpose()?,
                exit: Terminal::new(style.float_or_zero("exitX"), style.float_or_zero("exitY")),
                entry: Terminal::new(style.float_or_zero("entryX"), style.float_or_zero("entryY")),
            };
            return Ok(Some(Element::connection(uuid, id, self.value, link)));
        }

        let (kind, sub_kind) = match style.get("shape") {
            Some(shape) => shape_category(shape),
            None => (String::new(), String::new()),
        };
        Ok(Some(Element::component(uuid, id, kind, sub_kind, self.value)))
    }
}

/// Split `mxgraph.electrical.<kind>.<subkind>` into its last two segments.
pub fn shape_category(shape: &str) -> (String, String) {
    let mut segments = shape.rsplit('.');
    let sub_kind = segments.next().unwrap_or_default().to_string();
    let kind = segments.next().unwrap_or_default().to_string();
    (kind, sub_kind)
}

/// A blank reference means the end is not attached.
fn present(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

fn parse_cell_id(value: &str) -> Result<u32, ParseError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ParseError::InvalidCellId {
            value: value.to_string(),
        })
}

fn diagram_header(start: &BytesStart<'_>) -> Result<(String, String), ParseError> {
    let mut uuid = String::new();
    let mut name = String::new();
    for attr in start.attributes().flatten() {
        match attr.key.as_ref() {
            b"id" => uuid = attribute_text(&attr.value),
            b"name" => name = attribute_text(&attr.value),
            _ => {}
        }
    }
    if uuid.trim().is_empty() {
        return Err(ParseError::MissingDiagramId);
    }
    Ok((uuid, name))
}

fn attribute_text(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    unescape(&text)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| text.to_string())
}

fn xml_error<R>(reader: &Reader<R>, error: quick_xml::Error) -> ParseError {
    ParseError::Xml {
        position: reader.error_position() as u64,
        message: error.to_string(),
    }
}
