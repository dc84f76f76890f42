//! Diagram data model
//!
//! Types produced by the draw.io parser and carried through the commit
//! pipeline. An [`Element`] is created once from a raw cell and then moved
//! downstream; the only mutation it ever sees is the single error
//! attachment made after a failed classification or commit.

use serde::{Deserialize, Serialize};

use crate::classifier::ClassifyError;
use crate::store::StoreError;

/// Category assigned to every connector cell.
pub const CONNECTION_KIND: &str = "lines";
/// Variant assigned to every connector cell.
pub const CONNECTION_SUB_KIND: &str = "line";

/// Relative position of a connector end on its shape (0.0..=1.0 per axis).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Terminal {
    pub x: f32,
    pub y: f32,
}

impl Terminal {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Connector-only data: which cells the wire joins and where it attaches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Local id of the cell the wire leaves from, if attached.
    pub source_id: Option<u32>,
    /// Local id of the cell the wire enters, if attached.
    pub target_id: Option<u32>,
    /// Offset on the source shape (`exitX` / `exitY`).
    pub exit: Terminal,
    /// Offset on the target shape (`entryX` / `entryY`).
    pub entry: Terminal,
}

/// Error attached to an element that did not make it into the store.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
pub enum ElementError {
    #[error(transparent)]
    Unsupported(#[from] ClassifyError),
    #[error("commit failed: {0}")]
    Commit(#[from] StoreError),
}

/// One parsed diagram construct: a component or a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Element {
    /// Identifier of the diagram this element belongs to.
    pub uuid: String,
    /// Cell-local id, unique within the diagram.
    pub id: u32,
    /// Category, e.g. `resistors` or `lines`.
    pub kind: String,
    /// Variant within the category, e.g. `resistor_1`.
    pub sub_kind: String,
    /// Free-text label of the cell.
    pub value: String,
    /// Present for connectors only.
    pub link: Option<Link>,
    error: Option<ElementError>,
}

impl Element {
    pub fn component(
        uuid: impl Into<String>,
        id: u32,
        kind: impl Into<String>,
        sub_kind: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            id,
            kind: kind.into(),
            sub_kind: sub_kind.into(),
            value: value.into(),
            link: None,
            error: None,
        }
    }

    pub fn connection(uuid: impl Into<String>, id: u32, value: impl Into<String>, link: Link) -> Self {
        Self {
            uuid: uuid.into(),
            id,
            kind: CONNECTION_KIND.to_string(),
            sub_kind: CONNECTION_SUB_KIND.to_string(),
            value: value.into(),
            link: Some(link),
            error: None,
        }
    }

    pub fn is_connection(&self) -> bool {
        self.link.is_some()
    }

    pub fn error(&self) -> Option<&ElementError> {
        self.error.as_ref()
    }

    /// Attach the failure for this element. Only the first attachment sticks.
    pub fn attach_error(&mut self, error: impl Into<ElementError>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    pub fn source_id(&self) -> Option<u32> {
        self.link.as_ref().and_then(|l| l.source_id)
    }

    pub fn target_id(&self) -> Option<u32> {
        self.link.as_ref().and_then(|l| l.target_id)
    }
}

/// A stored revision of a diagram body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramVersion {
    pub version: String,
    pub metadata: String,
}

/// A fully parsed diagram.
#[derive(Debug, Clone, Serialize)]
pub struct Diagram {
    pub uuid: String,
    pub name: String,
    /// The document the diagram was parsed from.
    #[serde(skip)]
    pub body: String,
    pub elements: Vec<Element>,
    pub versions: Vec<DiagramVersion>,
}

impl Diagram {
    pub fn components(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| !e.is_connection())
    }

    pub fn connections(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| e.is_connection())
    }

    pub fn element(&self, id: u32) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }
}
