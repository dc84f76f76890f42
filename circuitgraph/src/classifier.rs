//! Element Classifier
//!
//! Decides whether an element is a component (committed as a vertex) or a
//! connection (committed as an edge). Anything outside the fixed category
//! whitelist is rejected and must never reach a committer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parser::schema::{Element, CONNECTION_KIND};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ClassifyError {
    #[error("element {id}: category {kind:?} is not supported")]
    UnsupportedCategory { id: u32, kind: String },
}

/// Recognized element categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Resistors,
    Capacitors,
    Inductors,
    /// Wires between components.
    Lines,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Resistors,
        Category::Capacitors,
        Category::Inductors,
        Category::Lines,
    ];

    /// The shape-library name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Resistors => "resistors",
            Category::Capacitors => "capacitors",
            Category::Inductors => "inductors",
            Category::Lines => CONNECTION_KIND,
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == kind)
    }

    pub fn is_component(&self) -> bool {
        !matches!(self, Category::Lines)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Category::Resistors => "Resistor shapes (mxgraph.electrical.resistors.*)",
            Category::Capacitors => "Capacitor shapes (mxgraph.electrical.capacitors.*)",
            Category::Inductors => "Inductor and transformer shapes (mxgraph.electrical.inductors.*)",
            Category::Lines => "Connectors between shapes (any cell styled with endArrow)",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless whitelist classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the element's category.
    ///
    /// A shape whose library happens to be named `lines` but that carries
    /// no connector data is rejected.
    pub fn category(&self, element: &Element) -> Result<Category, ClassifyError> {
        match Category::from_kind(&element.kind) {
            Some(Category::Lines) if !element.is_connection() => Err(unsupported(element)),
            Some(category) => Ok(category),
            None => Err(unsupported(element)),
        }
    }

    /// `Ok(true)` for components, `Ok(false)` for connections.
    pub fn classify(&self, element: &Element) -> Result<bool, ClassifyError> {
        self.category(element).map(|c| c.is_component())
    }
}

fn unsupported(element: &Element) -> ClassifyError {
    ClassifyError::UnsupportedCategory {
        id: element.id,
        kind: element.kind.clone(),
    }
}
