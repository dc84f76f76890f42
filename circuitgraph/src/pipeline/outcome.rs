//! Per-element pipeline results.

use serde::Serialize;

use crate::parser::schema::{Element, ElementError};
use crate::store::StoreId;

/// Final state of one element after the pipeline handled it.
///
/// A success carries the identity the store assigned; a failure carries
/// the error attached to the element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub element: Element,
    pub store_id: Option<StoreId>,
}

impl Outcome {
    pub(crate) fn committed(element: Element, store_id: StoreId) -> Self {
        Self {
            element,
            store_id: Some(store_id),
        }
    }

    pub(crate) fn failed(mut element: Element, error: impl Into<ElementError>) -> Self {
        element.attach_error(error);
        Self {
            element,
            store_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.element.error().is_none()
    }

    pub fn error(&self) -> Option<&ElementError> {
        self.element.error()
    }

    pub fn is_connection(&self) -> bool {
        self.element.is_connection()
    }
}
