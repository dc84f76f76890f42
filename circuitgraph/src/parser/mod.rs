pub mod drawio;
pub mod schema;
pub mod style;

// Re-export for convenience
pub use drawio::{shape_category, DiagramParser, ElementStream, ParseError, ParserOptions};
pub use schema::*;
pub use style::{decode_style, StyleAttributes};
