//! Shape-style decoder
//!
//! draw.io stores shape metadata in a `style` attribute written as
//! `key1=value1;key2=value2;...`. Bare flags such as `html` or `ellipse`
//! carry no `=` and are ignored.

use std::collections::HashMap;

/// Key/value pairs decoded from one cell's `style` attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleAttributes {
    attrs: HashMap<String, String>,
}

impl StyleAttributes {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attrs.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Parse a numeric attribute, falling back to `0.0` when absent or malformed.
    pub fn float_or_zero(&self, key: &str) -> f32 {
        self.get(key)
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    }
}

/// Decode a style string. Never fails; later duplicates win.
pub fn decode_style(input: &str) -> StyleAttributes {
    let mut attrs = HashMap::new();

    for fragment in input.split(';') {
        let Some((key, value)) = fragment.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        attrs.insert(key.to_string(), value.to_string());
    }

    StyleAttributes { attrs }
}
