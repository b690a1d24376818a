//! Input list reader for the CLI
//!
//! One record per line: `id,secondary_key[,title[,classification]]`.
//! Blank lines and lines starting with `#` are ignored. Empty fields count as
//! absent.

use crate::models::InputItem;
use bibscout_common::{Error, Result};
use std::path::Path;

/// Read and parse an input file
pub fn read_input_file(path: &Path) -> Result<Vec<InputItem>> {
    let content = std::fs::read_to_string(path)?;
    let items = parse_input(&content)?;
    tracing::info!(path = %path.display(), rows = items.len(), "Input loaded");
    Ok(items)
}

/// Parse input text
pub fn parse_input(content: &str) -> Result<Vec<InputItem>> {
    let mut items = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.splitn(4, ',').map(str::trim);
        let id = fields.next().unwrap_or_default();
        if id.is_empty() {
            return Err(Error::InvalidInput(format!("Line {}: missing id", line_no + 1)));
        }

        let optional = |value: Option<&str>| value.filter(|v| !v.is_empty()).map(str::to_string);
        let mut item = InputItem::new(id, optional(fields.next()));
        item.title = optional(fields.next());
        item.classification = optional(fields.next());
        items.push(item);
    }

    Ok(items)
}
