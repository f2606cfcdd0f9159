//! Extraction of the two identifying fields from a ToPX metadata document.
//!
//! Elements are matched on their local name only, so `<topx:identificatiekenmerk>`,
//! `<identificatiekenmerk xmlns="...">` and an unqualified element all match.
//! The first match in document order wins.

use std::fs;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::error::IngestError;

pub const AGGREGATION_LEVEL_ELEMENT: &str = "aggregatieniveau";
pub const IDENTIFIER_ELEMENT: &str = "identificatiekenmerk";

/// The fields extracted from one `<name>.metadata` document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelInfo {
    /// Value of `aggregatieniveau`. Diagnostic only, never validated.
    pub level: String,
    /// Value of `identificatiekenmerk`, the business identifier.
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("missing <{0}> element")]
    Missing(&'static str),
    #[error("{0}")]
    Malformed(String),
}

#[derive(Clone, Copy)]
enum Field {
    Level,
    Identifier,
}

/// Reads and parses the metadata document at `path`.
pub fn extract_level(path: &Path) -> Result<LevelInfo, IngestError> {
    let bytes = fs::read(path).map_err(|e| IngestError::MalformedMetadata {
        path: path.to_path_buf(),
        reason: format!("unreadable: {e}"),
    })?;
    let xml = String::from_utf8(bytes).map_err(|e| IngestError::MalformedMetadata {
        path: path.to_path_buf(),
        reason: format!("not valid UTF-8: {e}"),
    })?;

    let info = parse_level(&xml).map_err(|e| match e {
        MetadataError::Missing(element) => IngestError::MetadataMissing {
            path: path.to_path_buf(),
            element,
        },
        MetadataError::Malformed(reason) => IngestError::MalformedMetadata {
            path: path.to_path_buf(),
            reason,
        },
    })?;
    debug!(
        path = %path.display(),
        level = %info.level,
        identifier = %info.identifier,
        "Extracted metadata fields"
    );
    Ok(info)
}

/// Parses an in-memory metadata document.
pub fn parse_level(xml: &str) -> Result<LevelInfo, MetadataError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut level: Option<String> = None;
    let mut identifier: Option<String> = None;
    // (field, depth of the opening tag, collected text)
    let mut capture: Option<(Field, usize, String)> = None;
    let mut depth = 0usize;
    let mut saw_root = false;

    loop {
        let event = reader.read_event().map_err(|e| {
            MetadataError::Malformed(format!("at byte {}: {e}", reader.buffer_position()))
        })?;
        match event {
            Event::Start(start) => {
                depth += 1;
                saw_root = true;
                if capture.is_none() {
                    if let Some(field) =
                        wanted_field(start.local_name().as_ref(), &level, &identifier)
                    {
                        capture = Some((field, depth, String::new()));
                    }
                }
            }
            Event::Empty(start) => {
                saw_root = true;
                if capture.is_none() {
                    match wanted_field(start.local_name().as_ref(), &level, &identifier) {
                        Some(Field::Level) => level = Some(String::new()),
                        Some(Field::Identifier) => identifier = Some(String::new()),
                        None => {}
                    }
                }
            }
            Event::Text(text) => {
                if let Some((_, _, buf)) = capture.as_mut() {
                    let unescaped = text
                        .unescape()
                        .map_err(|e| MetadataError::Malformed(e.to_string()))?;
                    buf.push_str(&unescaped);
                }
            }
            Event::CData(data) => {
                if let Some((_, _, buf)) = capture.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                if matches!(capture, Some((_, opened, _)) if opened == depth) {
                    if let Some((field, _, text)) = capture.take() {
                        let value = text.trim().to_string();
                        match field {
                            Field::Level => level = Some(value),
                            Field::Identifier => identifier = Some(value),
                        }
                    }
                }
                depth = depth.checked_sub(1).ok_or_else(|| {
                    MetadataError::Malformed("unmatched closing tag".to_string())
                })?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(MetadataError::Malformed("document has no root element".into()));
    }
    if depth != 0 {
        return Err(MetadataError::Malformed(
            "unexpected end of document inside an open element".into(),
        ));
    }

    let level = level
        .filter(|v| !v.is_empty())
        .ok_or(MetadataError::Missing(AGGREGATION_LEVEL_ELEMENT))?;
    let identifier = identifier
        .filter(|v| !v.is_empty())
        .ok_or(MetadataError::Missing(IDENTIFIER_ELEMENT))?;

    Ok(LevelInfo { level, identifier })
}

fn wanted_field(
    local_name: &[u8],
    level: &Option<String>,
    identifier: &Option<String>,
) -> Option<Field> {
    if local_name == AGGREGATION_LEVEL_ELEMENT.as_bytes() && level.is_none() {
        Some(Field::Level)
    } else if local_name == IDENTIFIER_ELEMENT.as_bytes() && identifier.is_none() {
        Some(Field::Identifier)
    } else {
        None
    }
}
