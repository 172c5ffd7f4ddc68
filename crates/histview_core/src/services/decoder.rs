//! Change decoding: hstore payloads and the detail view of one event.

use crate::error::HistoryError;
use crate::models::{
    Action, AuditEvent, DetailRows, EventDetail, FieldChange, FieldEntry, Geometry,
    GeometryDisplay, MalformedField,
};
use crate::services::ewkb::geometry_from_ewkb_hex;

/// Decoded hstore, keys in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HstoreMap {
    entries: Vec<(String, Option<String>)>,
}

impl HstoreMap {
    /// `None` when the key is absent, `Some(None)` when its value is NULL.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_deref())
    }

    /// Value of `key`, treating absent and NULL alike.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).flatten()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decode the text form of an hstore, `"key"=>"value", "other"=>NULL`.
///
/// Backslash escapes inside quotes are resolved. A duplicate key or any
/// syntax error makes the whole payload malformed.
pub fn decode_hstore(text: &str) -> Result<HstoreMap, HistoryError> {
    let (map, errors) = decode_pairs(text);
    match errors.into_iter().next() {
        Some((_, error)) => Err(error),
        None => Ok(map),
    }
}

/// Decode an optional payload column; `None` is the empty map.
pub(crate) fn decode_payload(text: Option<&str>) -> Result<HstoreMap, HistoryError> {
    text.map(decode_hstore).transpose().map(Option::unwrap_or_default)
}

/// Decode a payload column keeping every pair that can be read.
///
/// A broken pair is recorded under its key, or under `payload` when the key
/// itself is unreadable, and decoding resumes at the next `, "`.
fn salvage_payload(
    payload: &str,
    text: Option<&str>,
    malformed: &mut Vec<MalformedField>,
) -> HstoreMap {
    let Some(text) = text else {
        return HstoreMap::default();
    };
    let (map, errors) = decode_pairs(text);
    malformed.extend(errors.into_iter().map(|(key, error)| MalformedField {
        column: key.unwrap_or_else(|| payload.to_string()),
        reason: error.to_string(),
    }));
    map
}

type PairError = (Option<String>, HistoryError);

/// Every readable pair, and one error per pair that could not be read.
fn decode_pairs(text: &str) -> (HstoreMap, Vec<PairError>) {
    let mut parser = HstoreParser { chars: text.char_indices().peekable(), text };
    let mut map = HstoreMap::default();
    let mut errors = Vec::new();

    parser.skip_whitespace();
    if parser.at_end() {
        return (map, errors);
    }

    loop {
        match parser.pair() {
            Ok((key, _)) if map.contains_key(&key) => {
                let error = HistoryError::malformed(format!("duplicate hstore key \"{key}\""));
                errors.push((Some(key), error));
            }
            Ok(pair) => map.entries.push(pair),
            Err(error) => {
                errors.push(error);
                if parser.resync() {
                    continue;
                }
                break;
            }
        }

        parser.skip_whitespace();
        if parser.at_end() {
            break;
        }
        if let Err(error) = parser.expect(',') {
            errors.push((None, error));
            if parser.resync() {
                continue;
            }
            break;
        }
        parser.skip_whitespace();
    }

    (map, errors)
}

struct HstoreParser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    text: &'a str,
}

impl HstoreParser<'_> {
    fn at_end(&mut self) -> bool {
        self.chars.peek().is_none()
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn error(&mut self, expected: &str) -> HistoryError {
        match self.chars.peek() {
            Some(&(pos, c)) => HistoryError::malformed(format!(
                "expected {expected} at offset {pos} of hstore, found '{c}'"
            )),
            None => HistoryError::malformed(format!(
                "expected {expected} at end of hstore ({} bytes)",
                self.text.len()
            )),
        }
    }

    fn expect(&mut self, wanted: char) -> Result<(), HistoryError> {
        match self.chars.next_if(|&(_, c)| c == wanted) {
            Some(_) => Ok(()),
            None => Err(self.error(&format!("'{wanted}'"))),
        }
    }

    /// One `"key"=>value` pair. A failure after the key carries the key.
    fn pair(&mut self) -> Result<(String, Option<String>), PairError> {
        let key = self.quoted().map_err(|e| (None, e))?;
        match self.arrow_value() {
            Ok(value) => Ok((key, value)),
            Err(e) => Err((Some(key), e)),
        }
    }

    fn arrow_value(&mut self) -> Result<Option<String>, HistoryError> {
        self.skip_whitespace();
        self.expect('=')?;
        self.expect('>')?;
        self.skip_whitespace();
        self.value()
    }

    /// Skip past the next comma that is followed by a quote. False at the end.
    fn resync(&mut self) -> bool {
        while let Some((_, c)) = self.chars.next() {
            if c == ',' {
                self.skip_whitespace();
                if matches!(self.chars.peek(), Some((_, '"'))) {
                    return true;
                }
            }
        }
        false
    }

    fn quoted(&mut self) -> Result<String, HistoryError> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some((_, '"')) => return Ok(out),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => return Err(self.error("an escaped character")),
                },
                Some((_, c)) => out.push(c),
                None => return Err(self.error("a closing quote")),
            }
        }
    }

    fn value(&mut self) -> Result<Option<String>, HistoryError> {
        if matches!(self.chars.peek(), Some((_, '"'))) {
            return self.quoted().map(Some);
        }
        let mut word = String::new();
        while let Some((_, c)) = self.chars.next_if(|(_, c)| c.is_ascii_alphabetic()) {
            word.push(c);
        }
        if word.eq_ignore_ascii_case("NULL") {
            Ok(None)
        } else {
            Err(self.error("a quoted value or NULL"))
        }
    }
}

/// Build the detail view of one event.
///
/// `geometry_columns` lists the geometry columns of the event's table; the
/// first one is drawn, the others are left out. For inserts and deletes,
/// NULL columns are left out. For updates, a column is shown with its old
/// and new value and flagged when the new value differs; the drawn geometry
/// is shown as a before/after pair only when it changed. Payload pairs and
/// geometries that cannot be decoded are reported in
/// [`EventDetail::malformed`] and left out; the rest of the event is shown.
pub fn describe_event(event: &AuditEvent, geometry_columns: &[String]) -> EventDetail {
    let mut malformed = Vec::new();
    let data = salvage_payload("row_data", event.row_data.as_deref(), &mut malformed);
    let primary = geometry_columns.first().map(String::as_str);
    let is_geometry = |column: &str| geometry_columns.iter().any(|g| g == column);
    let mut geometry = None;

    let rows = match event.action {
        Action::Insert | Action::Delete => {
            let mut entries = Vec::new();
            for (column, value) in data.iter() {
                if Some(column) == primary {
                    geometry = decode_geometry(column, value, &mut malformed)
                        .map(GeometryDisplay::Single);
                    continue;
                }
                if is_geometry(column) {
                    continue;
                }
                if let Some(value) = value {
                    entries.push(FieldEntry { column: column.to_string(), value: value.to_string() });
                }
            }
            DetailRows::Values(entries)
        }
        Action::Update => {
            let changed_fields =
                salvage_payload("changed_fields", event.changed_fields.as_deref(), &mut malformed);
            let mut changes = Vec::new();
            for (column, old) in data.iter() {
                let new = changed_fields.value(column);
                if Some(column) == primary {
                    if let Some(new) = new {
                        let old = decode_geometry(column, old, &mut malformed);
                        let new = decode_geometry(column, Some(new), &mut malformed);
                        if let (Some(old), Some(new)) = (old, new) {
                            geometry = Some(GeometryDisplay::Pair { old, new });
                        }
                    }
                    continue;
                }
                if is_geometry(column) || (old.is_none() && new.is_none()) {
                    continue;
                }
                changes.push(FieldChange {
                    column: column.to_string(),
                    old: old.map(str::to_string),
                    new: new.or(old).map(str::to_string),
                    changed: new.is_some() && new != old,
                });
            }
            DetailRows::Changes(changes)
        }
    };

    for field in &malformed {
        tracing::warn!(
            event_id = event.event_id,
            column = %field.column,
            reason = %field.reason,
            "Skipping undecodable field"
        );
    }

    EventDetail { rows, geometry, malformed }
}

fn decode_geometry(
    column: &str,
    value: Option<&str>,
    malformed: &mut Vec<MalformedField>,
) -> Option<Geometry> {
    match geometry_from_ewkb_hex(value) {
        Ok(geometry) => Some(geometry),
        Err(e) => {
            malformed.push(MalformedField { column: column.to_string(), reason: e.to_string() });
            None
        }
    }
}
