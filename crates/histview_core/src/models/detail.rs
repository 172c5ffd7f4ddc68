//! Decoded change sets shown for one selected event.

use super::geometry::{Geometry, Rect};

/// Factor applied to the geometry bounds when framing the map view.
const DISPLAY_MARGIN: f64 = 1.5;

/// Column value of an inserted or deleted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEntry {
    pub column: String,
    pub value: String,
}

/// Old and new value of one column in an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub column: String,
    pub old: Option<String>,
    pub new: Option<String>,
    /// The column appears in the changed fields with a different value;
    /// the row is highlighted
    pub changed: bool,
}

/// Geometry to draw for the selected event.
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryDisplay {
    /// Inserted or deleted geometry
    Single(Geometry),
    /// Geometry before and after an update
    Pair { old: Geometry, new: Geometry },
}

impl GeometryDisplay {
    /// Map extent framing every displayed geometry with a margin.
    pub fn extent(&self) -> Option<Rect> {
        let bounds = match self {
            Self::Single(g) => g.bounds(),
            Self::Pair { old, new } => match (old.bounds(), new.bounds()) {
                (Some(a), Some(b)) => Some(a.union(&b)),
                (a, b) => a.or(b),
            },
        };
        bounds.map(|b| b.scale(DISPLAY_MARGIN))
    }
}

/// A payload field that could not be decoded and was left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedField {
    pub column: String,
    pub reason: String,
}

/// Table rows of the detail view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailRows {
    /// Insert or delete: one value per column
    Values(Vec<FieldEntry>),
    /// Update: old and new value per column
    Changes(Vec<FieldChange>),
}

/// Everything the detail view shows for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDetail {
    pub rows: DetailRows,
    pub geometry: Option<GeometryDisplay>,
    pub malformed: Vec<MalformedField>,
}

impl EventDetail {
    /// Column headers of the detail table.
    pub fn headers(&self) -> &'static [&'static str] {
        match self.rows {
            DetailRows::Values(_) => &["Column", "Value"],
            DetailRows::Changes(_) => &["Column", "Old value", "New value"],
        }
    }
}
