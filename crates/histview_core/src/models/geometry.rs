//! Decoded geometries and their display extents.

/// One vertex. `z` and `m` are present when the geometry type carries them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub m: Option<f64>,
}

impl Coord {
    pub fn xy(x: f64, y: f64) -> Self {
        Self { x, y, z: None, m: None }
    }
}

/// A geometry decoded from well-known binary.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Geometry {
    /// No value; also used for a NULL geometry column
    #[default]
    Empty,
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Geometry>),
}

impl Geometry {
    pub fn is_empty(&self) -> bool {
        self.bounds().is_none()
    }

    /// WKT-style type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::Point(_) => "POINT",
            Self::LineString(_) => "LINESTRING",
            Self::Polygon(_) => "POLYGON",
            Self::MultiPoint(_) => "MULTIPOINT",
            Self::MultiLineString(_) => "MULTILINESTRING",
            Self::MultiPolygon(_) => "MULTIPOLYGON",
            Self::GeometryCollection(_) => "GEOMETRYCOLLECTION",
        }
    }

    /// Bounding rectangle, `None` when there is no vertex. NaN vertices
    /// (WKB's empty point) are ignored.
    pub fn bounds(&self) -> Option<Rect> {
        let mut rect: Option<Rect> = None;
        self.visit_coords(&mut |c| {
            if c.x.is_nan() || c.y.is_nan() {
                return;
            }
            let point = Rect { min_x: c.x, min_y: c.y, max_x: c.x, max_y: c.y };
            rect = Some(match rect {
                Some(r) => r.union(&point),
                None => point,
            });
        });
        rect
    }

    fn visit_coords(&self, f: &mut impl FnMut(&Coord)) {
        match self {
            Self::Empty => {}
            Self::Point(c) => f(c),
            Self::LineString(cs) | Self::MultiPoint(cs) => cs.iter().for_each(|c| f(c)),
            Self::Polygon(rings) | Self::MultiLineString(rings) => {
                rings.iter().flatten().for_each(|c| f(c))
            }
            Self::MultiPolygon(polygons) => polygons.iter().flatten().flatten().for_each(|c| f(c)),
            Self::GeometryCollection(members) => {
                for member in members {
                    member.visit_coords(f);
                }
            }
        }
    }
}

/// Axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Grow or shrink around the centre.
    pub fn scale(&self, factor: f64) -> Rect {
        let cx = (self.min_x + self.max_x) / 2.0;
        let cy = (self.min_y + self.max_y) / 2.0;
        let half_w = (self.max_x - self.min_x) / 2.0 * factor;
        let half_h = (self.max_y - self.min_y) / 2.0 * factor;
        Rect { min_x: cx - half_w, min_y: cy - half_h, max_x: cx + half_w, max_y: cy + half_h }
    }
}
