//! Hex-encoded extended well-known binary (EWKB) geometry decoding.
//!
//! PostGIS writes geometries as EWKB: plain WKB plus an optional SRID,
//! flagged by bit `0x20000000` of the type word and stored as 4 bytes right
//! after it. [`strip_srid`] removes the extension so the rest is plain WKB.

use bytes::Buf;

use crate::error::HistoryError;
use crate::models::{Coord, Geometry};

const EWKB_SRID_FLAG: u32 = 0x2000_0000;
const EWKB_Z_FLAG: u32 = 0x8000_0000;
const EWKB_M_FLAG: u32 = 0x4000_0000;
const EWKB_FLAGS: u32 = EWKB_Z_FLAG | EWKB_M_FLAG | EWKB_SRID_FLAG;

/// Collections nested deeper than this are rejected.
const MAX_NESTING: usize = 32;

/// Decode a hex EWKB value. `None` and the empty string are the empty
/// geometry.
pub fn geometry_from_ewkb_hex(text: Option<&str>) -> Result<Geometry, HistoryError> {
    let text = match text.map(str::trim) {
        None | Some("") => return Ok(Geometry::Empty),
        Some(text) => text,
    };
    let bytes = decode_hex(text)?;
    parse_wkb(&strip_srid(&bytes)?)
}

/// Decode a hex string, accepting both letter cases.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, HistoryError> {
    hex::decode(text).map_err(|e| HistoryError::malformed(format!("invalid hex geometry: {e}")))
}

/// Remove the SRID flag and the SRID itself from the outermost geometry
/// header. Input without a SRID is returned unchanged.
pub fn strip_srid(ewkb: &[u8]) -> Result<Vec<u8>, HistoryError> {
    if ewkb.len() < 5 {
        return Err(HistoryError::malformed("geometry header is truncated"));
    }
    let little_endian = byte_order(ewkb[0])?;
    let mut header = &ewkb[1..5];
    let type_word = if little_endian { header.get_u32_le() } else { header.get_u32() };

    if type_word & EWKB_SRID_FLAG == 0 {
        return Ok(ewkb.to_vec());
    }
    if ewkb.len() < 9 {
        return Err(HistoryError::malformed("geometry SRID is truncated"));
    }

    let cleared = type_word & !EWKB_SRID_FLAG;
    let mut wkb = Vec::with_capacity(ewkb.len() - 4);
    wkb.push(ewkb[0]);
    if little_endian {
        wkb.extend_from_slice(&cleared.to_le_bytes());
    } else {
        wkb.extend_from_slice(&cleared.to_be_bytes());
    }
    wkb.extend_from_slice(&ewkb[9..]);
    Ok(wkb)
}

fn byte_order(marker: u8) -> Result<bool, HistoryError> {
    match marker {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(HistoryError::malformed(format!("invalid WKB byte order {other}"))),
    }
}

/// Parse one WKB geometry. Trailing bytes are an error.
pub fn parse_wkb(wkb: &[u8]) -> Result<Geometry, HistoryError> {
    let mut reader = WkbReader { cursor: wkb, little_endian: true };
    let geometry = reader.geometry(0)?;
    if reader.cursor.has_remaining() {
        return Err(HistoryError::malformed(format!(
            "{} unexpected bytes after geometry",
            reader.cursor.remaining()
        )));
    }
    Ok(geometry)
}

#[derive(Clone, Copy)]
struct Dimensions {
    z: bool,
    m: bool,
}

impl Dimensions {
    fn coord_size(self) -> usize {
        8 * (2 + usize::from(self.z) + usize::from(self.m))
    }
}

struct WkbReader<'a> {
    cursor: &'a [u8],
    little_endian: bool,
}

impl WkbReader<'_> {
    fn need(&self, n: usize, what: &str) -> Result<(), HistoryError> {
        if self.cursor.remaining() < n {
            return Err(HistoryError::malformed(format!("geometry truncated in {what}")));
        }
        Ok(())
    }

    fn u32(&mut self, what: &str) -> Result<u32, HistoryError> {
        self.need(4, what)?;
        Ok(if self.little_endian { self.cursor.get_u32_le() } else { self.cursor.get_u32() })
    }

    fn f64(&mut self) -> f64 {
        if self.little_endian {
            self.cursor.get_f64_le()
        } else {
            self.cursor.get_f64()
        }
    }

    /// Element count, checked against the bytes left so a corrupt count
    /// cannot trigger a huge allocation.
    fn count(&mut self, min_element_size: usize, what: &str) -> Result<usize, HistoryError> {
        let count = self.u32(what)? as usize;
        if count.saturating_mul(min_element_size) > self.cursor.remaining() {
            return Err(HistoryError::malformed(format!(
                "{what} count {count} exceeds the geometry size"
            )));
        }
        Ok(count)
    }

    fn coord(&mut self, dims: Dimensions) -> Result<Coord, HistoryError> {
        self.need(dims.coord_size(), "coordinates")?;
        let x = self.f64();
        let y = self.f64();
        let z = dims.z.then(|| self.f64());
        let m = dims.m.then(|| self.f64());
        Ok(Coord { x, y, z, m })
    }

    fn coords(&mut self, dims: Dimensions) -> Result<Vec<Coord>, HistoryError> {
        let n = self.count(dims.coord_size(), "point")?;
        (0..n).map(|_| self.coord(dims)).collect()
    }

    fn rings(&mut self, dims: Dimensions) -> Result<Vec<Vec<Coord>>, HistoryError> {
        let n = self.count(4, "ring")?;
        (0..n).map(|_| self.coords(dims)).collect()
    }

    /// Members of a multi geometry; each carries its own header.
    fn members(&mut self, depth: usize) -> Result<Vec<Geometry>, HistoryError> {
        let n = self.count(5, "member")?;
        (0..n).map(|_| self.geometry(depth + 1)).collect()
    }

    fn geometry(&mut self, depth: usize) -> Result<Geometry, HistoryError> {
        if depth > MAX_NESTING {
            return Err(HistoryError::malformed("geometry collections nested too deeply"));
        }
        self.need(1, "byte order")?;
        self.little_endian = byte_order(self.cursor.get_u8())?;
        let type_word = self.u32("geometry type")?;

        if type_word & EWKB_SRID_FLAG != 0 {
            self.need(4, "SRID")?;
            self.cursor.advance(4);
        }

        let code = type_word & !EWKB_FLAGS;
        let dims = Dimensions {
            z: type_word & EWKB_Z_FLAG != 0 || matches!(code / 1000, 1 | 3),
            m: type_word & EWKB_M_FLAG != 0 || matches!(code / 1000, 2 | 3),
        };

        match code % 1000 {
            1 => Ok(Geometry::Point(self.coord(dims)?)),
            2 => Ok(Geometry::LineString(self.coords(dims)?)),
            3 => Ok(Geometry::Polygon(self.rings(dims)?)),
            4 => {
                let points = self
                    .members(depth)?
                    .into_iter()
                    .map(|member| match member {
                        Geometry::Point(c) => Ok(c),
                        other => Err(unexpected_member("MULTIPOINT", &other)),
                    })
                    .collect::<Result<_, _>>()?;
                Ok(Geometry::MultiPoint(points))
            }
            5 => {
                let lines = self
                    .members(depth)?
                    .into_iter()
                    .map(|member| match member {
                        Geometry::LineString(cs) => Ok(cs),
                        other => Err(unexpected_member("MULTILINESTRING", &other)),
                    })
                    .collect::<Result<_, _>>()?;
                Ok(Geometry::MultiLineString(lines))
            }
            6 => {
                let polygons = self
                    .members(depth)?
                    .into_iter()
                    .map(|member| match member {
                        Geometry::Polygon(rings) => Ok(rings),
                        other => Err(unexpected_member("MULTIPOLYGON", &other)),
                    })
                    .collect::<Result<_, _>>()?;
                Ok(Geometry::MultiPolygon(polygons))
            }
            7 => Ok(Geometry::GeometryCollection(self.members(depth)?)),
            _ => Err(HistoryError::malformed(format!("unsupported WKB geometry type {code}"))),
        }
    }
}

fn unexpected_member(container: &str, member: &Geometry) -> HistoryError {
    HistoryError::malformed(format!("{container} contains a {}", member.type_name()))
}
