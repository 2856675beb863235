use geojson::{Feature, GeoJson, Geometry, Value};

use crate::service::LngLat;

/// Axis-aligned lon/lat bounding box
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Bounds {
    /// Degenerate box around a single position
    pub fn point(lon: f64, lat: f64) -> Self {
        Self {
            min_lon: lon,
            min_lat: lat,
            max_lon: lon,
            max_lat: lat,
        }
    }

    pub fn extend(&mut self, lon: f64, lat: f64) {
        self.min_lon = self.min_lon.min(lon);
        self.min_lat = self.min_lat.min(lat);
        self.max_lon = self.max_lon.max(lon);
        self.max_lat = self.max_lat.max(lat);
    }

    pub fn union(mut self, other: Bounds) -> Self {
        self.extend(other.min_lon, other.min_lat);
        self.extend(other.max_lon, other.max_lat);
        self
    }

    pub fn contains(&self, at: LngLat) -> bool {
        at.lon >= self.min_lon && at.lon <= self.max_lon && at.lat >= self.min_lat && at.lat <= self.max_lat
    }

    pub fn center(&self) -> LngLat {
        LngLat {
            lon: (self.min_lon + self.max_lon) * 0.5,
            lat: (self.min_lat + self.max_lat) * 0.5,
        }
    }

    /// Area in square degrees (used to rank overlapping hits)
    pub fn area(&self) -> f64 {
        (self.max_lon - self.min_lon) * (self.max_lat - self.min_lat)
    }

    /// Bounds of a whole payload, `None` if it carries no coordinates
    pub fn of_geojson(geojson: &GeoJson) -> Option<Self> {
        match geojson {
            GeoJson::FeatureCollection(fc) => fc
                .features
                .iter()
                .filter_map(Self::of_feature)
                .reduce(Self::union),
            GeoJson::Feature(f) => Self::of_feature(f),
            GeoJson::Geometry(g) => Self::of_geometry(g),
        }
    }

    pub fn of_feature(feature: &Feature) -> Option<Self> {
        feature.geometry.as_ref().and_then(Self::of_geometry)
    }

    pub fn of_geometry(geometry: &Geometry) -> Option<Self> {
        let mut bounds: Option<Bounds> = None;
        visit_positions(&geometry.value, &mut |lon, lat| match bounds.as_mut() {
            Some(b) => b.extend(lon, lat),
            None => bounds = Some(Bounds::point(lon, lat)),
        });
        bounds
    }
}

/// Walk every coordinate pair of a geometry value
fn visit_positions<F>(value: &Value, visit: &mut F)
where
    F: FnMut(f64, f64),
{
    match value {
        Value::Point(c) => visit_coords(std::slice::from_ref(c), visit),
        Value::MultiPoint(coords) | Value::LineString(coords) => visit_coords(coords, visit),
        Value::MultiLineString(lines) | Value::Polygon(lines) => {
            for line in lines {
                visit_coords(line, visit);
            }
        }
        Value::MultiPolygon(polygons) => {
            for rings in polygons {
                for ring in rings {
                    visit_coords(ring, visit);
                }
            }
        }
        Value::GeometryCollection(geometries) => {
            for g in geometries {
                visit_positions(&g.value, visit);
            }
        }
    }
}

fn visit_coords<F>(coords: &[Vec<f64>], visit: &mut F)
where
    F: FnMut(f64, f64),
{
    for c in coords.iter().filter(|c| c.len() >= 2) {
        visit(c[0], c[1]);
    }
}
