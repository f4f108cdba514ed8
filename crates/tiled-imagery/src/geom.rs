//! Geographic and view-space primitives consumed by tile selection.
//!
//! The globe and the view are external collaborators; this module only
//! defines the read-only queries the selector needs from them, together with
//! a spherical globe and a frustum-backed view that are sufficient to drive
//! the layer outside a full rendering engine.

use glam::{DMat4, DVec3, DVec4};
use serde::{Deserialize, Serialize};

/// A geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatLon {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl LatLon {
    /// Create a position from degrees.
    #[must_use]
    pub const fn from_degrees(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// An axis-aligned latitude/longitude rectangle, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sector {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl Sector {
    /// The whole globe.
    pub const FULL_SPHERE: Sector = Sector {
        min_latitude: -90.0,
        max_latitude: 90.0,
        min_longitude: -180.0,
        max_longitude: 180.0,
    };

    #[must_use]
    pub const fn from_degrees(
        min_latitude: f64,
        max_latitude: f64,
        min_longitude: f64,
        max_longitude: f64,
    ) -> Self {
        Self {
            min_latitude,
            max_latitude,
            min_longitude,
            max_longitude,
        }
    }

    #[must_use]
    pub fn delta_lat(&self) -> f64 {
        self.max_latitude - self.min_latitude
    }

    #[must_use]
    pub fn delta_lon(&self) -> f64 {
        self.max_longitude - self.min_longitude
    }

    #[must_use]
    pub fn centroid(&self) -> LatLon {
        LatLon::from_degrees(
            0.5 * (self.min_latitude + self.max_latitude),
            0.5 * (self.min_longitude + self.max_longitude),
        )
    }

    /// Corners in south-west, south-east, north-east, north-west order.
    #[must_use]
    pub fn corners(&self) -> [LatLon; 4] {
        [
            LatLon::from_degrees(self.min_latitude, self.min_longitude),
            LatLon::from_degrees(self.min_latitude, self.max_longitude),
            LatLon::from_degrees(self.max_latitude, self.max_longitude),
            LatLon::from_degrees(self.max_latitude, self.min_longitude),
        ]
    }

    /// Whether the two sectors overlap. Shared edges count as overlap.
    #[must_use]
    pub fn intersects(&self, other: &Sector) -> bool {
        self.min_latitude <= other.max_latitude
            && self.max_latitude >= other.min_latitude
            && self.min_longitude <= other.max_longitude
            && self.max_longitude >= other.min_longitude
    }

    /// The overlapping region, or `None` when the sectors are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Sector) -> Option<Sector> {
        if !self.intersects(other) {
            return None;
        }
        Some(Sector {
            min_latitude: self.min_latitude.max(other.min_latitude),
            max_latitude: self.max_latitude.min(other.max_latitude),
            min_longitude: self.min_longitude.max(other.min_longitude),
            max_longitude: self.max_longitude.min(other.max_longitude),
        })
    }

    #[must_use]
    pub fn contains(&self, position: LatLon) -> bool {
        position.latitude >= self.min_latitude
            && position.latitude <= self.max_latitude
            && position.longitude >= self.min_longitude
            && position.longitude <= self.max_longitude
    }

    /// Whether `other` lies entirely within this sector.
    #[must_use]
    pub fn contains_sector(&self, other: &Sector) -> bool {
        other.min_latitude >= self.min_latitude
            && other.max_latitude <= self.max_latitude
            && other.min_longitude >= self.min_longitude
            && other.max_longitude <= self.max_longitude
    }

    /// Bounding box of this sector on the globe between its minimum and
    /// maximum elevations, scaled by the vertical exaggeration.
    #[must_use]
    pub fn compute_bounding_box(&self, globe: &dyn Globe, vertical_exaggeration: f64) -> Extent {
        let (min_elevation, max_elevation) = globe.min_and_max_elevations(self);
        let elevations = [
            min_elevation * vertical_exaggeration,
            max_elevation * vertical_exaggeration,
        ];

        let mid_lat = 0.5 * (self.min_latitude + self.max_latitude);
        let mid_lon = 0.5 * (self.min_longitude + self.max_longitude);
        let lats = [self.min_latitude, mid_lat, self.max_latitude];
        let lons = [self.min_longitude, mid_lon, self.max_longitude];

        let mut min = DVec3::splat(f64::MAX);
        let mut max = DVec3::splat(f64::MIN);
        for elevation in elevations {
            for lat in lats {
                for lon in lons {
                    let p = globe.compute_point(lat, lon, elevation);
                    min = min.min(p);
                    max = max.max(p);
                }
            }
        }
        Extent { min, max }
    }

    /// Four corner points followed by the centroid, at zero elevation.
    #[must_use]
    pub fn compute_reference_points(
        &self,
        globe: &dyn Globe,
        vertical_exaggeration: f64,
    ) -> [DVec3; 5] {
        let point = |p: LatLon| {
            let elevation = globe.elevation(p) * vertical_exaggeration;
            globe.compute_point(p.latitude, p.longitude, elevation)
        };
        let [sw, se, ne, nw] = self.corners();
        [point(sw), point(se), point(ne), point(nw), point(self.centroid())]
    }
}

/// An axis-aligned bounding box in model coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub min: DVec3,
    pub max: DVec3,
}

impl Extent {
    #[must_use]
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn center(&self) -> DVec3 {
        0.5 * (self.min + self.max)
    }

    /// Radius of the sphere circumscribing the box.
    #[must_use]
    pub fn radius(&self) -> f64 {
        0.5 * (self.max - self.min).length()
    }
}

/// A frustum for culling tiles by their extents.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    /// Left, right, bottom, top, near and far planes as (normal, distance).
    planes: [(DVec3, f64); 6],
}

impl Frustum {
    /// Create a frustum from a view-projection matrix.
    #[must_use]
    pub fn from_matrix(vp: DMat4) -> Self {
        let r0 = vp.row(0);
        let r1 = vp.row(1);
        let r2 = vp.row(2);
        let r3 = vp.row(3);

        let planes =
            [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r3 + r2, r3 - r2].map(Self::normalize_plane);
        Self { planes }
    }

    fn normalize_plane(plane: DVec4) -> (DVec3, f64) {
        let normal = plane.truncate();
        let length = normal.length();
        if length > 0.0 {
            (normal / length, plane.w / length)
        } else {
            (DVec3::ZERO, 0.0)
        }
    }

    /// Test if an extent intersects the frustum.
    #[must_use]
    pub fn intersects_extent(&self, extent: &Extent) -> bool {
        for &(normal, distance) in &self.planes {
            // The box corner furthest along the plane normal.
            let p = DVec3::new(
                if normal.x >= 0.0 { extent.max.x } else { extent.min.x },
                if normal.y >= 0.0 { extent.max.y } else { extent.min.y },
                if normal.z >= 0.0 { extent.max.z } else { extent.min.z },
            );
            if normal.dot(p) + distance < 0.0 {
                return false;
            }
        }
        true
    }
}

/// Globe queries needed by the selector.
pub trait Globe: Send + Sync {
    /// Equatorial radius in meters.
    fn radius(&self) -> f64;

    /// Model-space point for a position and elevation in meters.
    fn compute_point(&self, latitude: f64, longitude: f64, elevation: f64) -> DVec3;

    /// Elevation of the surface at a position.
    fn elevation(&self, _position: LatLon) -> f64 {
        0.0
    }

    /// Minimum and maximum surface elevations within a sector.
    fn min_and_max_elevations(&self, _sector: &Sector) -> (f64, f64) {
        (0.0, 0.0)
    }

    /// Height of a model-space point above the surface.
    fn altitude_of(&self, point: DVec3) -> f64 {
        point.length() - self.radius()
    }
}

/// A smooth sphere with no terrain.
#[derive(Debug, Clone, Copy)]
pub struct SphericalGlobe {
    radius: f64,
}

impl SphericalGlobe {
    /// WGS84 equatorial radius.
    pub const EARTH_RADIUS: f64 = 6_378_137.0;

    #[must_use]
    pub fn new(radius: f64) -> Self {
        Self { radius }
    }

    #[must_use]
    pub fn earth() -> Self {
        Self::new(Self::EARTH_RADIUS)
    }
}

impl Globe for SphericalGlobe {
    fn radius(&self) -> f64 {
        self.radius
    }

    fn compute_point(&self, latitude: f64, longitude: f64, elevation: f64) -> DVec3 {
        let lat = latitude.to_radians();
        let lon = longitude.to_radians();
        let r = self.radius + elevation;
        DVec3::new(
            r * lat.cos() * lon.sin(),
            r * lat.sin(),
            r * lat.cos() * lon.cos(),
        )
    }
}

/// View queries needed by the selector.
pub trait View {
    /// Eye position in model coordinates.
    fn eye_point(&self) -> DVec3;

    /// Whether an extent is at least partially inside the view frustum.
    fn intersects_frustum(&self, extent: &Extent) -> bool;
}

/// A view described by an eye point and a model-space frustum.
#[derive(Debug, Clone, Copy)]
pub struct FrustumView {
    pub eye_point: DVec3,
    pub frustum: Frustum,
}

impl FrustumView {
    /// Build a view from an eye point and a view-projection matrix.
    #[must_use]
    pub fn new(eye_point: DVec3, view_projection: DMat4) -> Self {
        Self {
            eye_point,
            frustum: Frustum::from_matrix(view_projection),
        }
    }
}

impl View for FrustumView {
    fn eye_point(&self) -> DVec3 {
        self.eye_point
    }

    fn intersects_frustum(&self, extent: &Extent) -> bool {
        self.frustum.intersects_extent(extent)
    }
}

/// Per-frame state handed to the layer by the renderer.
pub struct DrawContext<'a> {
    pub globe: &'a dyn Globe,
    pub view: &'a dyn View,
    /// Sector of the globe currently in view; `None` means unknown.
    pub visible_sector: Option<Sector>,
    pub vertical_exaggeration: f64,
}

impl<'a> DrawContext<'a> {
    #[must_use]
    pub fn new(globe: &'a dyn Globe, view: &'a dyn View) -> Self {
        Self {
            globe,
            view,
            visible_sector: None,
            vertical_exaggeration: 1.0,
        }
    }

    #[must_use]
    pub fn with_visible_sector(mut self, sector: Sector) -> Self {
        self.visible_sector = Some(sector);
        self
    }

    /// Eye altitude above the globe surface.
    #[must_use]
    pub fn eye_altitude(&self) -> f64 {
        self.globe.altitude_of(self.view.eye_point())
    }
}
