//! Great-circle distance and coarse proximity bucketing
//!
//! Buckets are fixed-precision `"lat,lon"` strings meant to be stored on an
//! item (for example as a GSI partition key) and queried with
//! [`proximity_buckets`]. Bucketing is a pre-filter: results fetched through
//! it still need a [`haversine_distance_km`] check against the radius.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::Error;

/// Mean Earth radius used by [`haversine_distance_km`]
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Approximate length of one degree of latitude
pub const KM_PER_DEGREE_LATITUDE: f64 = 111.32;

/// A WGS84 coordinate in degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Degrees north, `-90..=90`
    pub latitude: f64,
    /// Degrees east, `-180..=180`
    pub longitude: f64,
}

impl GeoPoint {
    /// Checked constructor; rejects non-finite or out-of-range coordinates
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, Error> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::InvalidArgument(format!(
                "latitude {latitude} outside [-90, 90]"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::InvalidArgument(format!(
                "longitude {longitude} outside [-180, 180]"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Distance to `other` in kilometres
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        haversine_distance_km(*self, *other)
    }
}

/// Great-circle distance in kilometres
pub fn haversine_distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * c
}

/// Most decimals a bucket key carries; about 11 µm of latitude
pub const MAX_BUCKET_PRECISION: usize = 10;

/// Bucket string for `point`: both coordinates with `precision` decimals
///
/// `precision` is capped at [`MAX_BUCKET_PRECISION`].
pub fn bucket_key(point: GeoPoint, precision: usize) -> String {
    let precision = precision.min(MAX_BUCKET_PRECISION);
    format!(
        "{:.prec$},{:.prec$}",
        point.latitude,
        point.longitude,
        prec = precision
    )
}

fn clamp_latitude(latitude: f64) -> f64 {
    latitude.clamp(-90.0, 90.0)
}

fn wrap_longitude(longitude: f64) -> f64 {
    if (-180.0..=180.0).contains(&longitude) {
        longitude
    } else {
        (longitude + 180.0).rem_euclid(360.0) - 180.0
    }
}

/// Longitude half-width in degrees for `radius_km` at `latitude`, at most 180
fn longitude_range(latitude: f64, radius_km: f64) -> f64 {
    let scale = latitude.to_radians().cos().max(f64::EPSILON);
    (radius_km / (KM_PER_DEGREE_LATITUDE * scale)).min(180.0)
}

/// Buckets overlapping a `radius_km` box around `center`, center bucket first
///
/// Walks a 5 x 5 grid over the box with half-range steps. Latitudes are
/// clamped to the poles and longitudes wrap across the antimeridian, so the
/// coverage is approximate at high latitudes. A non-positive or non-finite
/// radius yields only the center bucket.
pub fn proximity_buckets(center: GeoPoint, radius_km: f64, precision: usize) -> Vec<String> {
    let center_key = bucket_key(center, precision);
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return vec![center_key];
    }

    let lat_step = radius_km / KM_PER_DEGREE_LATITUDE / 2.0;
    let lon_step = longitude_range(center.latitude, radius_km) / 2.0;

    let mut seen = HashSet::from([center_key.clone()]);
    let mut buckets = vec![center_key];

    for i in -2i32..=2 {
        for j in -2i32..=2 {
            let point = GeoPoint {
                latitude: clamp_latitude(center.latitude + f64::from(i) * lat_step),
                longitude: wrap_longitude(center.longitude + f64::from(j) * lon_step),
            };
            let key = bucket_key(point, precision);
            if seen.insert(key.clone()) {
                buckets.push(key);
            }
        }
    }

    buckets
}

/// Latitude/longitude rectangle
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    /// Southern edge
    pub min_latitude: f64,
    /// Northern edge
    pub max_latitude: f64,
    /// Western edge
    pub min_longitude: f64,
    /// Eastern edge
    pub max_longitude: f64,
}

impl BoundingBox {
    /// Box reaching `radius_km` from `center` along both axes
    ///
    /// Latitudes are clamped to the poles; longitudes are not wrapped, so a box
    /// crossing the antimeridian extends past ±180.
    pub fn around(center: GeoPoint, radius_km: f64) -> Self {
        let lat_offset = radius_km.max(0.0) / KM_PER_DEGREE_LATITUDE;
        let lon_offset = longitude_range(center.latitude, radius_km.max(0.0));

        Self {
            min_latitude: clamp_latitude(center.latitude - lat_offset),
            max_latitude: clamp_latitude(center.latitude + lat_offset),
            min_longitude: center.longitude - lon_offset,
            max_longitude: center.longitude + lon_offset,
        }
    }

    /// Inclusive containment test
    pub fn contains(&self, point: GeoPoint) -> bool {
        (self.min_latitude..=self.max_latitude).contains(&point.latitude)
            && (self.min_longitude..=self.max_longitude).contains(&point.longitude)
    }

    /// Midpoint of the box
    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            latitude: (self.min_latitude + self.max_latitude) / 2.0,
            longitude: (self.min_longitude + self.max_longitude) / 2.0,
        }
    }
}

/// Anything with a position
pub trait Located {
    /// Position of the item
    fn location(&self) -> GeoPoint;
}

impl Located for GeoPoint {
    fn location(&self) -> GeoPoint {
        *self
    }
}

/// Keep the items within `radius_km` of `center`, in their original order
pub fn filter_by_distance<T: Located>(items: Vec<T>, center: GeoPoint, radius_km: f64) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| haversine_distance_km(center, item.location()) <= radius_km)
        .collect()
}

/// Sort items nearest first
pub fn sort_by_distance<T: Located>(items: &mut [T], center: GeoPoint) {
    items.sort_by(|a, b| {
        haversine_distance_km(center, a.location())
            .total_cmp(&haversine_distance_km(center, b.location()))
    });
}

/// Standard base-32 geohash
pub mod geohash {
    use super::{BoundingBox, GeoPoint, wrap_longitude};
    use crate::Error;

    const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

    /// Longest hash produced by [`encode`]
    pub const MAX_PRECISION: usize = 12;

    /// Geohash of `point` with `precision` characters, clamped to `1..=12`
    pub fn encode(point: GeoPoint, precision: usize) -> String {
        let precision = precision.clamp(1, MAX_PRECISION);
        let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
        let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);

        let mut hash = String::with_capacity(precision);
        let mut even = true;

        while hash.len() < precision {
            let mut index = 0usize;
            for _ in 0..5 {
                let (value, lo, hi) = if even {
                    (point.longitude, &mut lon_lo, &mut lon_hi)
                } else {
                    (point.latitude, &mut lat_lo, &mut lat_hi)
                };
                let mid = (*lo + *hi) / 2.0;
                if value >= mid {
                    index = (index << 1) | 1;
                    *lo = mid;
                } else {
                    index <<= 1;
                    *hi = mid;
                }
                even = !even;
            }
            hash.push(char::from(BASE32[index]));
        }

        hash
    }

    /// Cell covered by `hash`
    pub fn decode_bounds(hash: &str) -> Result<BoundingBox, Error> {
        if hash.is_empty() {
            return Err(Error::InvalidArgument("empty geohash".to_string()));
        }

        let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
        let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);
        let mut even = true;

        for c in hash.chars() {
            let index = BASE32
                .iter()
                .position(|b| char::from(*b) == c.to_ascii_lowercase())
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("invalid geohash character {c:?} in {hash:?}"))
                })?;

            for shift in (0..5).rev() {
                let bit = (index >> shift) & 1 == 1;
                let (lo, hi) = if even {
                    (&mut lon_lo, &mut lon_hi)
                } else {
                    (&mut lat_lo, &mut lat_hi)
                };
                let mid = (*lo + *hi) / 2.0;
                if bit {
                    *lo = mid;
                } else {
                    *hi = mid;
                }
                even = !even;
            }
        }

        Ok(BoundingBox {
            min_latitude: lat_lo,
            max_latitude: lat_hi,
            min_longitude: lon_lo,
            max_longitude: lon_hi,
        })
    }

    /// The adjacent cells of `hash`: N, NE, E, SE, S, SW, W, NW
    ///
    /// Cells beyond a pole are omitted; longitudes wrap across the antimeridian.
    pub fn neighbors(hash: &str) -> Result<Vec<String>, Error> {
        let cell = decode_bounds(hash)?;
        let center = cell.center();
        let height = cell.max_latitude - cell.min_latitude;
        let width = cell.max_longitude - cell.min_longitude;
        let precision = hash.chars().count();

        const DIRECTIONS: [(f64, f64); 8] = [
            (1.0, 0.0),
            (1.0, 1.0),
            (0.0, 1.0),
            (-1.0, 1.0),
            (-1.0, 0.0),
            (-1.0, -1.0),
            (0.0, -1.0),
            (1.0, -1.0),
        ];

        let own = hash.to_ascii_lowercase();
        let mut neighbors = Vec::with_capacity(DIRECTIONS.len());
        for (d_lat, d_lon) in DIRECTIONS {
            let latitude = center.latitude + d_lat * height;
            if !(-90.0..=90.0).contains(&latitude) {
                continue;
            }
            let point = GeoPoint {
                latitude,
                longitude: wrap_longitude(center.longitude + d_lon * width),
            };
            let neighbor = encode(point, precision);
            if neighbor != own && !neighbors.contains(&neighbor) {
                neighbors.push(neighbor);
            }
        }

        Ok(neighbors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEOUL: GeoPoint = GeoPoint {
        latitude: 37.5665,
        longitude: 126.9780,
    };
    const BUSAN: GeoPoint = GeoPoint {
        latitude: 35.1796,
        longitude: 129.0756,
    };

    #[test]
    fn test_seoul_to_busan() {
        let distance = haversine_distance_km(SEOUL, BUSAN);
        assert!((distance - 325.0).abs() < 5.0, "{distance}");
    }

    #[test]
    fn test_distance_symmetry_and_identity() {
        assert_eq!(haversine_distance_km(SEOUL, SEOUL), 0.0);
        let there = haversine_distance_km(SEOUL, BUSAN);
        let back = haversine_distance_km(BUSAN, SEOUL);
        assert!((there - back).abs() < 1e-9);
        assert!((SEOUL.distance_km(&BUSAN) - there).abs() < 1e-9);
    }

    #[test]
    fn test_distance_is_a_metric() {
        let points = [
            SEOUL,
            BUSAN,
            GeoPoint { latitude: 0.0, longitude: 0.0 },
            GeoPoint { latitude: 90.0, longitude: 0.0 },
            GeoPoint { latitude: -90.0, longitude: 45.0 },
            GeoPoint { latitude: 10.0, longitude: 179.9 },
            GeoPoint { latitude: -10.0, longitude: -179.9 },
            GeoPoint { latitude: -33.8688, longitude: 151.2093 },
            GeoPoint { latitude: 51.5074, longitude: -0.1278 },
        ];

        for a in points {
            assert_eq!(haversine_distance_km(a, a), 0.0);
            for b in points {
                let ab = haversine_distance_km(a, b);
                assert!(ab >= 0.0);
                assert!(ab <= std::f64::consts::PI * EARTH_RADIUS_KM + 1e-6);
                assert!((ab - haversine_distance_km(b, a)).abs() < 1e-9);

                for c in points {
                    let via = haversine_distance_km(a, c) + haversine_distance_km(c, b);
                    assert!(ab <= via + 1e-6, "{a:?} {b:?} via {c:?}: {ab} > {via}");
                }
            }
        }
    }

    #[test]
    fn test_bucket_precision_is_capped() {
        assert_eq!(bucket_key(SEOUL, usize::MAX), bucket_key(SEOUL, MAX_BUCKET_PRECISION));
        assert_eq!(bucket_key(SEOUL, 1_000), "37.5665000000,126.9780000000");
        assert_eq!(proximity_buckets(SEOUL, 0.0, 64), vec![bucket_key(SEOUL, 10)]);
    }

    #[test]
    fn test_point_validation() {
        assert!(GeoPoint::new(37.5, 127.0).is_ok());
        assert!(GeoPoint::new(90.0, -180.0).is_ok());
        assert!(GeoPoint::new(90.1, 0.0).is_err());
        assert!(GeoPoint::new(0.0, 180.5).is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_bucket_key_format() {
        assert_eq!(bucket_key(SEOUL, 2), "37.57,126.98");
        assert_eq!(bucket_key(SEOUL, 0), "38,127");
    }

    #[test]
    fn test_zero_radius_is_center_bucket() {
        for radius in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            assert_eq!(proximity_buckets(SEOUL, radius, 3), vec![bucket_key(SEOUL, 3)]);
        }
    }

    #[test]
    fn test_buckets_are_unique_and_start_at_center() {
        let buckets = proximity_buckets(SEOUL, 10.0, 2);
        assert_eq!(buckets[0], bucket_key(SEOUL, 2));
        assert!(buckets.len() > 1 && buckets.len() <= 25);

        let unique: HashSet<&String> = buckets.iter().collect();
        assert_eq!(unique.len(), buckets.len());
    }

    #[test]
    fn test_coarse_precision_collapses_grid() {
        let buckets = proximity_buckets(SEOUL, 1.0, 0);
        assert_eq!(buckets, vec!["38,127".to_string()]);
    }

    #[test]
    fn test_buckets_near_pole_and_antimeridian() {
        let pole = GeoPoint {
            latitude: 89.99,
            longitude: 179.99,
        };
        let buckets = proximity_buckets(pole, 50.0, 1);
        for bucket in &buckets {
            let (lat, lon) = bucket.split_once(',').unwrap();
            let lat: f64 = lat.parse().unwrap();
            let lon: f64 = lon.parse().unwrap();
            assert!((-90.0..=90.0).contains(&lat), "{bucket}");
            assert!((-180.0..=180.0).contains(&lon), "{bucket}");
        }
    }

    #[test]
    fn test_bounding_box() {
        let bbox = BoundingBox::around(SEOUL, 10.0);
        assert!(bbox.contains(SEOUL));
        assert!(!bbox.contains(BUSAN));
        let center = bbox.center();
        assert!((center.latitude - SEOUL.latitude).abs() < 1e-9);
        assert!((center.longitude - SEOUL.longitude).abs() < 1e-9);
    }

    #[test]
    fn test_filter_and_sort_by_distance() {
        let incheon = GeoPoint {
            latitude: 37.4563,
            longitude: 126.7052,
        };
        let mut points = vec![BUSAN, SEOUL, incheon];

        sort_by_distance(&mut points, SEOUL);
        assert_eq!(points, vec![SEOUL, incheon, BUSAN]);

        let nearby = filter_by_distance(points, SEOUL, 50.0);
        assert_eq!(nearby, vec![SEOUL, incheon]);
    }

    #[test]
    fn test_geohash_encode() {
        let point = GeoPoint {
            latitude: 57.64911,
            longitude: 10.40744,
        };
        assert_eq!(geohash::encode(point, 11), "u4pruydqqvj");
        assert_eq!(geohash::encode(SEOUL, 6), "wydm9q");
        assert_eq!(geohash::encode(SEOUL, 40).len(), geohash::MAX_PRECISION);
    }

    #[test]
    fn test_geohash_decode_contains_point() {
        let bounds = geohash::decode_bounds("wydm9q").unwrap();
        assert!(bounds.contains(SEOUL));
        assert!(geohash::decode_bounds("").is_err());
        assert!(geohash::decode_bounds("wyda").is_err());
    }

    #[test]
    fn test_geohash_neighbors() {
        let neighbors = geohash::neighbors("ezs42").unwrap();
        assert_eq!(
            neighbors,
            vec!["ezs48", "ezs49", "ezs43", "ezs41", "ezs40", "ezefp", "ezefr", "ezefx"]
        );
    }
}
