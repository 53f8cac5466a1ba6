//! Source grid geometry and the spatial search that turns it into
//! [`MappingFactors`] for a target grid.
//!
//! Distances are great-circle distances on a sphere. Source points are bucketed
//! into latitude bands; a radius query only scans the bands its latitude range
//! overlaps, and a nearest-neighbour query scans outward from the target's band
//! until no closer point can exist. Because every candidate in a band is checked
//! with the full haversine distance, queries near the antimeridian and the poles
//! need no special handling.
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};
use std::str::FromStr;

use log::debug;
use rayon::prelude::*;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

use crate::config::ConfigError;
use crate::error::TransformError;
use crate::factors::{MappingError, MappingFactors};
use crate::grid::{Grid, GridError};
use crate::source::Hemisphere;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude used to convert a lat-lon resolution into
/// distances
pub const METERS_PER_DEGREE: f64 = 112e3;

const MAX_LAT_BANDS: usize = 3600;

/// Great-circle distance in meters between two points given in degrees.
pub fn great_circle_distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    haversine(lat1, lat1.cos(), lon1.to_radians(), lat2, lat2.cos(), lon2.to_radians())
}

fn haversine(lat1: f64, cos_lat1: f64, lon1: f64, lat2: f64, cos_lat2: f64, lon2: f64) -> f64 {
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + cos_lat1 * cos_lat2 * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Source grid spacing; may be given as a number or a fraction string such as `"1/4"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Resolution(pub f64);

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = if let Some((num, den)) = s.split_once('/') {
            let num: f64 = num.trim().parse().map_err(|_| format!("bad numerator in '{s}'"))?;
            let den: f64 = den.trim().parse().map_err(|_| format!("bad denominator in '{s}'"))?;
            if den == 0.0 {
                return Err(format!("zero denominator in '{s}'"));
            }
            num / den
        } else {
            s.parse().map_err(|_| format!("'{s}' is not a number or fraction"))?
        };
        Ok(Self(value))
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(Self(v)),
            Raw::Text(s) => s.parse().map_err(D::Error::custom),
        }
    }
}

/// How the source grid's `area_extent` coordinates map to longitude and latitude.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Projection {
    /// Coordinates are longitude and latitude in degrees
    #[default]
    LatLon,
    /// Spherical polar stereographic, coordinates in meters
    PolarStereographic {
        /// Latitude of true scale, degrees
        lat_ts: f64,
        /// Longitude pointing "down" from the pole, degrees
        lon_0: f64,
        pole: Hemisphere,
    },
}

fn default_max_lat() -> f64 {
    90.0
}

/// Declarative description of a regular source grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceGridSpec {
    /// Degrees for lat-lon grids, meters for projected ones
    pub resolution: Resolution,
    /// `[x_min, y_min, x_max, y_max]` of the cell edges
    pub area_extent: [f64; 4],
    /// `[nx, ny]`
    pub dims: [usize; 2],
    #[serde(default)]
    pub projection: Projection,
    /// Highest latitude holding data; sets the smallest source spacing of a lat-lon grid
    #[serde(default = "default_max_lat")]
    pub data_max_lat: f64,
}

impl SourceGridSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let [x0, y0, x1, y1] = self.area_extent;
        if !(x1 > x0 && y1 > y0) {
            return Err(ConfigError::invalid(format!(
                "area_extent {:?} must be [x_min, y_min, x_max, y_max] with max > min",
                self.area_extent
            )));
        }
        if self.dims[0] == 0 || self.dims[1] == 0 {
            return Err(ConfigError::invalid("source grid dims must be nonzero"));
        }
        if !(self.resolution.0 > 0.0) {
            return Err(ConfigError::invalid("source grid resolution must be positive"));
        }
        Ok(())
    }

    /// Smallest and largest source cell spacing in meters. For lat-lon grids the
    /// smallest spacing is that of a cell at `data_max_lat`.
    pub fn spacing_bounds(&self) -> (f64, f64) {
        match self.projection {
            Projection::LatLon => {
                let max_l = self.resolution.0 * METERS_PER_DEGREE;
                let min_l = self.data_max_lat.to_radians().cos() * max_l;
                (min_l, max_l)
            }
            Projection::PolarStereographic { .. } => (self.resolution.0, self.resolution.0),
        }
    }

    /// Compute the longitude and latitude of every cell center, row by row
    /// starting at the top (largest y) edge.
    pub fn build(&self) -> Result<SourceGrid, ConfigError> {
        self.validate()?;
        let [x0, y0, x1, y1] = self.area_extent;
        let [nx, ny] = self.dims;
        let dx = (x1 - x0) / nx as f64;
        let dy = (y1 - y0) / ny as f64;

        let mut lons = Vec::with_capacity(nx * ny);
        let mut lats = Vec::with_capacity(nx * ny);
        for j in 0..ny {
            let y = y1 - (j as f64 + 0.5) * dy;
            for i in 0..nx {
                let x = x0 + (i as f64 + 0.5) * dx;
                let (lon, lat) = match self.projection {
                    Projection::LatLon => (x, y),
                    Projection::PolarStereographic { lat_ts, lon_0, pole } => {
                        polar_stereographic_inverse(x, y, lat_ts, lon_0, pole)
                    }
                };
                lons.push(lon);
                lats.push(lat);
            }
        }

        let (min_l, max_l) = self.spacing_bounds();
        Ok(SourceGrid {
            lons,
            lats,
            shape: vec![ny, nx],
            min_l,
            max_l,
        })
    }
}

/// Inverse of the spherical polar stereographic projection; returns (lon, lat) in degrees.
fn polar_stereographic_inverse(x: f64, y: f64, lat_ts: f64, lon_0: f64, pole: Hemisphere) -> (f64, f64) {
    let phi_c = lat_ts.abs().to_radians();
    let k = if (FRAC_PI_2 - phi_c).abs() < 1e-10 {
        2.0 * EARTH_RADIUS_M
    } else {
        EARTH_RADIUS_M * phi_c.cos() / (FRAC_PI_4 - phi_c / 2.0).tan()
    };

    let rho = x.hypot(y);
    let colat = 2.0 * (rho / k).atan();
    let (lat, dlon) = match pole {
        Hemisphere::North => (FRAC_PI_2 - colat, x.atan2(-y)),
        Hemisphere::South => (colat - FRAC_PI_2, x.atan2(y)),
    };
    (normalize_lon(lon_0 + dlon.to_degrees()), lat.to_degrees())
}

fn normalize_lon(lon: f64) -> f64 {
    let l = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if l == -180.0 && lon > 0.0 {
        180.0
    } else {
        l
    }
}

/// Source point coordinates, flattened in the same order as the source field values.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceGrid {
    pub lons: Vec<f64>,
    pub lats: Vec<f64>,
    /// Native shape of the source fields
    pub shape: Vec<usize>,
    /// Smallest source cell spacing in meters
    pub min_l: f64,
    /// Largest source cell spacing in meters
    pub max_l: f64,
}

impl SourceGrid {
    /// An irregular source given directly as points.
    pub fn from_points(lons: Vec<f64>, lats: Vec<f64>, min_l: f64, max_l: f64) -> Self {
        let n = lons.len();
        Self {
            lons,
            lats,
            shape: vec![n],
            min_l,
            max_l,
        }
    }

    pub fn len(&self) -> usize {
        self.lons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lons.is_empty()
    }
}

/// Source points bucketed by latitude, with coordinates pre-converted to radians.
struct LatBandIndex {
    band_width: f64,
    bands: Vec<Vec<usize>>,
    lat: Vec<f64>,
    lon: Vec<f64>,
    cos_lat: Vec<f64>,
}

impl LatBandIndex {
    fn new(source: &SourceGrid, band_width_m: f64) -> Self {
        let width = if band_width_m.is_finite() && band_width_m > 0.0 {
            band_width_m / EARTH_RADIUS_M
        } else {
            PI / MAX_LAT_BANDS as f64
        };
        let n_bands = ((PI / width).ceil() as usize).clamp(1, MAX_LAT_BANDS);

        let mut index = Self {
            band_width: PI / n_bands as f64,
            bands: vec![vec![]; n_bands],
            lat: Vec::with_capacity(source.len()),
            lon: Vec::with_capacity(source.len()),
            cos_lat: Vec::with_capacity(source.len()),
        };

        for (i, (&lon, &lat)) in source.lons.iter().zip(source.lats.iter()).enumerate() {
            let lat = lat.to_radians();
            index.lat.push(lat);
            index.lon.push(lon.to_radians());
            index.cos_lat.push(lat.cos());
            // Source points with no valid location can never be matched
            if lat.is_finite() && lon.is_finite() {
                let b = index.band_of(lat);
                index.bands[b].push(i);
            }
        }
        index
    }

    fn band_of(&self, lat: f64) -> usize {
        let b = ((lat + FRAC_PI_2) / self.band_width).floor();
        (b.max(0.0) as usize).min(self.bands.len() - 1)
    }

    /// Lower bound on the angular distance from `lat` to any point in band `b`
    fn band_gap(&self, b: usize, lat: f64) -> f64 {
        let lo = -FRAC_PI_2 + b as f64 * self.band_width;
        let hi = lo + self.band_width;
        (lo - lat).max(lat - hi).max(0.0)
    }

    fn distance(&self, i: usize, lat: f64, cos_lat: f64, lon: f64) -> f64 {
        haversine(lat, cos_lat, lon, self.lat[i], self.cos_lat[i], self.lon[i])
    }

    /// All source points within `radius` meters, sorted by (distance, index).
    fn within(&self, lat: f64, lon: f64, radius: f64) -> Vec<(f64, usize)> {
        let cos_lat = lat.cos();
        let angle = radius / EARTH_RADIUS_M;
        let lo = self.band_of(lat - angle);
        let hi = self.band_of(lat + angle);

        let mut found = vec![];
        for band in &self.bands[lo..=hi] {
            for &i in band {
                let d = self.distance(i, lat, cos_lat, lon);
                if d <= radius {
                    found.push((d, i));
                }
            }
        }
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        found
    }

    /// The closest source point regardless of distance, or `None` if the index is empty.
    fn nearest(&self, lat: f64, lon: f64) -> Option<(f64, usize)> {
        let cos_lat = lat.cos();
        let b0 = self.band_of(lat) as isize;
        let n = self.bands.len() as isize;
        let mut best: Option<(f64, usize)> = None;

        for k in 0..n {
            let below = b0 - k;
            let above = b0 + k;
            if below < 0 && above >= n {
                break;
            }

            if let Some((best_d, _)) = best {
                let gap = [below, above]
                    .iter()
                    .filter(|&&b| b >= 0 && b < n)
                    .map(|&b| self.band_gap(b as usize, lat))
                    .fold(f64::INFINITY, f64::min);
                if gap * EARTH_RADIUS_M > best_d {
                    break;
                }
            }

            let mut scan = |b: isize| {
                if b < 0 || b >= n {
                    return;
                }
                for &i in &self.bands[b as usize] {
                    let d = self.distance(i, lat, cos_lat, lon);
                    let better = match best {
                        None => true,
                        Some((bd, bi)) => d < bd || (d == bd && i < bi),
                    };
                    if better {
                        best = Some((d, i));
                    }
                }
            };
            scan(below);
            if k > 0 {
                scan(above);
            }
        }
        best
    }
}

/// Computes [`MappingFactors`] from a source grid to a target grid.
#[derive(Debug, Clone, Copy)]
pub struct SpatialIndexBuilder {
    /// Radius matches beyond this many (the farthest ones) are dropped
    pub max_neighbours: usize,
}

impl Default for SpatialIndexBuilder {
    fn default() -> Self {
        Self {
            max_neighbours: crate::config::DEFAULT_MAX_NEIGHBOURS,
        }
    }
}

impl SpatialIndexBuilder {
    pub fn new(max_neighbours: usize) -> Self {
        Self { max_neighbours }
    }

    /// Build factors for a target grid, using its effective radius field.
    pub fn build(&self, source: &SourceGrid, target: &Grid) -> Result<MappingFactors, TransformError> {
        let radius = target.effective_radius().map_err(|e| match e {
            GridError::Unsupported { grid } => TransformError::UnsupportedGrid { grid },
            other => TransformError::mapping_failure(other),
        })?;
        let radius = radius.to_vec();
        self.build_for_points(source, &target.lons_flat(), &target.lats_flat(), &radius)
            .map_err(TransformError::mapping_failure)
    }

    /// Build factors for explicit target points with per-point radii in meters.
    ///
    /// A target whose radius is not finite gets no radius matches and so falls
    /// back to its nearest neighbour.
    pub fn build_for_points(
        &self,
        source: &SourceGrid,
        target_lons: &[f64],
        target_lats: &[f64],
        radius: &[f64],
    ) -> Result<MappingFactors, MappingError> {
        if source.is_empty() {
            return Err(MappingError::EmptySource);
        }
        if target_lons.len() != target_lats.len() || target_lons.len() != radius.len() {
            return Err(MappingError::Inconsistent(format!(
                "{} target longitudes, {} latitudes, {} radii",
                target_lons.len(),
                target_lats.len(),
                radius.len()
            )));
        }

        let index = LatBandIndex::new(source, source.max_l);
        debug!(
            "Indexed {} source points into {} latitude bands for {} targets",
            source.len(),
            index.bands.len(),
            target_lons.len()
        );

        let per_target: Vec<(Vec<usize>, usize)> = (0..target_lons.len())
            .into_par_iter()
            .map(|i| {
                let (lon, lat) = (target_lons[i], target_lats[i]);
                if !lon.is_finite() || !lat.is_finite() {
                    return Err(MappingError::InvalidTargetPoint { index: i, lon, lat });
                }
                let (lat_r, lon_r) = (lat.to_radians(), lon.to_radians());

                let nearest = index
                    .nearest(lat_r, lon_r)
                    .map(|(_, j)| j)
                    .ok_or(MappingError::EmptySource)?;

                let r = radius[i];
                let matches = if r.is_finite() && r >= 0.0 {
                    index
                        .within(lat_r, lon_r, r)
                        .into_iter()
                        .take(self.max_neighbours)
                        .map(|(_, j)| j)
                        .collect()
                } else {
                    vec![]
                };
                Ok((matches, nearest))
            })
            .collect::<Result<Vec<_>, MappingError>>()?;

        let mut factors = MappingFactors {
            source_indices: Vec::with_capacity(per_target.len()),
            counts: Vec::with_capacity(per_target.len()),
            nearest: Vec::with_capacity(per_target.len()),
            n_source: source.len(),
        };
        for (matches, nearest) in per_target {
            factors.counts.push(matches.len());
            factors.source_indices.push(matches);
            factors.nearest.push(nearest);
        }
        Ok(factors)
    }
}
