//! ---
//! cs_section: "03-climate-data"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Coordinates, metadata records and time-series values."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::str::FromStr;

use chrono::NaiveDate;
pub use cropsim_rpc::IdInfo;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::ClimateError;

const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Latitude/longitude pair in degrees, validated on construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLatLon")]
pub struct LatLon {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
struct RawLatLon {
    lat: f64,
    lon: f64,
}

impl TryFrom<RawLatLon> for LatLon {
    type Error = ClimateError;

    fn try_from(raw: RawLatLon) -> Result<Self, Self::Error> {
        LatLon::new(raw.lat, raw.lon)
    }
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Result<Self, ClimateError> {
        let valid = (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon);
        if !valid {
            return Err(ClimateError::InvalidCoordinate { lat, lon });
        }
        Ok(Self { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }
}

/// Geographic coordinate. Only the lat/lon representation is supported.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoCoord {
    LatLon(LatLon),
}

impl GeoCoord {
    pub fn lat_lon(lat: f64, lon: f64) -> Result<Self, ClimateError> {
        Ok(GeoCoord::LatLon(LatLon::new(lat, lon)?))
    }

    pub fn as_lat_lon(&self) -> LatLon {
        match self {
            GeoCoord::LatLon(ll) => *ll,
        }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &GeoCoord) -> f64 {
        let a = self.as_lat_lon();
        let b = other.as_lat_lon();
        let (phi1, phi2) = (a.lat.to_radians(), b.lat.to_radians());
        let dphi = (b.lat - a.lat).to_radians();
        let dlambda = (b.lon - a.lon).to_radians();
        let h = (dphi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
    }
}

impl std::fmt::Display for GeoCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ll = self.as_lat_lon();
        write!(f, "{:.5},{:.5}", ll.lat, ll.lon)
    }
}

pub type SimulationInfo = IdInfo;
pub type ScenarioInfo = IdInfo;
pub type RealizationInfo = IdInfo;

/// Inclusive date span covered by a time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl DateRange {
    /// Number of days in the range, both ends included.
    pub fn days(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }
}

/// Climate variable carried by a time-series column.
///
/// Services may publish elements newer than this build knows about; those
/// keep their wire ordinal in [`Element::Other`] so headers stay complete
/// and columns stay addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub enum Element {
    Tmin,
    Tavg,
    Tmax,
    Precip,
    Globrad,
    Wind,
    Sunhours,
    Cloudamount,
    Relhumid,
    Airpress,
    Vaporpress,
    Co2,
    O3,
    Et0,
    DewpointTemp,
    SpecificHumidity,
    SnowfallFlux,
    SurfaceDownwellingLongwaveRadiation,
    PotEt,
    /// Element outside the known set, by wire ordinal.
    Other(u16),
}

const ELEMENT_NAMES: [(Element, &str); 19] = [
    (Element::Tmin, "tmin"),
    (Element::Tavg, "tavg"),
    (Element::Tmax, "tmax"),
    (Element::Precip, "precip"),
    (Element::Globrad, "globrad"),
    (Element::Wind, "wind"),
    (Element::Sunhours, "sunhours"),
    (Element::Cloudamount, "cloudamount"),
    (Element::Relhumid, "relhumid"),
    (Element::Airpress, "airpress"),
    (Element::Vaporpress, "vaporpress"),
    (Element::Co2, "co2"),
    (Element::O3, "o3"),
    (Element::Et0, "et0"),
    (Element::DewpointTemp, "dewpointTemp"),
    (Element::SpecificHumidity, "specificHumidity"),
    (Element::SnowfallFlux, "snowfallFlux"),
    (Element::SurfaceDownwellingLongwaveRadiation, "surfaceDownwellingLongwaveRadiation"),
    (Element::PotEt, "potET"),
];

const OTHER_PREFIX: &str = "element#";

impl Element {
    /// Wire name of a known element.
    pub fn name(&self) -> Option<&'static str> {
        ELEMENT_NAMES
            .iter()
            .find(|(element, _)| element == self)
            .map(|(_, name)| *name)
    }
}

impl std::fmt::Display for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self, self.name()) {
            (_, Some(name)) => f.write_str(name),
            (Element::Other(ordinal), None) => write!(f, "{OTHER_PREFIX}{ordinal}"),
            (element, None) => write!(f, "{element:?}"),
        }
    }
}

impl FromStr for Element {
    type Err = ClimateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((element, _)) = ELEMENT_NAMES.iter().find(|(_, name)| *name == s) {
            return Ok(*element);
        }
        s.strip_prefix(OTHER_PREFIX)
            .and_then(|ordinal| ordinal.parse().ok())
            .map(Element::Other)
            .ok_or_else(|| ClimateError::UnknownElementName(s.to_owned()))
    }
}

/// Column-major view of row-major data.
pub fn transpose(rows: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let width = rows.first().map_or(0, Vec::len);
    (0..width)
        .map(|col| rows.iter().filter_map(|row| row.get(col).copied()).collect())
        .collect()
}

/// Check that `data_t` is the transpose of `data`.
pub fn ensure_consistent(data: &[Vec<f32>], data_t: &[Vec<f32>]) -> Result<(), ClimateError> {
    if let Some(row) = data.iter().position(|row| row.len() != data_t.len()) {
        return Err(ClimateError::Inconsistent(format!(
            "row {} has {} values but there are {} columns",
            row,
            data[row].len(),
            data_t.len()
        )));
    }
    for (col, column) in data_t.iter().enumerate() {
        if column.len() != data.len() {
            return Err(ClimateError::Inconsistent(format!(
                "column {} has {} values but there are {} rows",
                col,
                column.len(),
                data.len()
            )));
        }
        let mismatch = data
            .iter()
            .zip(column)
            .position(|(row, value)| row[col].to_bits() != value.to_bits());
        if let Some(row) = mismatch {
            return Err(ClimateError::Inconsistent(format!(
                "data[{}][{}] differs from dataT[{}][{}]",
                row, col, col, row
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_outside_range_are_rejected() {
        assert!(GeoCoord::lat_lon(46.51412, 12.81895).is_ok());
        assert!(GeoCoord::lat_lon(90.5, 0.0).is_err());
        assert!(GeoCoord::lat_lon(0.0, -180.1).is_err());
        assert!(matches!(
            GeoCoord::lat_lon(f64::NAN, 0.0),
            Err(ClimateError::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn deserialization_validates_coordinates() {
        let ok: GeoCoord =
            serde_json::from_str(r#"{"latlon":{"lat":51.18323,"lon":2.84376}}"#).expect("valid");
        assert_eq!(ok.as_lat_lon().lat(), 51.18323);
        let bad = serde_json::from_str::<GeoCoord>(r#"{"latlon":{"lat":123.0,"lon":2.0}}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_identity() {
        let a = GeoCoord::lat_lon(46.51412, 12.81895).expect("a");
        let b = GeoCoord::lat_lon(51.18323, 2.84376).expect("b");
        assert!(a.distance_km(&a) < 1e-9);
        let ab = a.distance_km(&b);
        assert!((ab - b.distance_km(&a)).abs() < 1e-9);
        assert!(ab > 700.0 && ab < 1000.0, "unexpected distance {ab}");
    }

    #[test]
    fn transpose_matches_consistency_check() {
        let data = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let data_t = transpose(&data);
        assert_eq!(data_t, vec![vec![1.0, 4.0], vec![2.0, 5.0], vec![3.0, 6.0]]);
        assert!(ensure_consistent(&data, &data_t).is_ok());

        let mut broken = data_t.clone();
        broken[1][0] = 9.0;
        assert!(ensure_consistent(&data, &broken).is_err());
        assert!(ensure_consistent(&[], &[]).is_ok());
    }

    #[test]
    fn elements_use_wire_names() {
        assert_eq!(Element::PotEt.to_string(), "potET");
        assert_eq!("dewpointTemp".parse::<Element>().ok(), Some(Element::DewpointTemp));
        let parsed: Vec<Element> =
            serde_json::from_str(r#"["tavg","precip","element#42"]"#).expect("elements");
        assert_eq!(parsed, vec![Element::Tavg, Element::Precip, Element::Other(42)]);
    }

    #[test]
    fn unlisted_elements_keep_their_identity() {
        let header = vec![Element::Other(40), Element::Tavg, Element::Other(41)];
        assert_ne!(header[0], header[2]);
        assert_eq!(header[2].to_string(), "element#41");
        assert_eq!("element#41".parse::<Element>().ok(), Some(Element::Other(41)));
        assert_eq!(serde_json::to_string(&header).expect("json"), r#"["element#40","tavg","element#41"]"#);
        assert!(matches!(
            "somethingNew".parse::<Element>(),
            Err(ClimateError::UnknownElementName(name)) if name == "somethingNew"
        ));
    }
}
