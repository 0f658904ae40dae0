//! ---
//! cs_section: "03-climate-data"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Conversions between climate types and their capnp readers and builders."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
//! Shared by the navigator and by servers implementing the interfaces.
use capnp::{enum_list, list_list, primitive_list, NotInSchema};
use chrono::{Datelike, NaiveDate};
use cropsim_rpc::{RpcError, RpcResult};
use cropsim_schema::climate_data::Element as WireElement;
use cropsim_schema::{date, geo};

use crate::error::ClimateError;
use crate::types::{Element, GeoCoord, LatLon};

impl Element {
    pub fn from_wire(element: Result<WireElement, NotInSchema>) -> Self {
        match element {
            Ok(WireElement::Tmin) => Element::Tmin,
            Ok(WireElement::Tavg) => Element::Tavg,
            Ok(WireElement::Tmax) => Element::Tmax,
            Ok(WireElement::Precip) => Element::Precip,
            Ok(WireElement::Globrad) => Element::Globrad,
            Ok(WireElement::Wind) => Element::Wind,
            Ok(WireElement::Sunhours) => Element::Sunhours,
            Ok(WireElement::Cloudamount) => Element::Cloudamount,
            Ok(WireElement::Relhumid) => Element::Relhumid,
            Ok(WireElement::Airpress) => Element::Airpress,
            Ok(WireElement::Vaporpress) => Element::Vaporpress,
            Ok(WireElement::Co2) => Element::Co2,
            Ok(WireElement::O3) => Element::O3,
            Ok(WireElement::Et0) => Element::Et0,
            Ok(WireElement::DewpointTemp) => Element::DewpointTemp,
            Ok(WireElement::SpecificHumidity) => Element::SpecificHumidity,
            Ok(WireElement::SnowfallFlux) => Element::SnowfallFlux,
            Ok(WireElement::SurfaceDownwellingLongwaveRadiation) => {
                Element::SurfaceDownwellingLongwaveRadiation
            }
            Ok(WireElement::PotEt) => Element::PotEt,
            Err(NotInSchema(ordinal)) => Element::Other(ordinal),
        }
    }

    /// Fails for [`Element::Other`], which has no schema value to send.
    pub fn to_wire(self) -> Result<WireElement, ClimateError> {
        Ok(match self {
            Element::Tmin => WireElement::Tmin,
            Element::Tavg => WireElement::Tavg,
            Element::Tmax => WireElement::Tmax,
            Element::Precip => WireElement::Precip,
            Element::Globrad => WireElement::Globrad,
            Element::Wind => WireElement::Wind,
            Element::Sunhours => WireElement::Sunhours,
            Element::Cloudamount => WireElement::Cloudamount,
            Element::Relhumid => WireElement::Relhumid,
            Element::Airpress => WireElement::Airpress,
            Element::Vaporpress => WireElement::Vaporpress,
            Element::Co2 => WireElement::Co2,
            Element::O3 => WireElement::O3,
            Element::Et0 => WireElement::Et0,
            Element::DewpointTemp => WireElement::DewpointTemp,
            Element::SpecificHumidity => WireElement::SpecificHumidity,
            Element::SnowfallFlux => WireElement::SnowfallFlux,
            Element::SurfaceDownwellingLongwaveRadiation => {
                WireElement::SurfaceDownwellingLongwaveRadiation
            }
            Element::PotEt => WireElement::PotEt,
            Element::Other(ordinal) => return Err(ClimateError::UnknownElement(ordinal)),
        })
    }
}

pub fn read_header(list: enum_list::Reader<'_, WireElement>) -> Vec<Element> {
    list.iter().map(Element::from_wire).collect()
}

/// Convert every element before touching the builder.
pub fn encode_header(header: &[Element]) -> Result<Vec<WireElement>, ClimateError> {
    header.iter().map(|element| element.to_wire()).collect()
}

pub fn write_header(mut list: enum_list::Builder<'_, WireElement>, header: &[WireElement]) {
    for (index, element) in header.iter().enumerate() {
        list.set(index as u32, *element);
    }
}

pub fn read_matrix(
    rows: list_list::Reader<'_, primitive_list::Owned<f32>>,
) -> RpcResult<Vec<Vec<f32>>> {
    rows.iter()
        .map(|row| -> RpcResult<Vec<f32>> { Ok(row?.iter().collect()) })
        .collect()
}

pub fn write_matrix(mut builder: list_list::Builder<'_, primitive_list::Owned<f32>>, rows: &[Vec<f32>]) {
    for (index, row) in rows.iter().enumerate() {
        let mut out = builder.reborrow().init(index as u32, row.len() as u32);
        for (col, value) in row.iter().enumerate() {
            out.set(col as u32, *value);
        }
    }
}

pub fn read_coord(reader: geo::coord::Reader<'_>) -> RpcResult<GeoCoord> {
    match reader.which()? {
        geo::coord::Which::Latlon(latlon) => {
            let latlon = latlon?;
            LatLon::new(latlon.get_lat(), latlon.get_lon())
                .map(GeoCoord::LatLon)
                .map_err(RpcError::from)
        }
        geo::coord::Which::Utm(_) => Err(RpcError::payload("UTM coordinates are not supported")),
    }
}

pub fn write_coord(builder: geo::coord::Builder<'_>, coord: &GeoCoord) {
    let ll = coord.as_lat_lon();
    let mut latlon = builder.init_latlon();
    latlon.set_lat(ll.lat());
    latlon.set_lon(ll.lon());
}

pub fn read_date(reader: date::Reader<'_>) -> RpcResult<NaiveDate> {
    let (year, month, day) = (reader.get_year(), reader.get_month(), reader.get_day());
    NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
        .ok_or_else(|| RpcError::payload(format!("invalid date {year}-{month}-{day}")))
}

pub fn write_date(mut builder: date::Builder<'_>, value: NaiveDate) {
    builder.set_year(value.year() as i16);
    builder.set_month(value.month() as u8);
    builder.set_day(value.day() as u8);
}
