//! Core listing model, identity keys and search profiles for aptwatch.

use std::fmt;

use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "aptwatch-core";

/// Separates identity fields so a boundary shift between them cannot collide.
const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListingError {
    #[error("malformed listing: missing or blank `{field}`")]
    MalformedListing { field: &'static str },
}

/// Stable "same listing" key built from address, price and availability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Validating constructor used wherever a record enters the system.
    pub fn from_fields(
        address: Option<&str>,
        price: Option<&str>,
        availability: Option<&str>,
    ) -> Result<Self, ListingError> {
        let address = required("address", address)?;
        let price = required("price", price)?;
        let availability = required("availability", availability)?;
        Ok(Self::join(address, price, availability))
    }

    fn join(address: &str, price: &str, availability: &str) -> Self {
        let mut key = String::with_capacity(address.len() + price.len() + availability.len() + 2);
        key.push_str(address);
        key.push(KEY_SEPARATOR);
        key.push_str(price);
        key.push(KEY_SEPARATOR);
        key.push_str(availability);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short hex digest, safe to put in a URL.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..8])
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = self.0.split(KEY_SEPARATOR);
        let address = parts.next().unwrap_or_default();
        let price = parts.next().unwrap_or_default();
        let availability = parts.next().unwrap_or_default();
        write!(f, "{address} | {price} | {availability}")
    }
}

fn required<'a>(field: &'static str, value: Option<&'a str>) -> Result<&'a str, ListingError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ListingError::MalformedListing { field }),
    }
}

/// Unvalidated record as it comes off a parser or out of a snapshot file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub address: Option<String>,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub keyword: String,
    pub availability: Option<String>,
    #[serde(default)]
    pub beds: String,
    pub price: Option<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub link: String,
    pub time: f64,
}

/// One rental search result. The field names double as the snapshot JSON
/// format and must not be renamed.
///
/// Scrapes and snapshot loads go through [`RawListing`], which rejects a
/// record missing any identity field. Fields are public, so a struct literal
/// can still hold blanks; [`Listing::validate`] catches those before a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawListing")]
pub struct Listing {
    pub address: String,
    pub zip: String,
    pub keyword: String,
    pub availability: String,
    pub beds: String,
    pub price: String,
    pub image: String,
    pub phone: String,
    pub link: String,
    /// Seconds since epoch at first observation.
    pub time: f64,
}

impl TryFrom<RawListing> for Listing {
    type Error = ListingError;

    fn try_from(raw: RawListing) -> Result<Self, Self::Error> {
        IdentityKey::from_fields(
            raw.address.as_deref(),
            raw.price.as_deref(),
            raw.availability.as_deref(),
        )?;
        Ok(Self {
            address: raw.address.unwrap_or_default(),
            zip: raw.zip,
            keyword: raw.keyword,
            availability: raw.availability.unwrap_or_default(),
            beds: raw.beds,
            price: raw.price.unwrap_or_default(),
            image: raw.image,
            phone: raw.phone,
            link: raw.link,
            time: raw.time,
        })
    }
}

impl Listing {
    pub fn validate(&self) -> Result<(), ListingError> {
        IdentityKey::from_fields(
            Some(self.address.as_str()),
            Some(self.price.as_str()),
            Some(self.availability.as_str()),
        )
        .map(|_| ())
    }

    /// Identity depends on address, price and availability only.
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::join(&self.address, &self.price, &self.availability)
    }

    pub fn captured_at(&self) -> Option<DateTime<Local>> {
        let secs = self.time.trunc() as i64;
        let nanos = (self.time.fract() * 1e9) as u32;
        Local.timestamp_opt(secs, nanos).single()
    }
}

/// Sorts newest capture first; the order used for display and notification.
pub fn sort_newest_first(listings: &mut [Listing]) {
    listings.sort_by(|a, b| b.time.total_cmp(&a.time));
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub upper_left: GeoPoint,
    pub lower_right: GeoPoint,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            upper_left: GeoPoint {
                lat: 42.36808,
                lng: -71.11593,
            },
            lower_right: GeoPoint {
                lat: 42.33751,
                lng: -71.05413,
            },
        }
    }
}

fn default_center() -> GeoPoint {
    GeoPoint {
        lat: 42.351,
        lng: -71.094,
    }
}

/// A named keyword search; one notification stream per profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchProfile {
    pub name: String,
    pub keywords: Vec<String>,
    pub min_price: u32,
    pub max_price: u32,
    pub min_beds: u32,
    #[serde(default)]
    pub max_beds: Option<u32>,
    #[serde(default)]
    pub bounding_box: BoundingBox,
    #[serde(default = "default_center")]
    pub center: GeoPoint,
}

impl SearchProfile {
    pub fn max_beds(&self) -> u32 {
        self.max_beds.unwrap_or(self.min_beds + 2)
    }

    pub fn keywords_joined(&self) -> String {
        self.keywords.join(", ")
    }
}

/// Metadata handed to notification and rendering alongside new listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub search: SearchProfile,
    pub total_current_count: usize,
    pub new_count: usize,
}

/// `1625140800.0` -> `Jul 01, 2021 at 12:00PM` in local time.
pub fn format_capture_time(listing: &Listing) -> String {
    listing
        .captured_at()
        .map(|t| t.format("%b %d, %Y at %I:%M%p").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

const NEIGHBORHOODS: &[(&str, &str)] = &[
    ("02109", "North End"),
    ("02113", "North End"),
    ("02114", "West End / Beacon Hill"),
    ("02115", "Symphony / Back Bay / Longwood Medical"),
    ("02116", "Back Bay / Bay Village"),
    ("02118", "South End / Shumwut / South of Washington"),
    ("02120", "Mission Hill"),
    ("02139", "Cambridgeport"),
    ("02180", "Beacon Hill / Government Center"),
    ("02215", "Fenway / Kenmore / Longwood Medical"),
    ("02445", "Brookline"),
    ("02446", "North Brookline / Coolidge"),
];

/// `Boston, MA 02120` -> `02120 - Mission Hill`. Unknown zips fall back to
/// the full text.
pub fn neighborhood_label(zip_text: &str) -> String {
    let zip = zip_text.split(' ').next_back().unwrap_or_default();
    let name = NEIGHBORHOODS
        .iter()
        .find(|(code, _)| *code == zip)
        .map(|(_, name)| *name)
        .unwrap_or(zip_text);
    format!("{zip} - {name}")
}
