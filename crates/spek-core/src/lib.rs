//! Core domain model for spekkoper: saved queries, marketplace listings and
//! the event announced the first time a query sees a listing.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "spek-core";

/// Opaque identifier of a saved query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    pub const ENTROPY_BYTES: usize = 6;

    /// Fresh random id: 6 bytes of entropy, URL-safe base64 without padding.
    /// Collisions are not checked.
    pub fn generate() -> Self {
        let mut data = [0u8; Self::ENTROPY_BYTES];
        rand::thread_rng().fill_bytes(&mut data);
        Self(URL_SAFE_NO_PAD.encode(data))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for QueryId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for QueryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("sub_category {0} requires a category")]
    SubCategoryWithoutCategory(u32),
    #[error("distance_meters {0} requires a postcode")]
    DistanceWithoutPostcode(u32),
    #[error("postcode {0:?} may only contain letters, digits and spaces")]
    MalformedPostcode(String),
    #[error("invalid marketplace url: {0}")]
    InvalidUrl(String),
}

/// Search definition of a saved query. Empty strings, `None`, zero and empty
/// lists mean "no filter".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub query: String,
    pub category: Option<u32>,
    pub sub_category: Option<u32>,
    pub postcode: String,
    pub distance_meters: Option<u32>,
    pub attributes_by_id: Vec<u32>,
    pub include_commercials: bool,
}

impl SearchParams {
    /// Rejects filters that only make sense together with another one. Zero
    /// values are unset filters and never rejected.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(sub) = self.sub_category.filter(|c| *c > 0) {
            if self.category.unwrap_or(0) == 0 {
                return Err(ValidationError::SubCategoryWithoutCategory(sub));
            }
        }
        if let Some(distance) = self.distance_meters.filter(|d| *d > 0) {
            if self.postcode.trim().is_empty() {
                return Err(ValidationError::DistanceWithoutPostcode(distance));
            }
        }
        if !self
            .postcode
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ')
        {
            return Err(ValidationError::MalformedPostcode(self.postcode.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    #[serde(flatten)]
    pub params: SearchParams,
    pub created_at: DateTime<Utc>,
}

impl Query {
    pub fn new(params: SearchParams) -> Self {
        Self {
            id: QueryId::generate(),
            params,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceType {
    Fixed,
    Bid,
    FastBid,
    MinBid,
    SeeDescription,
    OnRequest,
    Exchange,
    Free,
    Notk,
    Reserved,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceInfo {
    /// Minor currency units (euro cents).
    pub price_cents: i64,
    pub price_type: PriceType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub city_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerInfo {
    pub website_url: Option<String>,
    pub show_website_url: bool,
}

/// Normalized marketplace item as returned by a listing source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub description: String,
    pub location: Location,
    pub price: PriceInfo,
    pub image_urls: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub url: String,
    pub seller: SellerInfo,
}

impl Listing {
    pub fn is_reserved(&self) -> bool {
        self.price.price_type == PriceType::Reserved
    }

    /// A seller counts as commercial when it has a website and shows it.
    pub fn is_commercial(&self) -> bool {
        let has_website = self
            .seller
            .website_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());
        has_website && self.seller.show_website_url
    }
}

/// Published once per (query, listing) pair, the first time the pair is seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewListingEvent {
    pub event_id: Uuid,
    pub query_id: QueryId,
    pub search_term: String,
    pub discovered_at: DateTime<Utc>,
    pub listing: Listing,
}

impl NewListingEvent {
    pub fn new(query: &Query, listing: Listing) -> Self {
        Self {
            event_id: Self::event_id_for(&query.id, &listing.id),
            query_id: query.id.clone(),
            search_term: query.params.query.clone(),
            discovered_at: Utc::now(),
            listing,
        }
    }

    /// Stable across redeliveries so subscribers can drop duplicates.
    pub fn event_id_for(query_id: &QueryId, listing_id: &str) -> Uuid {
        let name = format!("spekkoper:{query_id}:{listing_id}");
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bikes() -> SearchParams {
        SearchParams {
            query: "bikes".into(),
            category: Some(10),
            sub_category: Some(20),
            postcode: "0000XX".into(),
            distance_meters: Some(99),
            ..Default::default()
        }
    }

    #[test]
    fn generated_ids_are_url_safe_and_short() {
        let id = QueryId::generate();
        assert_eq!(id.as_str().len(), 8);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(id, QueryId::generate());
    }

    #[test]
    fn validation_accepts_empty_and_complete_params() {
        assert!(SearchParams::default().validate().is_ok());
        assert!(bikes().validate().is_ok());
    }

    #[test]
    fn validation_rejects_dangling_filters() {
        let mut params = bikes();
        params.category = None;
        assert_eq!(
            params.validate(),
            Err(ValidationError::SubCategoryWithoutCategory(20))
        );

        let mut params = bikes();
        params.postcode.clear();
        assert_eq!(
            params.validate(),
            Err(ValidationError::DistanceWithoutPostcode(99))
        );

        let mut params = bikes();
        params.postcode = "0000;XX".into();
        assert!(matches!(
            params.validate(),
            Err(ValidationError::MalformedPostcode(_))
        ));
    }

    #[test]
    fn zero_values_are_unset_filters() {
        let params = SearchParams {
            query: "kachel".into(),
            category: Some(0),
            sub_category: Some(0),
            distance_meters: Some(0),
            attributes_by_id: vec![0, 31],
            ..Default::default()
        };
        assert_eq!(params.validate(), Ok(()));

        let params = SearchParams {
            sub_category: Some(513),
            category: Some(0),
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(ValidationError::SubCategoryWithoutCategory(513))
        );
    }

    #[test]
    fn commercial_requires_a_shown_website() {
        let mut listing = Listing::default();
        assert!(!listing.is_commercial());
        listing.seller.website_url = Some("https://shop.example".into());
        assert!(!listing.is_commercial());
        listing.seller.show_website_url = true;
        assert!(listing.is_commercial());
        listing.seller.website_url = Some("  ".into());
        assert!(!listing.is_commercial());
    }

    #[test]
    fn unknown_price_types_deserialize_as_other() {
        let price: PriceInfo =
            serde_json::from_str(r#"{"price_cents":0,"price_type":"SOMETHING_NEW"}"#).unwrap();
        assert_eq!(price.price_type, PriceType::Other);
        let price: PriceInfo =
            serde_json::from_str(r#"{"price_cents":500,"price_type":"RESERVED"}"#).unwrap();
        assert_eq!(price.price_type, PriceType::Reserved);
    }

    #[test]
    fn event_ids_are_stable_per_query_and_listing() {
        let query = Query::new(bikes());
        let listing = Listing {
            id: "m123".into(),
            ..Default::default()
        };
        let a = NewListingEvent::new(&query, listing.clone());
        let b = NewListingEvent::new(&query, listing);
        assert_eq!(a.event_id, b.event_id);
        assert_ne!(a.event_id, NewListingEvent::event_id_for(&query.id, "m124"));
        assert_eq!(a.search_term, "bikes");
    }

    #[test]
    fn query_serializes_flat() {
        let query = Query::new(bikes());
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["query"], "bikes");
        assert_eq!(value["id"], query.id.as_str());
        let back: Query = serde_json::from_value(value).unwrap();
        assert_eq!(back, query);
    }
}
