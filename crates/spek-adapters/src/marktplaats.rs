use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use spek_core::{Listing, Location, PriceInfo, PriceType, SearchParams, SellerInfo};
use tracing::debug;
use url::Url;

use crate::http::HttpFetcher;
use crate::query_url;
use crate::{ListingSource, SourceError};

pub const MARKTPLAATS_BASE_URL: &str = "https://www.marktplaats.nl";
const SEARCH_PATH: &str = "/lrp/api/search";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchPage {
    pub limit: u32,
    pub offset: u32,
}

impl Default for SearchPage {
    fn default() -> Self {
        Self {
            limit: 30,
            offset: 0,
        }
    }
}

/// Search API URL for `params`; unset filters are left out of the query string.
pub fn search_url(base: &Url, params: &SearchParams, page: SearchPage) -> Url {
    let mut url = base.join(SEARCH_PATH).unwrap_or_else(|_| base.clone());
    {
        let mut qs = url.query_pairs_mut();
        qs.append_pair("searchInTitleAndDescription", "true");
        qs.append_pair("viewOptions", "list-view");
        qs.append_pair("limit", &page.limit.to_string());
        qs.append_pair("offset", &page.offset.to_string());
        if !params.query.is_empty() {
            qs.append_pair("query", &params.query);
        }
        if !params.postcode.is_empty() {
            qs.append_pair("postcode", &params.postcode);
        }
        if let Some(distance) = params.distance_meters.filter(|d| *d > 0) {
            qs.append_pair("distanceMeters", &distance.to_string());
        }
        if let Some(category) = params.category.filter(|c| *c > 0) {
            qs.append_pair("l1CategoryId", &category.to_string());
        }
        if let Some(sub_category) = params.sub_category.filter(|c| *c > 0) {
            qs.append_pair("l2CategoryId", &sub_category.to_string());
        }
        for attribute in params.attributes_by_id.iter().filter(|a| **a > 0) {
            qs.append_pair("attributesById[]", &attribute.to_string());
        }
    }
    url
}

#[derive(Debug, Deserialize)]
struct SearchResponseDto {
    #[serde(default)]
    listings: Vec<ListingDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingDto {
    item_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    price_info: PriceInfoDto,
    #[serde(default)]
    location: LocationDto,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    image_urls: Vec<String>,
    #[serde(default)]
    seller_information: SellerDto,
    #[serde(default)]
    vip_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceInfoDto {
    #[serde(default)]
    price_cents: i64,
    #[serde(default)]
    price_type: PriceType,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationDto {
    #[serde(default)]
    city_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SellerDto {
    #[serde(default)]
    seller_website_url: Option<String>,
    #[serde(default)]
    show_website_url: bool,
}

impl ListingDto {
    fn into_listing(self, base: &Url) -> Listing {
        let url = if self.vip_url.is_empty() {
            String::new()
        } else {
            base.join(&self.vip_url)
                .map(|u| u.to_string())
                .unwrap_or(self.vip_url)
        };
        Listing {
            id: self.item_id,
            title: self.title,
            description: self.description,
            location: Location {
                city_name: self.location.city_name,
            },
            price: PriceInfo {
                price_cents: self.price_info.price_cents,
                price_type: self.price_info.price_type,
            },
            image_urls: self.image_urls,
            published_at: self.date,
            url,
            seller: SellerInfo {
                website_url: self
                    .seller_information
                    .seller_website_url
                    .filter(|u| !u.is_empty()),
                show_website_url: self.seller_information.show_website_url,
            },
        }
    }
}

pub fn decode_search_response(base: &Url, body: &[u8]) -> Result<Vec<Listing>, SourceError> {
    let dto: SearchResponseDto =
        serde_json::from_slice(body).map_err(|source| SourceError::Decode {
            what: "marktplaats search response",
            source,
        })?;
    Ok(dto
        .listings
        .into_iter()
        .map(|l| l.into_listing(base))
        .collect())
}

#[derive(Debug, Clone)]
pub struct MarktplaatsSource {
    http: Arc<HttpFetcher>,
    base_url: Url,
    page: SearchPage,
}

impl MarktplaatsSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base_url: Url::parse(MARKTPLAATS_BASE_URL).expect("static base url parses"),
            page: SearchPage::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl ListingSource for MarktplaatsSource {
    fn source_id(&self) -> &'static str {
        "marktplaats"
    }

    async fn search(&self, params: &SearchParams) -> Result<Vec<Listing>, SourceError> {
        let url = search_url(&self.base_url, params, self.page);
        let response = self.http.fetch_bytes(url.as_str()).await?;
        let listings = decode_search_response(&self.base_url, &response.body)?;
        debug!(count = listings.len(), "marktplaats search decoded");
        Ok(listings)
    }

    async fn resolve_query_url(&self, raw_url: &str) -> Result<SearchParams, SourceError> {
        let url = query_url::parse_url(raw_url)?;
        let categories = match query_url::category_slugs(&url) {
            Some(_) => {
                let mut page_url = url.clone();
                page_url.set_fragment(None);
                let page = self.http.fetch_bytes(page_url.as_str()).await?;
                query_url::category_ids_from_html(&String::from_utf8_lossy(&page.body))
            }
            None => HashMap::new(),
        };
        query_url::parse_marketplace_url(raw_url, &categories)
    }
}
