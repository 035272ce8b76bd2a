//! Parsing of search URLs copied from the marketplace website, e.g.
//! `https://www.marktplaats.nl/l/huis-en-inrichting/kachels/#q:zibro|f:31,32,4205|distanceMeters:50000|postcode:3461CC`.

use std::collections::HashMap;

use scraper::{Html, Selector};
use spek_core::{SearchParams, ValidationError};
use url::Url;

use crate::SourceError;

const MARKETPLACE_HOST: &str = "marktplaats.nl";

pub(crate) fn parse_url(raw_url: &str) -> Result<Url, SourceError> {
    let url = Url::parse(raw_url.trim())
        .map_err(|err| ValidationError::InvalidUrl(format!("{raw_url}: {err}")))?;
    let host = url.host_str().unwrap_or_default();
    let on_marketplace = host == MARKETPLACE_HOST || host.ends_with(&format!(".{MARKETPLACE_HOST}"));
    if !on_marketplace {
        return Err(ValidationError::InvalidUrl(format!("{raw_url}: not a {MARKETPLACE_HOST} url")).into());
    }
    Ok(url)
}

/// Category and sub-category slugs from `/l/<category>/<sub-category>/`.
pub fn category_slugs(url: &Url) -> Option<(String, String)> {
    let parts: Vec<&str> = url.path().split('/').collect();
    if parts.len() > 4 && !parts[2].is_empty() && !parts[3].is_empty() {
        Some((parts[2].to_ascii_lowercase(), parts[3].to_ascii_lowercase()))
    } else {
        None
    }
}

/// Slug → id map from the `categoryId` select on a search results page.
/// Option labels are lower-cased with spaces turned into dashes.
pub fn category_ids_from_html(html: &str) -> HashMap<String, u32> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("select[name='categoryId'] option") else {
        return HashMap::new();
    };
    document
        .select(&selector)
        .filter_map(|option| {
            let id = option.value().attr("value")?.trim().parse::<u32>().ok()?;
            let label = option.text().collect::<String>();
            let slug = label.trim().replace(' ', "-").to_lowercase();
            (!slug.is_empty() && id > 0).then_some((slug, id))
        })
        .collect()
}

/// Applies `key:value` pairs separated by `|`. Unknown keys are ignored.
pub fn apply_fragment(fragment: &str, params: &mut SearchParams) -> Result<(), SourceError> {
    for pair in fragment.split('|') {
        let Some((key, value)) = pair.split_once(':') else {
            continue;
        };
        let value = percent_decode(value);
        match key {
            "q" => params.query = value,
            "postcode" => params.postcode = value,
            "distanceMeters" => params.distance_meters = Some(parse_number(key, &value)?),
            "f" => {
                params.attributes_by_id = value
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| parse_number(key, s))
                    .collect::<Result<_, _>>()?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Full parse given an already-resolved category map.
pub fn parse_marketplace_url(
    raw_url: &str,
    categories: &HashMap<String, u32>,
) -> Result<SearchParams, SourceError> {
    let url = parse_url(raw_url)?;
    let mut params = SearchParams::default();
    if let Some((l1, l2)) = category_slugs(&url) {
        params.category = categories.get(&l1).copied();
        params.sub_category = params
            .category
            .and_then(|_| categories.get(&l2).copied());
    }
    apply_fragment(url.fragment().unwrap_or_default(), &mut params)?;
    params.validate()?;
    Ok(params)
}

fn parse_number(key: &str, value: &str) -> Result<u32, SourceError> {
    value.trim().parse::<u32>().map_err(|_| {
        ValidationError::InvalidUrl(format!("{key} expects a number, got {value:?}")).into()
    })
}

fn percent_decode(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={value}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| value.to_string())
}
