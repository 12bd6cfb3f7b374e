use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::error::ScrapeError;
use crate::record::{Agent, Listing};
use crate::sources::SourceProfile;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Contact-form template some sites return in place of a real description.
const BOILERPLATE_DESCRIPTION: &str = "I would like more information about";

/// Payload keys folded into dedicated record fields; everything else lands
/// in `details`.
const CONSUMED_KEYS: &[&str] = &[
    "brokers", "images", "brochures", "highlights", "descriptionSections",
    "virtualTours", "salePrice", "rentPrice", "surfaceArea", "tenureTypes",
    "labels", "address", "city", "state", "postcode", "latitude", "longitude",
    "id", "refId", "title", "propertyType", "propertyTypes",
];

/// Map one decoded payload into the canonical record. Pure: the same
/// payload, profile and URL always produce an identical record.
pub fn normalize(
    payload: &Value,
    profile: &SourceProfile,
    page_url: &str,
) -> Result<Listing, ScrapeError> {
    let listing = dig(payload, profile.payload_root)
        .filter(|v| v.is_object())
        .ok_or(ScrapeError::SchemaViolation("payload root object"))?;

    let listing_id = listing
        .get("id")
        .or_else(|| listing.get("refId"))
        .and_then(to_display)
        .or_else(|| last_path_segment(page_url))
        .ok_or(ScrapeError::SchemaViolation("listing id"))?;
    if page_url.is_empty() {
        return Err(ScrapeError::SchemaViolation("listing link"));
    }

    let base = Url::parse(page_url).ok();

    // Address: joined display string plus the parsed components.
    let city = str_field(listing, "city");
    let state = str_field(listing, "state");
    let zipcode = listing.get("postcode").and_then(to_display);
    let address = {
        let parts: Vec<String> = [str_field(listing, "address"), city.clone(), state.clone(), zipcode.clone()]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() { None } else { Some(parts.join(", ")) }
    };

    let coordinates = match (listing.get("latitude"), listing.get("longitude")) {
        (Some(lat), Some(lng)) if lat.is_number() && lng.is_number() => {
            Some(format!("{},{}", lat, lng))
        }
        _ => None,
    };

    let listing_type = listing.get("tenureTypes").and_then(|v| v.as_array()).map(|t| {
        let rent = t.iter().any(|x| x == "rent");
        let sale = t.iter().any(|x| x == "sale");
        match (sale, rent) {
            (true, true) => "For Sale / For Lease".to_string(),
            (false, true) => "For Lease".to_string(),
            _ => "For Sale".to_string(),
        }
    });

    let listing_status = listing
        .get("labels")
        .and_then(|v| v.as_array())
        .map(|labels| {
            labels
                .iter()
                .filter_map(to_display)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|s| !s.is_empty());

    let description = listing
        .get("descriptionSections")
        .and_then(|v| v.as_array())
        .map(|sections| {
            sections
                .iter()
                .filter_map(|s| s.get("content").and_then(|c| c.as_str()))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .map(|raw| strip_tags(&raw))
        .filter(|text| !text.is_empty() && !text.starts_with(BOILERPLATE_DESCRIPTION));

    let highlights = match listing.get("highlights") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|h| match h {
                Value::String(s) => Some(s.clone()),
                other => other.get("title").and_then(|t| t.as_str()).map(String::from),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        // A single joined string splits on the site's stable delimiter.
        Some(Value::String(joined)) => joined
            .split("; ")
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    let photos = listing
        .get("images")
        .and_then(|v| v.as_array())
        .map(|imgs| {
            imgs.iter()
                .filter_map(|i| i.as_str())
                .filter_map(|href| resolve(base.as_ref(), href))
                .collect()
        })
        .unwrap_or_default();

    let brochure_pdf = brochure(listing, payload, base.as_ref())
        .or_else(|| Some(format!("{}/brochure", page_url.trim_end_matches('/'))));

    let virtual_tour = listing
        .get("virtualTours")
        .and_then(|v| v.as_array())
        .and_then(|t| t.first())
        .and_then(|v| v.as_str())
        .and_then(|href| resolve(base.as_ref(), href));

    // Brokers usually sit on the listing itself, but some payloads hoist
    // them to the listing's parent object.
    let parent = profile
        .payload_root
        .rsplit_once('.')
        .and_then(|(path, _)| dig(payload, path))
        .unwrap_or(payload);
    let agents = collect_agents(listing, parent, base.as_ref());

    let mut details = BTreeMap::new();
    if let Some(map) = listing.as_object() {
        for (key, value) in map {
            if CONSUMED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if let Some(display) = to_display(value) {
                details.insert(key.clone(), display);
            }
        }
    }

    Ok(Listing {
        source_name: profile.name.to_string(),
        listing_id,
        listing_link: page_url.to_string(),
        listing_type,
        listing_status,
        address,
        city,
        state,
        zipcode,
        coordinates,
        property_name: str_field(listing, "title"),
        property_type: str_field(listing, "propertyType").or_else(|| {
            listing
                .get("propertyTypes")
                .and_then(|v| v.as_array())
                .and_then(|t| t.first())
                .and_then(|v| v.as_str())
                .map(String::from)
        }),
        sale_price: listing.get("salePrice").and_then(format_price),
        lease_price: listing.get("rentPrice").and_then(format_price),
        size: listing.get("surfaceArea").and_then(format_size),
        description,
        highlights,
        photos,
        brochure_pdf,
        virtual_tour,
        agents,
        details,
    })
}

/// `{amount, currency, unit}` → `"<currency> <amount>/<unit>"`, unit-less →
/// `"<currency> <amount>"`. Pre-formatted strings and bare numbers pass
/// through as display strings; anything without an amount is dropped.
fn format_price(price: &Value) -> Option<String> {
    match price {
        Value::Object(map) => {
            let currency = map
                .get("currency")
                .and_then(|c| c.as_str())
                .unwrap_or("USD");
            match map.get("amount").and_then(to_display) {
                Some(amount) => match map.get("unit").and_then(|u| u.as_str()) {
                    Some(unit) if !unit.is_empty() => {
                        Some(format!("{} {}/{}", currency, amount, unit))
                    }
                    _ => Some(format!("{} {}", currency, amount)),
                },
                None => map
                    .get("formatted")
                    .or_else(|| map.get("value"))
                    .or_else(|| map.get("display"))
                    .and_then(to_display),
            }
        }
        other => to_display(other),
    }
}

/// `{value: {min, max}, unit}` → `"<min>-<max> <unit>"`; a min-only range
/// is open-ended (`"<min>+ <unit>"`); a scalar value (or a collapsed
/// min==max range) → `"<n> <unit>"`. Unit defaults to feet.
fn format_size(surface: &Value) -> Option<String> {
    let unit = surface
        .get("unit")
        .and_then(|u| u.as_str())
        .unwrap_or("feet");
    let value = surface.get("value")?;
    match value {
        Value::Object(range) => {
            let min = range.get("min").and_then(|v| v.as_f64());
            let max = range.get("max").and_then(|v| v.as_f64());
            match (min, max) {
                (Some(min), Some(max)) if min != max => Some(format!(
                    "{}-{} {}",
                    group_thousands(min),
                    group_thousands(max),
                    unit
                )),
                (Some(n), Some(_)) => Some(format!("{} {}", group_thousands(n), unit)),
                (Some(min), None) => Some(format!("{}+ {}", group_thousands(min), unit)),
                (None, _) => None,
            }
        }
        v => v
            .as_f64()
            .map(|n| format!("{} {}", group_thousands(n), unit)),
    }
}

/// First brochure ending in `.pdf`, searched under the listing object and at
/// the payload root. Non-PDF links are not accepted as brochures.
fn brochure(listing: &Value, payload: &Value, base: Option<&Url>) -> Option<String> {
    let candidates = listing
        .get("brochures")
        .and_then(|v| v.as_array())
        .filter(|a| !a.is_empty())
        .or_else(|| payload.get("brochures").and_then(|v| v.as_array()))?;
    candidates
        .iter()
        .filter_map(|b| b.as_str())
        .find(|href| href.to_lowercase().ends_with(".pdf"))
        .and_then(|href| resolve(base, href))
}

fn collect_agents(listing: &Value, parent: &Value, base: Option<&Url>) -> Vec<Agent> {
    let mut agents: Vec<Agent> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for spot in [listing.get("brokers"), parent.get("brokers")] {
        let Some(brokers) = spot.and_then(|v| v.as_array()) else {
            continue;
        };
        for broker in brokers {
            let agent = broker_to_agent(broker, base);
            if agent.name.is_none() && agent.license.is_none() {
                continue;
            }
            if seen.insert(agent.identity()) {
                agents.push(agent);
            }
        }
    }
    agents
}

fn broker_to_agent(broker: &Value, base: Option<&Url>) -> Agent {
    let license = broker
        .get("brokerLicenses")
        .and_then(|v| v.as_array())
        .and_then(|l| l.first())
        .and_then(|l| l.get("licenseNumber"))
        .and_then(to_display);
    let office = broker
        .get("entityLicenses")
        .and_then(|v| v.as_array())
        .and_then(|l| l.first());
    Agent {
        name: str_field(broker, "name"),
        title: str_field(broker, "jobTitle"),
        license,
        phone: str_field(broker, "telephone"),
        email: str_field(broker, "email").filter(|e| !e.trim().is_empty()),
        photo_url: str_field(broker, "photo").and_then(|href| resolve(base, &href)),
        profile_url: str_field(broker, "linkedin").and_then(|href| resolve(base, &href)),
        office_name: office.and_then(|o| str_field(o, "company")),
        office_phone: office.and_then(|o| str_field(o, "mainOfficePhone")),
    }
}

// ── helpers ──

/// Walk a dotted key path ("props.pageProps.property") into a value.
fn dig<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

/// Final non-empty segment of the URL path, the slug-derived listing id.
fn last_path_segment(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(String::from)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Scalar → display string; objects and arrays are not display values.
fn to_display(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    if href.is_empty() {
        return None;
    }
    match base {
        Some(base) => base.join(href).ok().map(String::from),
        None => Url::parse(href).ok().map(String::from),
    }
}

fn strip_tags(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    WS_RE.replace_all(&text, " ").trim().to_string()
}

/// 4752 → "4,752". Fractional sizes keep two decimals, like the sites show.
fn group_thousands(n: f64) -> String {
    let whole = n.trunc() as i64;
    let mut digits = whole.abs().to_string();
    let mut grouped = String::new();
    while digits.len() > 3 {
        let tail = digits.split_off(digits.len() - 3);
        grouped = format!(",{}{}", tail, grouped);
    }
    let mut out = format!("{}{}{}", if whole < 0 { "-" } else { "" }, digits, grouped);
    if n.fract().abs() > f64::EPSILON {
        out.push_str(&format!("{:.2}", n.fract().abs())[1..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources;
    use serde_json::json;

    fn jll() -> SourceProfile {
        sources::profile("jll").unwrap()
    }

    fn wrap(property: Value) -> Value {
        json!({ "props": { "pageProps": { "property": property } } })
    }

    const URL: &str = "https://x/listings/abc";

    #[test]
    fn price_object_with_unit() {
        let payload = wrap(json!({
            "id": 1,
            "rentPrice": { "amount": "1.09", "currency": "USD", "unit": "SF" }
        }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.lease_price.as_deref(), Some("USD 1.09/SF"));
    }

    #[test]
    fn price_object_without_unit() {
        let payload = wrap(json!({
            "id": 1,
            "salePrice": { "amount": 250000, "currency": "USD" }
        }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.sale_price.as_deref(), Some("USD 250000"));
        assert!(rec.lease_price.is_none());
    }

    #[test]
    fn absent_price_is_omitted() {
        let rec = normalize(&wrap(json!({ "id": 1 })), &jll(), URL).unwrap();
        assert!(rec.sale_price.is_none());
        assert!(rec.lease_price.is_none());
    }

    #[test]
    fn size_range() {
        let payload = wrap(json!({
            "id": 1,
            "surfaceArea": { "value": { "min": 2200, "max": 4752 }, "unit": "feet" }
        }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.size.as_deref(), Some("2,200-4,752 feet"));
    }

    #[test]
    fn size_scalar_and_collapsed_range() {
        let scalar = wrap(json!({ "id": 1, "surfaceArea": { "value": 5600 } }));
        assert_eq!(
            normalize(&scalar, &jll(), URL).unwrap().size.as_deref(),
            Some("5,600 feet")
        );
        let collapsed = wrap(json!({
            "id": 1,
            "surfaceArea": { "value": { "min": 300, "max": 300 } }
        }));
        assert_eq!(
            normalize(&collapsed, &jll(), URL).unwrap().size.as_deref(),
            Some("300 feet")
        );
    }

    #[test]
    fn size_min_only_is_open_ended() {
        let payload = wrap(json!({
            "id": 1,
            "surfaceArea": { "value": { "min": 2200 }, "unit": "feet" }
        }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.size.as_deref(), Some("2,200+ feet"));
    }

    #[test]
    fn description_tags_stripped() {
        let payload = wrap(json!({
            "id": 1,
            "descriptionSections": [
                { "content": "<p>Class A offices</p>" },
                { "content": "<b>near</b>  transit" }
            ]
        }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.description.as_deref(), Some("Class A offices near transit"));
    }

    #[test]
    fn boilerplate_description_omitted() {
        let payload = wrap(json!({
            "id": 1,
            "descriptionSections": [
                { "content": "I would like more information about 1 Main St" }
            ]
        }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert!(rec.description.is_none());
    }

    #[test]
    fn highlights_joined_string_splits() {
        let payload = wrap(json!({ "id": 1, "highlights": "24/7 access; On-site parking" }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.highlights, vec!["24/7 access", "On-site parking"]);
    }

    #[test]
    fn highlights_array_order_preserved() {
        let payload = wrap(json!({
            "id": 1,
            "highlights": [{ "title": "b" }, { "title": "a" }, { "title": "" }]
        }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.highlights, vec!["b", "a"]);
    }

    #[test]
    fn brochure_fallback_synthesized() {
        let rec = normalize(&wrap(json!({ "id": 1 })), &jll(), URL).unwrap();
        assert_eq!(rec.brochure_pdf.as_deref(), Some("https://x/listings/abc/brochure"));
    }

    #[test]
    fn brochure_requires_pdf_extension() {
        let payload = wrap(json!({
            "id": 1,
            "brochures": ["/files/tour.html", "/files/real.PDF"]
        }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.brochure_pdf.as_deref(), Some("https://x/files/real.PDF"));
    }

    #[test]
    fn relative_photos_resolved() {
        let payload = wrap(json!({ "id": 1, "images": ["/img/1.jpg", "https://cdn/2.jpg"] }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.photos, vec!["https://x/img/1.jpg", "https://cdn/2.jpg"]);
    }

    #[test]
    fn agents_merged_and_deduped_by_license() {
        let payload = json!({ "props": { "pageProps": {
            "property": {
                "id": 1,
                "brokers": [{
                    "name": "Ann Chu",
                    "brokerLicenses": [{ "licenseNumber": "BR-9" }]
                }]
            },
            "brokers": [
                { "name": "A. Chu", "brokerLicenses": [{ "licenseNumber": "br-9" }] },
                { "name": "Bo Reyes", "email": "bo@x.com" }
            ]
        }}});
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.agents.len(), 2);
        assert_eq!(rec.agents[0].name.as_deref(), Some("Ann Chu"));
        assert_eq!(rec.agents[1].name.as_deref(), Some("Bo Reyes"));
    }

    #[test]
    fn missing_root_is_schema_violation() {
        let payload = json!({ "props": {} });
        assert!(matches!(
            normalize(&payload, &jll(), URL),
            Err(ScrapeError::SchemaViolation(_))
        ));
    }

    #[test]
    fn id_falls_back_to_url_segment() {
        let rec = normalize(&wrap(json!({ "city": "Boston" })), &jll(), URL).unwrap();
        assert_eq!(rec.listing_id, "abc");
    }

    #[test]
    fn normalization_is_idempotent() {
        let payload = wrap(json!({
            "id": 7,
            "city": "Boston",
            "rentPrice": { "amount": "12", "currency": "USD", "unit": "SF" },
            "yearBuilt": 1987,
            "images": ["/a.jpg"]
        }));
        let a = normalize(&payload, &jll(), URL).unwrap();
        let b = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn residual_keys_become_details() {
        let payload = wrap(json!({ "id": 1, "yearBuilt": 1987, "buildingClass": "A" }));
        let rec = normalize(&payload, &jll(), URL).unwrap();
        assert_eq!(rec.details.get("yearBuilt").map(String::as_str), Some("1987"));
        assert_eq!(rec.details.get("buildingClass").map(String::as_str), Some("A"));
    }
}
