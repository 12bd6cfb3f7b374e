use anyhow::{bail, Context, Result};
use tracing::info;

use crate::sources::SourceProfile;

/// Fetch a source's property sitemap and return the listing-page URLs.
pub async fn fetch_listing_urls(profile: &SourceProfile) -> Result<Vec<String>> {
    let Some(sitemap_url) = profile.sitemap else {
        bail!("source '{}' has no sitemap", profile.name);
    };
    let client = reqwest::Client::new();

    info!("Fetching sitemap: {}", sitemap_url);
    let xml = client
        .get(sitemap_url)
        .send()
        .await?
        .text()
        .await
        .context("Failed to fetch sitemap")?;

    let all_urls = parse_urlset(&xml)?;
    info!("Total URLs in sitemap: {}", all_urls.len());

    // Filter to listing pages only (exclude search, office and static pages)
    let filtered: Vec<String> = all_urls
        .into_iter()
        .filter(|url| url.contains(profile.url_filter))
        .collect();

    info!("Listing pages after filtering: {}", filtered.len());
    Ok(filtered)
}

/// Parse a urlset XML and return all <loc> URLs.
fn parse_urlset(xml: &str) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut in_url = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"url" => in_url = true,
                b"loc" if in_url => in_loc = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(e)) if in_loc => {
                urls.push(e.unescape()?.trim().to_string());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}
