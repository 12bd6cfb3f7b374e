/// Per-site quirks as data, so the extractor and normalizer stay
/// source-agnostic. Adding a site means adding a profile, not branching
/// logic.
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub name: &'static str,
    /// Literal preceding the embedded JSON payload on listing pages.
    pub marker: &'static str,
    /// Dotted key path from the payload root to the listing object.
    pub payload_root: &'static str,
    /// Sitemap to seed the URL queue from, for sitemap-indexed sites.
    pub sitemap: Option<&'static str>,
    /// Substring a sitemap URL must contain to count as a listing page.
    pub url_filter: &'static str,
    /// Search API for offset/grid discovery, for capped-search sites.
    pub search: Option<SearchConfig>,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub endpoint: &'static str,
    /// Hard cap the source imposes on a single query's result count.
    /// Hitting it means the result set was truncated.
    pub result_cap: usize,
    /// Page size for the offset walk.
    pub stride: usize,
}

pub fn profile(name: &str) -> Option<SourceProfile> {
    match name {
        "jll" => Some(SourceProfile {
            name: "jll",
            marker: r#"<script id="__NEXT_DATA__" type="application/json">"#,
            payload_root: "props.pageProps.property",
            sitemap: Some("https://property.jll.com/sitemap-properties.xml"),
            url_filter: "/propert",
            search: None,
        }),
        "compass" => Some(SourceProfile {
            name: "compass",
            marker: "window.__INITIAL_DATA__",
            payload_root: "props.listingRelation.listing",
            sitemap: None,
            url_filter: "/homes-for-sale/",
            search: Some(SearchConfig {
                endpoint: "https://www.compass.com/homes-for-sale/",
                result_cap: 500,
                stride: 40,
            }),
        }),
        _ => None,
    }
}

pub fn known_sources() -> &'static [&'static str] {
    &["jll", "compass"]
}
