use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One agent/broker attached to a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub office_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub office_phone: Option<String>,
}

impl Agent {
    /// De-duplication identity: license number when present, else name+email.
    pub fn identity(&self) -> String {
        match &self.license {
            Some(lic) => format!("lic:{}", lic.trim().to_lowercase()),
            None => format!(
                "{}|{}",
                self.name.as_deref().unwrap_or("").trim().to_lowercase(),
                self.email.as_deref().unwrap_or("").trim().to_lowercase(),
            ),
        }
    }
}

/// The normalized record emitted for every listing regardless of source.
/// Every field is a primitive, an ordered list, or absent; immutable once
/// produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub source_name: String,
    pub listing_id: String,
    pub listing_link: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zipcode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sale_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub highlights: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub photos: Vec<String>,
    /// When the payload carries no brochure document this is synthesized as
    /// `listing_link + "/brochure"`, a best-effort guess that may not
    /// resolve to an actual document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brochure_pdf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_tour: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub agents: Vec<Agent>,

    /// Residual key/value details from the payload, as display strings.
    /// BTreeMap keeps serialization order stable across runs.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub details: BTreeMap<String, String>,
}
