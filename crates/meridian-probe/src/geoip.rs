//! Startup self-lookup: where is this probe, as seen from the internet.
//! Folded into the registration metadata so operators do not have to type
//! coordinates or carrier names by hand.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const LOOKUP_URL: &str = "http://ip-api.com/json/";

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("lookup returned status {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct IpInfo {
    pub ip: String,
    pub city: String,
    pub region: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub isp: String,
    pub asn: String,
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    city: String,
    #[serde(default, rename = "regionName")]
    region_name: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
    #[serde(default)]
    isp: String,
    #[serde(default, rename = "as")]
    as_field: String,
}

/// Look up this host's public address and location.
pub async fn detect() -> Result<IpInfo, DetectError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let resp: IpApiResponse = client.get(LOOKUP_URL).send().await?.json().await?;
    if resp.status != "success" {
        return Err(DetectError::Failed(resp.status));
    }

    Ok(IpInfo {
        ip: resp.query,
        city: resp.city,
        region: resp.region_name,
        country: resp.country,
        latitude: resp.lat,
        longitude: resp.lon,
        isp: resp.isp,
        asn: parse_asn(&resp.as_field),
    })
}

// "AS15169 Google LLC" -> "AS15169"
fn parse_asn(raw: &str) -> String {
    let first = raw.split_whitespace().next().unwrap_or_default();
    if first.len() > 2 && first[..2].eq_ignore_ascii_case("as") {
        first.to_uppercase()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asn_prefix_is_extracted() {
        assert_eq!(parse_asn("AS15169 Google LLC"), "AS15169");
        assert_eq!(parse_asn("as3320 Deutsche Telekom"), "AS3320");
        assert_eq!(parse_asn("Some Carrier"), "");
        assert_eq!(parse_asn(""), "");
    }
}
