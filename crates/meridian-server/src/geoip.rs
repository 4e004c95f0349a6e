//! Geolocation lookups with an in-memory cache. Private and loopback
//! addresses never leave the process; everything else goes to ip-api.com
//! once and is cached for the lifetime of the service.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GeoIpError {
    #[error("private or loopback IP address")]
    PrivateAddress,
    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("geo ip lookup failed")]
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GeoLocation {
    pub ip: String,
    pub city: String,
    pub region: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub isp: String,
    pub asn: String,
    pub as_name: String,
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

pub struct GeoIpService {
    client: reqwest::Client,
    cache: RwLock<HashMap<String, GeoLocation>>,
}

impl Default for GeoIpService {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoIpService {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(LOOKUP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, ip: &str) -> Result<GeoLocation, GeoIpError> {
        if let Some(cached) = self.cache.read().await.get(ip) {
            return Ok(cached.clone());
        }

        if let Ok(parsed) = ip.parse::<IpAddr>() {
            if is_private_or_loopback(parsed) {
                return Err(GeoIpError::PrivateAddress);
            }
        }

        let resp: IpApiResponse = self
            .client
            .get(format!("http://ip-api.com/json/{ip}"))
            .send()
            .await?
            .json()
            .await?;
        if resp.status != "success" {
            return Err(GeoIpError::Failed);
        }

        let (asn, as_name) = parse_as(&resp.as_field);
        let location = GeoLocation {
            ip: resp.query,
            city: resp.city,
            region: resp.region_name,
            country: resp.country,
            latitude: resp.lat,
            longitude: resp.lon,
            isp: resp.isp,
            asn,
            as_name,
        };

        self.cache
            .write()
            .await
            .insert(ip.to_string(), location.clone());
        Ok(location)
    }
}

pub fn is_private_or_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                // fc00::/7 unique local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

// ip-api's `as` field reads like "AS15169 Google LLC".
fn parse_as(raw: &str) -> (String, String) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (String::new(), String::new());
    }

    let mut fields = raw.split_whitespace();
    let first = fields.next().unwrap_or_default();
    if first.len() > 2 && first[..2].eq_ignore_ascii_case("as") {
        (
            first.to_uppercase(),
            fields.collect::<Vec<_>>().join(" "),
        )
    } else {
        (String::new(), raw.to_string())
    }
}
