//! Route distance from OpenStreetMap Nominatim geocoding.

use std::time::Duration;

use async_trait::async_trait;
use callquote_core::config::GeocodingConfig;
use callquote_core::pricing::{DistanceLookup, DistanceUnavailable};
use serde::Deserialize;
use tracing::{debug, info};

const EARTH_RADIUS_KM: f64 = 6371.0088;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Great-circle distance between two points.
pub fn haversine_km(from: Coordinates, to: Coordinates) -> f64 {
    let (lat1, lat2) = (from.lat.to_radians(), to.lat.to_radians());
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lon = (to.lon - from.lon).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

pub struct NominatimDistance {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl NominatimDistance {
    pub fn from_config(config: &GeocodingConfig) -> Result<Self, reqwest::Error> {
        let client =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs.max(1))).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
        })
    }

    async fn locate(&self, address: &str) -> Result<Coordinates, DistanceUnavailable> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(|error| DistanceUnavailable::Lookup(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DistanceUnavailable::Lookup(format!("geocoder returned {status}")));
        }

        let hits: Vec<SearchHit> =
            response.json().await.map_err(|error| DistanceUnavailable::Lookup(error.to_string()))?;
        let hit = hits.into_iter().next().ok_or_else(|| DistanceUnavailable::NotFound(address.to_string()))?;
        let parse = |raw: &str| {
            raw.trim()
                .parse::<f64>()
                .map_err(|_| DistanceUnavailable::Lookup(format!("unreadable coordinate `{raw}`")))
        };
        let coordinates = Coordinates { lat: parse(&hit.lat)?, lon: parse(&hit.lon)? };
        debug!(
            event_name = "geocode.located",
            lat = coordinates.lat,
            lon = coordinates.lon,
            "address geocoded"
        );
        Ok(coordinates)
    }
}

#[async_trait]
impl DistanceLookup for NominatimDistance {
    async fn distance_km(&self, origin: &str, destination: &str) -> Result<f64, DistanceUnavailable> {
        let from = self.locate(origin).await?;
        let to = self.locate(destination).await?;
        let km = haversine_km(from, to);
        info!(event_name = "geocode.distance_measured", distance_km = km, "route distance measured");
        Ok(km)
    }
}
