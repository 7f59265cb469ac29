//! Yandex geocoder and Yandex Delivery pickup points.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::{http_client, read_json, UpstreamError, REQUEST_TIMEOUT};
use crate::config::{Secret, YandexConfig};

const SERVICE: &str = "yandex";

pub const FALLBACK_CITY: &str = "Москва";
pub const MIN_RADIUS_M: f64 = 100.0;
pub const MAX_RADIUS_M: f64 = 40_000.0;
const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval { pub from: f64, pub to: f64 }

/// Latitude and longitude intervals of a square around the point, with
/// the radius clamped to `[100, 40000]` metres.
pub fn radius_intervals(lat: f64, lon: f64, radius_m: f64) -> (Interval, Interval) {
    let radius = if radius_m.is_finite() { radius_m.clamp(MIN_RADIUS_M, MAX_RADIUS_M) } else { MIN_RADIUS_M };
    let dlat = radius / METERS_PER_DEGREE;
    let cos = lat.to_radians().cos().abs().max(0.01);
    let dlon = radius / (METERS_PER_DEGREE * cos);
    (Interval { from: lat - dlat, to: lat + dlat }, Interval { from: lon - dlon, to: lon + dlon })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoVariant { pub geo_id: i64, pub address: String }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReverseGeocode {
    pub city: String,
    pub country_code: Option<String>,
    pub formatted: Option<String>,
    pub variants: Vec<GeoVariant>,
}

impl ReverseGeocode {
    fn fallback() -> Self {
        Self { city: FALLBACK_CITY.to_string(), country_code: None, formatted: None, variants: vec![] }
    }
}

/// Pickup point search area: a geo id, explicit intervals, or a point
/// with a radius.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PvzQuery {
    pub geo_id: Option<i64>,
    pub latitude: Option<Interval>,
    pub longitude: Option<Interval>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub radius: Option<f64>,
}

impl PvzQuery {
    /// Request body for the pickup point list. Errors name the missing
    /// field.
    pub fn body(&self, only_pickup: bool) -> Result<Value, (&'static str, &'static str)> {
        let mut body = if let Some(geo_id) = self.geo_id {
            json!({ "geo_id": geo_id })
        } else if let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) {
            json!({ "latitude": latitude, "longitude": longitude })
        } else if let (Some(lat), Some(lon)) = (self.lat, self.lon) {
            let (latitude, longitude) = radius_intervals(lat, lon, self.radius.unwrap_or(MIN_RADIUS_M));
            json!({ "latitude": latitude, "longitude": longitude })
        } else {
            return Err(("geo_id", "geo_id, latitude/longitude intervals or lat/lon are required"));
        };
        if only_pickup {
            body["type"] = json!("pickup_point");
            body["available_for_dropoff"] = json!(false);
        }
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct GeocoderResponse { response: GeocoderBody }

#[derive(Debug, Deserialize)]
struct GeocoderBody {
    #[serde(rename = "GeoObjectCollection")]
    collection: GeoObjectCollection,
}

#[derive(Debug, Deserialize)]
struct GeoObjectCollection {
    #[serde(rename = "featureMember", default)]
    members: Vec<FeatureMember>,
}

#[derive(Debug, Deserialize)]
struct FeatureMember {
    #[serde(rename = "GeoObject")]
    object: GeoObject,
}

#[derive(Debug, Deserialize)]
struct GeoObject {
    #[serde(rename = "metaDataProperty")]
    meta: MetaDataProperty,
}

#[derive(Debug, Deserialize)]
struct MetaDataProperty {
    #[serde(rename = "GeocoderMetaData")]
    geocoder: GeocoderMetaData,
}

#[derive(Debug, Deserialize)]
struct GeocoderMetaData {
    #[serde(rename = "Address")]
    address: Address,
}

#[derive(Debug, Deserialize)]
struct Address {
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    formatted: Option<String>,
    #[serde(rename = "Components", default)]
    components: Vec<Component>,
}

#[derive(Debug, Deserialize)]
struct Component { kind: String, name: String }

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    variants: Vec<DetectVariant>,
}

#[derive(Debug, Deserialize)]
struct DetectVariant { geo_id: i64, address: String }

pub struct Yandex {
    client: Client,
    geocoder_url: String,
    geocoder_token: Secret,
    delivery_url: String,
    delivery_token: Secret,
}

impl Yandex {
    pub fn new(config: &YandexConfig) -> Result<Self, UpstreamError> {
        let client = http_client(REQUEST_TIMEOUT).map_err(UpstreamError::transport(SERVICE, "client"))?;
        Ok(Self {
            client,
            geocoder_url: config.geocoder_url.clone(),
            geocoder_token: config.geocoder_token.clone(),
            delivery_url: config.delivery_url.trim_end_matches('/').to_string(),
            delivery_token: config.delivery_token.clone(),
        })
    }

    async fn geocode(&self, lat: f64, lon: f64) -> Result<Option<Address>, UpstreamError> {
        if self.geocoder_token.is_empty() {
            return Err(UpstreamError::NotConfigured { service: SERVICE });
        }
        let response = self
            .client
            .get(&self.geocoder_url)
            .query(&[
                ("apikey", self.geocoder_token.expose().to_string()),
                ("geocode", format!("{},{}", lon, lat)),
                ("format", "json".to_string()),
                ("lang", "ru_RU".to_string()),
                ("results", "1".to_string()),
            ])
            .send()
            .await
            .map_err(UpstreamError::transport(SERVICE, "geocode"))?;
        let body: GeocoderResponse = read_json(SERVICE, "geocode", response).await?;
        Ok(body.response.collection.members.into_iter().next().map(|m| m.object.meta.geocoder.address))
    }

    async fn detect(&self, location: &str) -> Result<Vec<GeoVariant>, UpstreamError> {
        let response = self
            .delivery_post("location/detect", &json!({ "location": location }))
            .await?;
        let body: DetectResponse = serde_json::from_value(response)
            .map_err(|e| UpstreamError::Decode { service: SERVICE, stage: "location/detect", message: e.to_string() })?;
        Ok(body.variants.into_iter().map(|v| GeoVariant { geo_id: v.geo_id, address: v.address }).collect())
    }

    /// City and delivery geo ids for a point. Best effort: on any upstream
    /// failure the city falls back to Moscow with no variants.
    pub async fn reverse_geocode(&self, lat: f64, lon: f64) -> ReverseGeocode {
        let address = match self.geocode(lat, lon).await {
            Ok(Some(address)) => address,
            Ok(None) => return ReverseGeocode::fallback(),
            Err(e) => {
                warn!(error = %e, lat, lon, "reverse geocoding failed");
                return ReverseGeocode::fallback();
            }
        };
        let city = address
            .components
            .iter()
            .find(|c| c.kind == "locality")
            .map(|c| c.name.clone())
            .unwrap_or_else(|| FALLBACK_CITY.to_string());
        let variants = match self.detect(&city).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, city = %city, "geo id detection failed");
                vec![]
            }
        };
        ReverseGeocode { city, country_code: address.country_code, formatted: address.formatted, variants }
    }

    async fn delivery_post(&self, path: &'static str, body: &Value) -> Result<Value, UpstreamError> {
        if self.delivery_token.is_empty() {
            return Err(UpstreamError::NotConfigured { service: SERVICE });
        }
        let response = self
            .client
            .post(format!("{}/{}", self.delivery_url, path))
            .bearer_auth(self.delivery_token.expose())
            .header("Accept-Language", "ru")
            .json(body)
            .send()
            .await
            .map_err(UpstreamError::transport(SERVICE, path))?;
        read_json(SERVICE, path, response).await
    }

    /// Provider response for the pickup point list, passed through.
    pub async fn pickup_points(&self, body: &Value) -> Result<Value, UpstreamError> {
        self.delivery_post("pickup-points/list", body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_is_clamped_and_symmetric() {
        let (lat, lon) = radius_intervals(55.7558, 37.6176, 5.0);
        let (lat_min, _) = radius_intervals(55.7558, 37.6176, 100.0);
        assert_eq!(lat, lat_min);
        assert!(((lat.to - 55.7558) - (55.7558 - lat.from)).abs() < 1e-12);
        assert!(((lon.to - 37.6176) - (37.6176 - lon.from)).abs() < 1e-12);
        assert!(lon.to - lon.from > lat.to - lat.from);

        let (wide, _) = radius_intervals(55.0, 37.0, 1e9);
        assert!((wide.to - 55.0 - MAX_RADIUS_M / METERS_PER_DEGREE).abs() < 1e-9);
    }

    #[test]
    fn test_pvz_query_body() {
        let by_geo = PvzQuery { geo_id: Some(213), ..Default::default() };
        assert_eq!(by_geo.body(true).unwrap()["type"], "pickup_point");
        assert!(by_geo.body(false).unwrap().get("type").is_none());

        let by_point = PvzQuery { lat: Some(55.75), lon: Some(37.61), radius: Some(1000.0), ..Default::default() };
        let body = by_point.body(false).unwrap();
        assert!(body["latitude"]["from"].as_f64().unwrap() < 55.75);

        assert!(PvzQuery::default().body(true).is_err());
    }

    #[test]
    fn test_geocoder_response_parse() {
        let raw = r#"{"response":{"GeoObjectCollection":{"featureMember":[{"GeoObject":{"metaDataProperty":{"GeocoderMetaData":
            {"Address":{"country_code":"RU","formatted":"Россия, Москва, Красная площадь",
            "Components":[{"kind":"country","name":"Россия"},{"kind":"locality","name":"Москва"}]}}}}}]}}}"#;
        let body: GeocoderResponse = serde_json::from_str(raw).unwrap();
        let address = &body.response.collection.members[0].object.meta.geocoder.address;
        assert_eq!(address.country_code.as_deref(), Some("RU"));
        assert_eq!(address.components[1].name, "Москва");
    }
}
