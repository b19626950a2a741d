//! Read-only client for the ViCare IoT API.
//!
//! The API exposes one "feature document" per device: a flat list of every
//! data point the device reports, keyed by dotted feature names such as
//! `heating.circuits.0.circulation.pump`. The whole document is fetched in a
//! single request and cached for a configurable amount of time, so that
//! polling many sensors does not burn through the vendor's request quota.
//!
//! Obtaining and refreshing the OAuth access token is out of scope; the
//! client is handed a ready-to-use token.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("feature `{0}` is not available on this device")]
    NotSupported(String),
    #[error("could not retrieve data from the server")]
    Connection(#[source] reqwest::Error),
    #[error("could not decode the feature document returned by the server")]
    Decode(#[source] reqwest::Error),
    #[error("API request quota exhausted")]
    RateLimit { reset: Option<jiff::Timestamp> },
    #[error("invalid data for feature `{feature}`: {detail}")]
    InvalidData { feature: String, detail: String },
    #[error("could not read the access token from {1:?}")]
    ReadTokenFile(#[source] std::io::Error, PathBuf),
    #[error("the API base URL cannot carry path segments")]
    ApiUrl,
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("server responded with status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
}

#[derive(clap::Parser, Clone)]
#[group(id = "client::Args")]
pub struct Args {
    #[clap(flatten)]
    auth: TokenGroup,

    /// Base URL of the ViCare IoT API.
    #[arg(long, default_value = "https://api.viessmann.com/iot/v2")]
    api_url: reqwest::Url,

    /// Numeric id of the installation the device belongs to.
    #[arg(long)]
    installation: u32,

    /// Serial of the gateway the device is attached to.
    #[arg(long)]
    gateway: String,

    /// Device id within the gateway (usually `0`).
    #[arg(long, default_value = "0")]
    device: String,

    /// How long a fetched feature document stays fresh.
    ///
    /// Polls within this window are answered from the cached document without
    /// touching the server. The vendor enforces a daily request quota, so
    /// lowering this much below a minute is rarely a good idea.
    #[arg(long, default_value = "60s")]
    cache_ttl: humantime::Duration,

    /// Abandon an API request after this amount of time.
    #[arg(long, default_value = "30s")]
    request_timeout: humantime::Duration,
}

#[derive(clap::Parser, Clone)]
#[group(required = true)]
pub struct TokenGroup {
    /// The OAuth access token for the ViCare API.
    #[arg(long)]
    token: Option<String>,
    /// Read the OAuth access token from the first line of this file.
    #[arg(long)]
    token_file: Option<PathBuf>,
}

pub struct ApiClient {
    http: reqwest::Client,
    features_url: reqwest::Url,
    token: String,
    gateway: String,
    device: String,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, Arc<FeatureSnapshot>)>>,
}

impl ApiClient {
    pub fn new(args: Args) -> Result<Self, Error> {
        let token = match (args.auth.token, args.auth.token_file) {
            (Some(token), _) => token,
            (None, Some(path)) => {
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| Error::ReadTokenFile(e, path.clone()))?;
                contents.lines().next().unwrap_or("").trim().to_string()
            }
            (None, None) => panic!("both `--token` and `--token-file` are `None`?"),
        };
        let installation = args.installation.to_string();
        let mut features_url = args.api_url.clone();
        features_url
            .path_segments_mut()
            .map_err(|_| Error::ApiUrl)?
            .pop_if_empty()
            .extend([
                "features",
                "installations",
                installation.as_str(),
                "gateways",
                args.gateway.as_str(),
                "devices",
                args.device.as_str(),
                "features",
            ]);
        let http = reqwest::Client::builder()
            .timeout(*args.request_timeout)
            .build()
            .map_err(Error::CreateReqwest)?;
        Ok(Self {
            http,
            features_url,
            token,
            gateway: args.gateway,
            device: args.device,
            cache_ttl: *args.cache_ttl,
            cache: Mutex::new(None),
        })
    }

    /// A stable identifier for the device, used to derive sensor unique ids.
    pub fn device_ident(&self) -> String {
        format!("{}-{}", self.gateway, self.device)
    }

    /// The current feature document, fetched at most once per cache TTL.
    ///
    /// Holding the cache lock across the fetch makes concurrent callers wait
    /// for the in-flight request instead of issuing their own.
    pub async fn features(&self) -> Result<Arc<FeatureSnapshot>, Error> {
        let mut cache = self.cache.lock().await;
        if let Some((fetched_at, snapshot)) = &*cache {
            if fetched_at.elapsed() < self.cache_ttl {
                return Ok(Arc::clone(snapshot));
            }
        }
        let snapshot = Arc::new(self.fetch().await?);
        *cache = Some((Instant::now(), Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    async fn fetch(&self) -> Result<FeatureSnapshot, Error> {
        debug!(url = %self.features_url, "fetching the feature document");
        let response = self
            .http
            .get(self.features_url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Error::Connection)?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let reset = response
                .json::<RateLimitPayload>()
                .await
                .ok()
                .and_then(|p| p.extended_payload)
                .and_then(|p| p.limit_reset)
                .and_then(|ms| jiff::Timestamp::from_millisecond(ms).ok());
            return Err(Error::RateLimit { reset });
        }
        if !response.status().is_success() {
            return Err(Error::UnexpectedStatus(response.status()));
        }
        let document = response
            .json::<FeatureDocument>()
            .await
            .map_err(Error::Decode)?;
        Ok(FeatureSnapshot::from_document(document))
    }
}

#[derive(serde::Deserialize)]
pub(crate) struct FeatureDocument {
    data: Vec<FeatureEntry>,
}

#[derive(serde::Deserialize)]
struct FeatureEntry {
    feature: String,
    #[serde(rename = "isEnabled", default)]
    is_enabled: bool,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitPayload {
    #[serde(default)]
    extended_payload: Option<ExtendedPayload>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendedPayload {
    #[serde(default)]
    limit_reset: Option<i64>,
}

/// One fetched feature document.
///
/// Only enabled features that actually carry properties are retained;
/// everything else reads as [`Error::NotSupported`], matching how the vendor
/// marks data points a particular device model does not provide.
pub struct FeatureSnapshot {
    features: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

impl FeatureSnapshot {
    pub(crate) fn from_document(document: FeatureDocument) -> Self {
        let features = document
            .data
            .into_iter()
            .filter(|entry| entry.is_enabled && !entry.properties.is_empty())
            .map(|entry| (entry.feature, entry.properties))
            .collect();
        Self { features }
    }

    pub fn view<'a>(&'a self, scope: &'a Scope) -> FeatureView<'a> {
        FeatureView { snapshot: self, scope }
    }

    /// Ids of the device's sub-components of the given kind.
    ///
    /// The vendor lists them in the `enabled` property of the component
    /// group feature (e.g. `heating.circuits`); a device without the group
    /// feature simply has no components of that kind.
    pub fn component_ids(&self, kind: ComponentKind) -> Vec<String> {
        let Some(properties) = self.features.get(kind.feature_group()) else {
            return Vec::new();
        };
        let Some(enabled) = properties
            .get("enabled")
            .and_then(|p| p.get("value"))
            .and_then(|v| v.as_array())
        else {
            return Vec::new();
        };
        enabled
            .iter()
            .filter_map(|id| match id {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    }

    fn properties(
        &self,
        feature: &str,
    ) -> Result<&serde_json::Map<String, serde_json::Value>, Error> {
        self.features
            .get(feature)
            .ok_or_else(|| Error::NotSupported(feature.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ComponentKind {
    Circuit,
    Burner,
    Compressor,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 3] = [Self::Circuit, Self::Burner, Self::Compressor];

    pub fn feature_group(self) -> &'static str {
        match self {
            Self::Circuit => "heating.circuits",
            Self::Burner => "heating.burners",
            Self::Compressor => "heating.compressors",
        }
    }
}

/// What a sensor is bound to: the device as a whole or one sub-component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Device,
    Component(ComponentKind, String),
}

impl Scope {
    pub fn component_id(&self) -> Option<&str> {
        match self {
            Self::Device => None,
            Self::Component(_, id) => Some(id),
        }
    }

    fn feature_prefix(&self) -> Option<String> {
        match self {
            Self::Device => None,
            Self::Component(kind, id) => Some(format!("{}.{id}", kind.feature_group())),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device => f.write_str("device"),
            Self::Component(kind, id) => f.write_fmt(format_args!("{kind} {id}")),
        }
    }
}

/// A feature document viewed through one scope.
///
/// Feature names given to the accessors are relative to the scope's prefix;
/// an empty name denotes the scoped component's own feature. Device-scoped
/// views resolve names as-is.
#[derive(Clone, Copy)]
pub struct FeatureView<'a> {
    snapshot: &'a FeatureSnapshot,
    scope: &'a Scope,
}

impl FeatureView<'_> {
    fn resolve(&self, feature: &str) -> String {
        match self.scope.feature_prefix() {
            None => feature.to_string(),
            Some(prefix) if feature.is_empty() => prefix,
            Some(prefix) => format!("{prefix}.{feature}"),
        }
    }

    fn property(&self, feature: &str, name: &str) -> Result<(String, &serde_json::Value), Error> {
        let resolved = self.resolve(feature);
        let properties = self.snapshot.properties(&resolved)?;
        let Some(value) = properties.get(name).and_then(|p| p.get("value")) else {
            return Err(Error::InvalidData {
                feature: resolved,
                detail: format!("missing `{name}` property"),
            });
        };
        Ok((resolved, value))
    }

    /// Read a feature whose `status` property is an `"on"`/`"off"` string.
    pub fn status_on(&self, feature: &str) -> Result<bool, Error> {
        let (resolved, value) = self.property(feature, "status")?;
        match value.as_str() {
            Some("on") => Ok(true),
            Some("off") => Ok(false),
            _ => Err(Error::InvalidData {
                feature: resolved,
                detail: format!("unexpected status value {value}"),
            }),
        }
    }

    /// Read a feature whose `active` property is a JSON boolean.
    pub fn active(&self, feature: &str) -> Result<bool, Error> {
        let (resolved, value) = self.property(feature, "active")?;
        value.as_bool().ok_or_else(|| Error::InvalidData {
            feature: resolved,
            detail: format!("`active` is not a boolean: {value}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    fn client_args(base: &str) -> Args {
        Args::parse_from([
            "test",
            "--token",
            "test-token",
            "--api-url",
            base,
            "--installation",
            "1234",
            "--gateway",
            "7571381573112225",
            "--device",
            "0",
        ])
    }

    fn snapshot(json: serde_json::Value) -> FeatureSnapshot {
        FeatureSnapshot::from_document(serde_json::from_value(json).unwrap())
    }

    #[test]
    fn accessors_read_the_two_property_shapes() {
        let snapshot = snapshot(serde_json::json!({
            "data": [
                {
                    "feature": "heating.dhw.charging",
                    "isEnabled": true,
                    "properties": {"active": {"type": "boolean", "value": true}},
                },
                {
                    "feature": "heating.circuits.0.circulation.pump",
                    "isEnabled": true,
                    "properties": {"status": {"type": "string", "value": "off"}},
                },
            ]
        }));
        let device = snapshot.view(&Scope::Device);
        assert_eq!(device.active("heating.dhw.charging").unwrap(), true);
        let circuit = Scope::Component(ComponentKind::Circuit, "0".to_string());
        assert_eq!(
            snapshot.view(&circuit).status_on("circulation.pump").unwrap(),
            false
        );
    }

    #[test]
    fn missing_and_disabled_features_read_as_not_supported() {
        let snapshot = snapshot(serde_json::json!({
            "data": [
                {
                    "feature": "heating.solar.pumps.circuit",
                    "isEnabled": false,
                    "properties": {"status": {"type": "string", "value": "on"}},
                },
            ]
        }));
        let device = snapshot.view(&Scope::Device);
        assert!(matches!(
            device.status_on("heating.solar.pumps.circuit"),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            device.status_on("heating.dhw.pumps.primary"),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn malformed_properties_read_as_invalid_data() {
        let snapshot = snapshot(serde_json::json!({
            "data": [
                {
                    "feature": "heating.dhw.charging",
                    "isEnabled": true,
                    "properties": {"active": {"type": "string", "value": "yes"}},
                },
            ]
        }));
        assert!(matches!(
            snapshot.view(&Scope::Device).active("heating.dhw.charging"),
            Err(Error::InvalidData { .. })
        ));
    }

    #[test]
    fn component_ids_come_from_the_group_feature() {
        let snapshot = snapshot(serde_json::json!({
            "data": [
                {
                    "feature": "heating.circuits",
                    "isEnabled": true,
                    "properties": {"enabled": {"type": "array", "value": ["0", "2"]}},
                },
            ]
        }));
        assert_eq!(snapshot.component_ids(ComponentKind::Circuit), ["0", "2"]);
        assert!(snapshot.component_ids(ComponentKind::Burner).is_empty());
    }

    #[tokio::test]
    async fn fetches_and_caches_the_feature_document() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path(
                "/features/installations/1234/gateways/7571381573112225/devices/0/features",
            ))
            .and(wiremock::matchers::header(
                "authorization",
                "Bearer test-token",
            ))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(
                serde_json::json!({
                    "data": [
                        {
                            "feature": "heating.dhw.charging",
                            "isEnabled": true,
                            "properties": {"active": {"type": "boolean", "value": false}},
                        },
                    ]
                }),
            ))
            .expect(1)
            .mount(&server)
            .await;
        let client = ApiClient::new(client_args(&server.uri())).unwrap();
        let first = client.features().await.unwrap();
        let second = client.features().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            first.view(&Scope::Device).active("heating.dhw.charging").unwrap(),
            false
        );
    }

    #[tokio::test]
    async fn surfaces_the_rate_limit_reset_time() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(429).set_body_json(
                serde_json::json!({
                    "statusCode": 429,
                    "errorType": "RATE_LIMIT_EXCEEDED",
                    "extendedPayload": {"limitReset": 1550089251237i64},
                }),
            ))
            .mount(&server)
            .await;
        let client = ApiClient::new(client_args(&server.uri())).unwrap();
        let Err(Error::RateLimit { reset: Some(reset) }) = client.features().await else {
            panic!("expected a rate limit error with a reset timestamp");
        };
        assert_eq!(reset, jiff::Timestamp::from_millisecond(1550089251237).unwrap());
    }

    #[tokio::test]
    async fn malformed_documents_surface_as_decode_errors() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_string("not a feature document"),
            )
            .mount(&server)
            .await;
        let client = ApiClient::new(client_args(&server.uri())).unwrap();
        assert!(matches!(
            client.features().await,
            Err(Error::Decode(_))
        ));
    }
}
