//! Binary sensor entities built from the descriptor tables.

use crate::client::{ApiClient, ComponentKind, Error, FeatureSnapshot, Scope};
use crate::features::{self, DeviceClass, SensorDescriptor};
use tracing::{debug, error, warn};

/// One boolean state feature bound to a device or sub-component.
///
/// Sensors are created once, against a feature snapshot that proved the
/// feature supported. A failed poll never removes a sensor; it keeps its
/// previous (possibly stale) value and only reads as unavailable while no
/// value has ever been read.
pub struct BinarySensor {
    descriptor: &'static SensorDescriptor,
    scope: Scope,
    unique_id: String,
    state: Option<bool>,
}

impl BinarySensor {
    fn new(device_ident: &str, scope: Scope, descriptor: &'static SensorDescriptor) -> Self {
        let unique_id = match scope.component_id() {
            None => format!("{device_ident}-{}", descriptor.key),
            Some(id) => format!("{device_ident}-{}-{id}", descriptor.key),
        };
        Self {
            descriptor,
            scope,
            unique_id,
            state: None,
        }
    }

    pub fn key(&self) -> &'static str {
        self.descriptor.key
    }

    pub fn translation_key(&self) -> &'static str {
        self.descriptor.translation_key
    }

    pub fn icon(&self) -> Option<&'static str> {
        self.descriptor.icon
    }

    pub fn device_class(&self) -> Option<DeviceClass> {
        self.descriptor.device_class
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn state(&self) -> Option<bool> {
        self.state
    }

    pub fn available(&self) -> bool {
        self.state.is_some()
    }

    /// Refresh the sensor from the vendor API.
    ///
    /// Any of the known failures leaves the previous state in place; the
    /// next scheduled poll is the retry.
    pub async fn poll(&mut self, client: &ApiClient) {
        let result = match client.features().await {
            Ok(snapshot) => (self.descriptor.read)(snapshot.view(&self.scope)),
            Err(e) => Err(e),
        };
        self.record(result);
    }

    fn record(&mut self, result: Result<bool, Error>) {
        match result {
            Ok(value) => self.state = Some(value),
            Err(Error::NotSupported(_)) => {}
            Err(error @ Error::Connection(_)) => {
                error!(
                    sensor = %self.unique_id,
                    error = &error as &dyn std::error::Error,
                    "unable to retrieve data from the server"
                );
            }
            Err(error @ Error::Decode(_)) => {
                error!(
                    sensor = %self.unique_id,
                    error = &error as &dyn std::error::Error,
                    "unable to decode data from the server"
                );
            }
            Err(Error::RateLimit { reset }) => {
                error!(sensor = %self.unique_id, reset = ?reset, "API rate limit exceeded");
            }
            Err(error @ Error::InvalidData { .. }) => {
                error!(
                    sensor = %self.unique_id,
                    error = &error as &dyn std::error::Error,
                    "invalid data received from the server"
                );
            }
            Err(error) => {
                error!(
                    sensor = %self.unique_id,
                    error = &error as &dyn std::error::Error,
                    "could not poll the sensor"
                );
            }
        }
    }
}

/// Build one sensor for every supported (scope, descriptor) pair.
///
/// The snapshot decides support: global descriptors are probed against the
/// device scope, component descriptors against every enumerated component.
/// The result is deterministic for a given snapshot (table order crossed
/// with component id order).
pub fn build_sensors(device_ident: &str, snapshot: &FeatureSnapshot) -> Vec<BinarySensor> {
    let mut sensors: Vec<BinarySensor> = features::GLOBAL_SENSORS
        .iter()
        .filter(|descriptor| is_supported(snapshot, &Scope::Device, descriptor))
        .map(|descriptor| BinarySensor::new(device_ident, Scope::Device, descriptor))
        .collect();
    for kind in ComponentKind::ALL {
        for id in snapshot.component_ids(kind) {
            let scope = Scope::Component(kind, id);
            sensors.extend(
                features::for_component(kind)
                    .iter()
                    .filter(|descriptor| is_supported(snapshot, &scope, descriptor))
                    .map(|descriptor| {
                        BinarySensor::new(device_ident, scope.clone(), descriptor)
                    }),
            );
        }
    }
    sensors
}

fn is_supported(snapshot: &FeatureSnapshot, scope: &Scope, descriptor: &SensorDescriptor) -> bool {
    match (descriptor.read)(snapshot.view(scope)) {
        Ok(_) => {
            debug!(key = descriptor.key, %scope, "found supported sensor");
            true
        }
        Err(Error::NotSupported(feature)) => {
            debug!(key = descriptor.key, feature = %feature, "feature not supported");
            false
        }
        Err(error) => {
            warn!(
                key = descriptor.key,
                error = &error as &dyn std::error::Error,
                "skipping sensor, probe failed"
            );
            false
        }
    }
}
