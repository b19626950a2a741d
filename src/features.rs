//! The known boolean state features, as static descriptor tables.
//!
//! Each table covers one scope: the device as a whole, or one kind of
//! sub-component. A descriptor pairs the stable key and display hints with
//! the accessor that reads the feature out of a document snapshot.

use crate::client::{ComponentKind, Error, FeatureView};

/// Hints for how the home-automation side should render a sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceClass {
    /// The sensor reflects whether a piece of machinery is running.
    Running,
    /// The sensor reflects whether something is powered.
    Power,
}

pub struct SensorDescriptor {
    pub key: &'static str,
    pub translation_key: &'static str,
    pub icon: Option<&'static str>,
    pub device_class: Option<DeviceClass>,
    pub read: fn(FeatureView<'_>) -> Result<bool, Error>,
}

macro_rules! sensors {
    (@icon) => { None };
    (@icon $icon: literal) => { Some($icon) };
    (@class) => { None };
    (@class $class: ident) => { Some(DeviceClass::$class) };
    ($(($key: literal / $tkey: literal $(, icon = $icon: literal)? $(, class = $class: ident)?): $read: expr;)*) => {
        [$(SensorDescriptor {
            key: $key,
            translation_key: $tkey,
            icon: sensors!(@icon $($icon)?),
            device_class: sensors!(@class $($class)?),
            read: $read,
        },)*]
    }
}

pub static GLOBAL_SENSORS: [SensorDescriptor; 4] = sensors![
    ("solar_pump_active" / "solar_pump", icon = "mdi:pump", class = Running):
        |api| api.status_on("heating.solar.pumps.circuit");
    ("charging_active" / "domestic_hot_water_charging", class = Running):
        |api| api.active("heating.dhw.charging");
    ("dhw_circulationpump_active" / "domestic_hot_water_circulation_pump", icon = "mdi:pump", class = Running):
        |api| api.status_on("heating.dhw.pumps.circulation");
    ("dhw_pump_active" / "domestic_hot_water_pump", icon = "mdi:pump", class = Running):
        |api| api.status_on("heating.dhw.pumps.primary");
];

pub static CIRCUIT_SENSORS: [SensorDescriptor; 2] = sensors![
    ("circulationpump_active" / "circulation_pump", icon = "mdi:pump", class = Running):
        |api| api.status_on("circulation.pump");
    ("frost_protection_active" / "frost_protection", icon = "mdi:snowflake"):
        |api| api.status_on("frostprotection");
];

pub static BURNER_SENSORS: [SensorDescriptor; 1] = sensors![
    // The empty name reads the burner's own feature (`heating.burners.N`).
    ("burner_active" / "burner", icon = "mdi:gas-burner", class = Running):
        |api| api.active("");
];

pub static COMPRESSOR_SENSORS: [SensorDescriptor; 1] = sensors![
    ("compressor_active" / "compressor", class = Running):
        |api| api.active("");
];

pub fn for_component(kind: ComponentKind) -> &'static [SensorDescriptor] {
    match kind {
        ComponentKind::Circuit => &CIRCUIT_SENSORS,
        ComponentKind::Burner => &BURNER_SENSORS,
        ComponentKind::Compressor => &COMPRESSOR_SENSORS,
    }
}

/// Every descriptor together with the label of the scope its table covers.
pub fn all() -> impl Iterator<Item = (&'static str, &'static SensorDescriptor)> {
    fn scoped(
        scope: &'static str,
        table: &'static [SensorDescriptor],
    ) -> impl Iterator<Item = (&'static str, &'static SensorDescriptor)> {
        table.iter().map(move |descriptor| (scope, descriptor))
    }
    scoped("device", &GLOBAL_SENSORS)
        .chain(scoped("circuit", &CIRCUIT_SENSORS))
        .chain(scoped("burner", &BURNER_SENSORS))
        .chain(scoped("compressor", &COMPRESSOR_SENSORS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_within_their_scope() {
        let mut seen = std::collections::BTreeSet::new();
        for (scope, descriptor) in all() {
            assert!(
                seen.insert((scope, descriptor.key)),
                "duplicate descriptor {}/{}",
                scope,
                descriptor.key,
            );
        }
    }

    #[test]
    fn descriptors_carry_display_metadata() {
        for (scope, descriptor) in all() {
            assert!(!descriptor.key.is_empty(), "empty key in {scope} table");
            assert!(
                !descriptor.translation_key.is_empty(),
                "descriptor {} has no translation key",
                descriptor.key,
            );
        }
    }
}
