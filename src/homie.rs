//! Publishes the binary sensors as a Homie 5 device over MQTT.
//!
//! One node per scope (the device itself, each circuit, burner and
//! compressor), one retained boolean property per sensor. Everything is
//! read-only on the bus; there is nothing to subscribe to.

use crate::client::{ApiClient, Scope};
use crate::sensor::BinarySensor;
use homie5::client::{Publish, QoS};
use homie5::device_description::{
    DeviceDescriptionBuilder, HomieDeviceDescription, HomieNodeDescription,
    PropertyDescriptionBuilder,
};
use homie5::{Homie5DeviceProtocol, HomieDataType, HomieDeviceStatus, HomieDomain, HomieID};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, trace, warn};

#[derive(clap::Parser, Clone)]
#[group(id = "homie::Args")]
pub struct Args {
    /// Hostname of the MQTT broker to publish to.
    #[arg(long)]
    mqtt_host: String,

    /// Port of the MQTT broker.
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    #[arg(long)]
    mqtt_username: Option<String>,

    #[arg(long)]
    mqtt_password: Option<String>,

    /// The homie device id to publish under.
    #[arg(long, default_value = "vicare-heating")]
    device_id: String,

    /// Human readable name announced in the device description.
    #[arg(long, default_value = "ViCare heating device")]
    device_name: String,

    /// How often to poll the sensors.
    ///
    /// Polls that land within the feature cache TTL are answered from the
    /// cached document, so set the client's `--cache-ttl` below this to
    /// actually observe fresh values on every cycle.
    #[arg(long, default_value = "90s")]
    poll_period: humantime::Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not usable as a homie device id")]
    DeviceId(String),
    #[error("`{0}` is not usable as a homie node id")]
    NodeId(String),
    #[error("`{0}` is not usable as a homie property id")]
    PropertyId(String),
    #[error("could not build the homie device description")]
    Description(#[source] homie5::Homie5ProtocolError),
    #[error("could not publish an MQTT message")]
    Publish(#[source] rumqttc::v5::ClientError),
}

pub struct HeatingBridge {
    mqtt: rumqttc::v5::AsyncClient,
    protocol: Homie5DeviceProtocol,
    state: HomieDeviceStatus,
    description: HomieDeviceDescription,
    sensors: Vec<BridgeSensor>,
    client: ApiClient,
    poll_period: Duration,
}

struct BridgeSensor {
    node_id: HomieID,
    prop_id: HomieID,
    sensor: BinarySensor,
}

impl HeatingBridge {
    pub fn new(
        args: Args,
        client: ApiClient,
        sensors: Vec<BinarySensor>,
    ) -> Result<(Self, rumqttc::v5::EventLoop), Error> {
        let device_id = HomieID::try_from(args.device_id.clone())
            .map_err(|_| Error::DeviceId(args.device_id.clone()))?;
        let (protocol, last_will) = Homie5DeviceProtocol::new(device_id, HomieDomain::Default);
        let mut options =
            rumqttc::v5::MqttOptions::new(args.device_id, args.mqtt_host, args.mqtt_port);
        if let (Some(username), Some(password)) = (&args.mqtt_username, &args.mqtt_password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
            last_will.topic,
            last_will.message,
            convert_qos(last_will.qos),
            last_will.retain,
            None,
        ));
        let (mqtt, event_loop) = rumqttc::v5::AsyncClient::new(options, 64);
        let sensors = sensors
            .into_iter()
            .map(|sensor| {
                Ok(BridgeSensor {
                    node_id: node_id(sensor.scope())?,
                    prop_id: prop_id(sensor.key())?,
                    sensor,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let description = device_description(&args.device_name, &sensors);
        let bridge = Self {
            mqtt,
            protocol,
            state: HomieDeviceStatus::Init,
            description,
            sensors,
            client,
            poll_period: *args.poll_period,
        };
        Ok((bridge, event_loop))
    }

    pub async fn run(mut self, mut event_loop: rumqttc::v5::EventLoop) -> Result<(), Error> {
        // rumqttc only makes progress while its event loop is polled, so
        // drive it for the whole lifetime of the bridge.
        let _event_task = AbortOnDropHandle::new(tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => trace!(?event, "mqtt event"),
                    Err(e) => {
                        warn!(error = &e as &dyn std::error::Error, "mqtt connection error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));
        self.publish_device().await?;
        info!(period = ?self.poll_period, sensors = self.sensors.len(), "bridge is running");
        loop {
            tokio::time::sleep(self.poll_period).await;
            self.poll_and_publish(false).await?;
        }
    }

    async fn publish_device(&mut self) -> Result<(), Error> {
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    self.state = HomieDeviceStatus::Init;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let p = self
                        .protocol
                        .publish_description(&self.description)
                        .map_err(Error::Description)?;
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    self.poll_and_publish(true).await?;
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    // Binary sensors are not settable, nothing to subscribe.
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    self.state = HomieDeviceStatus::Ready;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
            }
        }
        Ok(())
    }

    /// Poll every sensor and publish the values that changed.
    ///
    /// A sensor that has never produced a value publishes nothing; a sensor
    /// whose poll failed keeps the last published (stale) value on the bus.
    async fn poll_and_publish(&mut self, publish_all: bool) -> Result<(), Error> {
        let Self {
            mqtt,
            protocol,
            sensors,
            client,
            ..
        } = self;
        for entry in sensors.iter_mut() {
            let previous = entry.sensor.state();
            entry.sensor.poll(client).await;
            let Some(value) = entry.sensor.state() else {
                continue;
            };
            if !publish_all && previous == Some(value) {
                continue;
            }
            let p = protocol.publish_value(&entry.node_id, &entry.prop_id, value.to_string(), true);
            mqtt.homie_publish(p).await.map_err(Error::Publish)?;
        }
        Ok(())
    }
}

fn node_id(scope: &Scope) -> Result<HomieID, Error> {
    let id = match scope {
        Scope::Device => "device".to_string(),
        Scope::Component(kind, id) => format!("{kind}-{id}"),
    };
    HomieID::try_from(id.clone()).map_err(|_| Error::NodeId(id))
}

fn prop_id(key: &str) -> Result<HomieID, Error> {
    let id = key.replace('_', "-");
    HomieID::try_from(id.clone()).map_err(|_| Error::PropertyId(id))
}

fn device_description(name: &str, sensors: &[BridgeSensor]) -> HomieDeviceDescription {
    let mut nodes: BTreeMap<HomieID, HomieNodeDescription> = BTreeMap::new();
    for entry in sensors {
        let node = nodes
            .entry(entry.node_id.clone())
            .or_insert_with(|| HomieNodeDescription {
                name: Some(entry.sensor.scope().to_string()),
                r#type: None,
                properties: BTreeMap::new(),
            });
        let property = PropertyDescriptionBuilder::new(HomieDataType::Boolean)
            .settable(false)
            .retained(true)
            .build();
        node.properties.insert(entry.prop_id.clone(), property);
    }
    let mut description = DeviceDescriptionBuilder::new().name(name);
    for (id, node) in nodes {
        description = description.add_node(id, node);
    }
    description.build()
}

trait MqttClientExt {
    type PublishError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError>;
}

impl MqttClientExt for rumqttc::v5::AsyncClient {
    type PublishError = rumqttc::v5::ClientError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError> {
        self.publish(p.topic, convert_qos(p.qos), p.retain, p.payload)
            .await
    }
}

fn convert_qos(homie: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match homie {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FeatureDocument, FeatureSnapshot};
    use crate::sensor::build_sensors;

    fn sensors() -> Vec<BridgeSensor> {
        let document: FeatureDocument = serde_json::from_value(serde_json::json!({
            "data": [
                {
                    "feature": "heating.circuits",
                    "isEnabled": true,
                    "properties": {"enabled": {"type": "array", "value": ["0"]}},
                },
                {
                    "feature": "heating.circuits.0.circulation.pump",
                    "isEnabled": true,
                    "properties": {"status": {"type": "string", "value": "on"}},
                },
                {
                    "feature": "heating.dhw.charging",
                    "isEnabled": true,
                    "properties": {"active": {"type": "boolean", "value": true}},
                },
            ]
        }))
        .unwrap();
        let snapshot = FeatureSnapshot::from_document(document);
        build_sensors("gw-0", &snapshot)
            .into_iter()
            .map(|sensor| BridgeSensor {
                node_id: node_id(sensor.scope()).unwrap(),
                prop_id: prop_id(sensor.key()).unwrap(),
                sensor,
            })
            .collect()
    }

    #[test]
    fn description_groups_sensors_into_nodes() {
        let description = device_description("test", &sensors());
        let node = HomieID::try_from("circuit-0").unwrap();
        let prop = HomieID::try_from("circulationpump-active").unwrap();
        let property = description
            .get_property_by_id(&node, &prop)
            .expect("circuit property missing from description");
        assert!(!property.settable);
        assert!(property.retained);

        let device_node = HomieID::try_from("device").unwrap();
        let charging = HomieID::try_from("charging-active").unwrap();
        assert!(description.get_property_by_id(&device_node, &charging).is_some());
    }

    #[test]
    fn property_ids_are_valid_homie_ids() {
        for (_, descriptor) in crate::features::all() {
            prop_id(descriptor.key).unwrap();
        }
    }
}
