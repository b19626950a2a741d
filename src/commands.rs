pub mod features {
    use crate::features::{DeviceClass, SensorDescriptor, all};

    /// Search and output the known binary sensor descriptors.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: crate::output::Args,
        /// Only show descriptors matching this string.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not produce the output")]
        Output(#[source] crate::output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct DescriptorSchema {
        pub scope: &'static str,
        pub key: &'static str,
        pub translation_key: &'static str,
        pub device_class: Option<DeviceClass>,
        pub icon: Option<&'static str>,
    }

    fn is_match(scope: &str, descriptor: &SensorDescriptor, pattern: &str) -> bool {
        let pattern = pattern.to_lowercase();
        descriptor.key.contains(&pattern)
            || descriptor.translation_key.contains(&pattern)
            || scope.contains(&pattern)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.into_output().map_err(Error::Output)?;
        output
            .headers(vec!["Scope", "Key", "Translation key", "Class", "Icon"])
            .map_err(Error::Output)?;
        for (scope, descriptor) in all() {
            if let Some(pattern) = &args.filter {
                if !is_match(scope, descriptor, pattern) {
                    continue;
                }
            }
            output
                .row(
                    || {
                        vec![
                            scope.to_string(),
                            descriptor.key.to_string(),
                            descriptor.translation_key.to_string(),
                            descriptor
                                .device_class
                                .map(|c| c.to_string())
                                .unwrap_or_default(),
                            descriptor.icon.unwrap_or_default().to_string(),
                        ]
                    },
                    || DescriptorSchema {
                        scope,
                        key: descriptor.key,
                        translation_key: descriptor.translation_key,
                        device_class: descriptor.device_class,
                        icon: descriptor.icon,
                    },
                )
                .map_err(Error::Output)?;
        }
        output.finish().map_err(Error::Output)
    }
}

pub mod read {
    use crate::client::ApiClient;
    use crate::sensor::build_sensors;

    /// Take a one-shot reading of every supported binary sensor.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        client: crate::client::Args,
        #[clap(flatten)]
        output: crate::output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the API client")]
        Client(#[source] crate::client::Error),
        #[error("could not fetch the feature document")]
        Fetch(#[source] crate::client::Error),
        #[error("could not produce the output")]
        Output(#[source] crate::output::Error),
    }

    #[derive(serde::Serialize)]
    struct SensorReading<'a> {
        scope: String,
        key: &'static str,
        unique_id: &'a str,
        state: Option<bool>,
        available: bool,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(run_inner(args))
    }

    async fn run_inner(args: Args) -> Result<(), Error> {
        let client = ApiClient::new(args.client).map_err(Error::Client)?;
        let snapshot = client.features().await.map_err(Error::Fetch)?;
        let mut sensors = build_sensors(&client.device_ident(), &snapshot);
        futures::future::join_all(sensors.iter_mut().map(|sensor| sensor.poll(&client))).await;

        let mut output = args.output.into_output().map_err(Error::Output)?;
        output
            .headers(vec!["Scope", "Key", "Unique id", "State"])
            .map_err(Error::Output)?;
        for sensor in &sensors {
            output
                .row(
                    || {
                        vec![
                            sensor.scope().to_string(),
                            sensor.key().to_string(),
                            sensor.unique_id().to_string(),
                            match sensor.state() {
                                Some(true) => "on".to_string(),
                                Some(false) => "off".to_string(),
                                None => "unknown".to_string(),
                            },
                        ]
                    },
                    || SensorReading {
                        scope: sensor.scope().to_string(),
                        key: sensor.key(),
                        unique_id: sensor.unique_id(),
                        state: sensor.state(),
                        available: sensor.available(),
                    },
                )
                .map_err(Error::Output)?;
        }
        output.finish().map_err(Error::Output)
    }
}

pub mod homie {
    use crate::client::ApiClient;
    use crate::homie::HeatingBridge;
    use crate::sensor::build_sensors;
    use tracing::info;

    /// Publish the binary sensors as a Homie 5 device over MQTT.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        client: crate::client::Args,
        #[clap(flatten)]
        homie: crate::homie::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the API client")]
        Client(#[source] crate::client::Error),
        #[error("could not fetch the feature document")]
        Fetch(#[source] crate::client::Error),
        #[error("could not run the homie bridge")]
        Bridge(#[source] crate::homie::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(async {
            let client = ApiClient::new(args.client).map_err(Error::Client)?;
            let snapshot = client.features().await.map_err(Error::Fetch)?;
            let sensors = build_sensors(&client.device_ident(), &snapshot);
            info!(sensors = sensors.len(), "discovered supported binary sensors");
            let (bridge, event_loop) =
                HeatingBridge::new(args.homie, client, sensors).map_err(Error::Bridge)?;
            bridge.run(event_loop).await.map_err(Error::Bridge)
        })
    }
}
