//! Mutable stream destination.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where the encoder reads from and publishes to.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Live input produced by the upstream relay.
    pub input_address: String,
    /// Destination ingest address, e.g. `rtmp://a.rtmp.youtube.com/live2`.
    pub output_address: String,
    /// Secret stream key appended to the destination address.
    pub output_credential: String,
}

impl StreamConfig {
    pub fn new(input_address: impl Into<String>) -> Self {
        Self {
            input_address: input_address.into(),
            ..Default::default()
        }
    }

    /// The full publish URL handed to the encoder.
    pub fn publish_url(&self) -> String {
        format!(
            "{}/{}",
            self.output_address.trim_end_matches('/'),
            self.output_credential
        )
    }

    /// Credential with everything past the first four characters hidden.
    pub fn masked_credential(&self) -> String {
        let visible: String = self.output_credential.chars().take(4).collect();
        if self.output_credential.chars().count() > 4 {
            format!("{visible}****")
        } else {
            "****".to_string()
        }
    }
}

impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("input_address", &self.input_address)
            .field("output_address", &self.output_address)
            .field("output_credential", &self.masked_credential())
            .finish()
    }
}

/// Requested change to the stream destination.
///
/// `youtubeUrl` / `youtubeKey` (and the socket form `url` / `key`) are
/// accepted for older clients.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(alias = "youtubeUrl", alias = "url", default)]
    pub output_address: String,
    #[serde(alias = "youtubeKey", alias = "key", default)]
    pub output_credential: String,
    #[serde(default)]
    pub input_address: Option<String>,
}

impl std::fmt::Debug for ConfigUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigUpdate")
            .field("output_address", &self.output_address)
            .field("output_credential", &"****")
            .field("input_address", &self.input_address)
            .finish()
    }
}

impl ConfigUpdate {
    pub fn output(address: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            output_address: address.into(),
            output_credential: credential.into(),
            input_address: None,
        }
    }

    /// Both output fields must be present.
    pub fn validate(&self) -> Result<()> {
        if self.output_address.trim().is_empty() {
            return Err(Error::config_invalid("Output address must not be empty"));
        }
        if self.output_credential.trim().is_empty() {
            return Err(Error::config_invalid("Output stream key must not be empty"));
        }
        Ok(())
    }
}

/// Holds the current [`StreamConfig`]. Last write wins, no history.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    current: StreamConfig,
}

impl ConfigStore {
    pub fn new(initial: StreamConfig) -> Self {
        Self { current: initial }
    }

    /// Replace the output destination.
    pub fn set_output(&mut self, address: impl Into<String>, credential: impl Into<String>) {
        self.current.output_address = address.into().trim().to_string();
        self.current.output_credential = credential.into().trim().to_string();
    }

    /// Replace the input source address.
    pub fn set_input(&mut self, address: impl Into<String>) {
        self.current.input_address = address.into().trim().to_string();
    }

    /// Apply a [`ConfigUpdate`]. An absent or blank input keeps the current one.
    pub fn apply(&mut self, update: ConfigUpdate) {
        self.set_output(update.output_address, update.output_credential);
        if let Some(input) = update.input_address.filter(|i| !i.trim().is_empty()) {
            self.set_input(input);
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> StreamConfig {
        self.current.clone()
    }

    /// Check the fields a start needs. Reachability is the probe's job.
    pub fn validate_for_start(&self) -> Result<StreamConfig> {
        let config = &self.current;
        if config.output_address.is_empty() || config.output_credential.is_empty() {
            return Err(Error::config_invalid(
                "Please configure the output RTMP address and stream key first",
            ));
        }
        if config.input_address.is_empty() {
            return Err(Error::config_invalid("Input address is not configured"));
        }
        Ok(config.clone())
    }
}
