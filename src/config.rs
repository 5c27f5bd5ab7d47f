/*!
 # Device configuration

 Broker settings for the home-automation bridge and the display names of the
 eight outputs. String lengths are bounded by the buffers the firmware keeps
 for them; anything longer is refused rather than truncated.
*/

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, CHANNEL_COUNT};
use crate::{Error, Result};

/// Longest accepted broker host, user, password, topic or prefix (bytes)
pub const MQTT_STRING_MAX: usize = 63;
/// Longest accepted channel display name (bytes)
pub const NAME_MAX: usize = 31;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_BASE_TOPIC: &str = "zebrascent";
pub const DEFAULT_HA_PREFIX: &str = "homeassistant";

/// Display names, index 0 = channel 1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ChannelNames([String; CHANNEL_COUNT]);

impl Default for ChannelNames {
    fn default() -> Self {
        Self(std::array::from_fn(|i| format!("Diffuser {}", i + 1)))
    }
}

impl ChannelNames {
    /// Builds the name table from user input.
    ///
    /// Blank entries and missing trailing entries fall back to
    /// `Diffuser N`; more than eight entries or an over-long name is refused.
    pub fn from_list(names: &[String]) -> Result<Self> {
        if names.len() > CHANNEL_COUNT {
            return Err(Error::Capacity {
                what: "channel names",
                limit: CHANNEL_COUNT,
            });
        }
        let mut out = Self::default();
        for (slot, name) in out.0.iter_mut().zip(names) {
            let name = name.trim();
            if name.len() > NAME_MAX {
                return Err(Error::Capacity {
                    what: "channel name",
                    limit: NAME_MAX,
                });
            }
            if !name.is_empty() {
                *slot = name.to_string();
            }
        }
        Ok(out)
    }

    pub fn get(&self, channel: Channel) -> &str {
        &self.0[channel.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, &str)> {
        Channel::all().zip(self.0.iter().map(String::as_str))
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.to_vec()
    }
}

impl TryFrom<Vec<String>> for ChannelNames {
    type Error = Error;

    fn try_from(names: Vec<String>) -> Result<Self> {
        Self::from_list(&names)
    }
}

impl From<ChannelNames> for Vec<String> {
    fn from(names: ChannelNames) -> Self {
        names.0.to_vec()
    }
}

/// Persisted device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Empty host disables the bridge
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub base_topic: String,
    pub ha_prefix: String,
    pub names: ChannelNames,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: String::new(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            ha_prefix: DEFAULT_HA_PREFIX.to_string(),
            names: ChannelNames::default(),
        }
    }
}

/// Broker settings as submitted from the settings page.
///
/// A missing password keeps the stored one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttUpdate {
    pub mqtt_host: String,
    pub mqtt_port: Option<u16>,
    pub mqtt_user: String,
    pub mqtt_pass: Option<String>,
    pub base_topic: String,
    pub ha_prefix: String,
}

/// Broker settings as reported back to clients; the password never leaves
/// the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttSettings {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub base_topic: String,
    pub ha_prefix: String,
}

fn check_len(what: &'static str, value: &str) -> Result<()> {
    if value.len() > MQTT_STRING_MAX {
        return Err(Error::Capacity {
            what,
            limit: MQTT_STRING_MAX,
        });
    }
    Ok(())
}

impl Config {
    pub fn mqtt_enabled(&self) -> bool {
        !self.mqtt_host.is_empty()
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            mqtt_host: self.mqtt_host.clone(),
            mqtt_port: self.mqtt_port,
            mqtt_user: self.mqtt_user.clone(),
            base_topic: self.base_topic.clone(),
            ha_prefix: self.ha_prefix.clone(),
        }
    }

    /// Checks every field against the firmware limits
    pub fn validate(&self) -> Result<()> {
        check_len("mqtt host", &self.mqtt_host)?;
        check_len("mqtt user", &self.mqtt_user)?;
        check_len("mqtt password", &self.mqtt_pass)?;
        check_len("base topic", &self.base_topic)?;
        check_len("discovery prefix", &self.ha_prefix)?;
        if self.mqtt_port == 0 {
            return Err(Error::ValueOutOfRange(0, 1, u16::MAX as u32));
        }
        if self.base_topic.is_empty() || self.ha_prefix.is_empty() {
            return Err(Error::General("topics must not be empty".into()));
        }
        for (_, name) in self.names.iter() {
            if name.len() > NAME_MAX {
                return Err(Error::Capacity {
                    what: "channel name",
                    limit: NAME_MAX,
                });
            }
        }
        Ok(())
    }

    /// Returns a copy with the broker settings replaced, or an error with
    /// `self` untouched
    pub fn with_mqtt(&self, update: MqttUpdate) -> Result<Config> {
        let mut next = self.clone();
        next.mqtt_host = update.mqtt_host.trim().to_string();
        next.mqtt_port = update.mqtt_port.unwrap_or(DEFAULT_MQTT_PORT);
        next.mqtt_user = update.mqtt_user.trim().to_string();
        if let Some(pass) = update.mqtt_pass.filter(|p| !p.is_empty()) {
            next.mqtt_pass = pass;
        }
        next.base_topic = non_empty_or(update.base_topic.trim(), DEFAULT_BASE_TOPIC);
        next.ha_prefix = non_empty_or(update.ha_prefix.trim(), DEFAULT_HA_PREFIX);
        next.validate()?;
        Ok(next)
    }

    /// Returns a copy with new display names
    pub fn with_names(&self, names: &[String]) -> Result<Config> {
        Ok(Config {
            names: ChannelNames::from_list(names)?,
            ..self.clone()
        })
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_firmware() {
        let cfg = Config::default();
        assert!(!cfg.mqtt_enabled());
        assert_eq!(cfg.mqtt_port, 1883);
        assert_eq!(cfg.base_topic, "zebrascent");
        assert_eq!(cfg.ha_prefix, "homeassistant");
        assert_eq!(cfg.names.get(Channel::new(8).unwrap()), "Diffuser 8");
        cfg.validate().unwrap();
    }

    #[test]
    fn blank_names_fall_back_to_default() {
        let names = ChannelNames::from_list(&["Rose".into(), "  ".into()]).unwrap();
        assert_eq!(names.get(Channel::new(1).unwrap()), "Rose");
        assert_eq!(names.get(Channel::new(2).unwrap()), "Diffuser 2");
        assert_eq!(names.get(Channel::new(3).unwrap()), "Diffuser 3");
    }

    #[test]
    fn long_name_is_a_capacity_error() {
        let err = ChannelNames::from_list(&["x".repeat(NAME_MAX + 1)]).unwrap_err();
        assert!(matches!(err, Error::Capacity { what: "channel name", .. }));

        let nine = vec![String::from("a"); CHANNEL_COUNT + 1];
        assert!(matches!(
            ChannelNames::from_list(&nine),
            Err(Error::Capacity { what: "channel names", .. })
        ));
    }

    #[test]
    fn mqtt_update_keeps_password_when_absent() {
        let cfg = Config {
            mqtt_pass: "secret".into(),
            ..Config::default()
        };
        let next = cfg
            .with_mqtt(MqttUpdate {
                mqtt_host: " broker.local ".into(),
                mqtt_port: Some(8883),
                mqtt_user: "ha".into(),
                mqtt_pass: None,
                base_topic: String::new(),
                ha_prefix: "ha".into(),
            })
            .unwrap();
        assert_eq!(next.mqtt_host, "broker.local");
        assert_eq!(next.mqtt_port, 8883);
        assert_eq!(next.mqtt_pass, "secret");
        assert_eq!(next.base_topic, DEFAULT_BASE_TOPIC);
        assert_eq!(next.ha_prefix, "ha");
        assert!(next.mqtt_enabled());
    }

    #[test]
    fn mqtt_update_overflow_leaves_config_alone() {
        let cfg = Config::default();
        let err = cfg
            .with_mqtt(MqttUpdate {
                mqtt_host: "h".repeat(MQTT_STRING_MAX + 1),
                ..MqttUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Capacity { what: "mqtt host", .. }));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn config_json_round_trips_with_camel_case_keys() {
        let cfg = Config::default().with_names(&["Lavender".into()]).unwrap();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["baseTopic"], "zebrascent");
        assert_eq!(json["names"][0], "Lavender");
        assert_eq!(json["names"].as_array().unwrap().len(), CHANNEL_COUNT);

        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn settings_view_leaves_out_password() {
        let cfg = Config {
            mqtt_host: "broker".into(),
            mqtt_user: "ha".into(),
            mqtt_pass: "secret".into(),
            ..Config::default()
        };
        let json = serde_json::to_value(cfg.mqtt_settings()).unwrap();
        assert_eq!(json["mqttHost"], "broker");
        assert_eq!(json["mqttUser"], "ha");
        assert_eq!(json["mqttPort"], 1883);
        assert!(json.get("mqttPass").is_none());
        assert!(!json.to_string().contains("secret"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"mqttHost":"10.0.0.2"}"#).unwrap();
        assert_eq!(cfg.mqtt_host, "10.0.0.2");
        assert_eq!(cfg.mqtt_port, DEFAULT_MQTT_PORT);
        assert_eq!(cfg.names, ChannelNames::default());
    }
}
