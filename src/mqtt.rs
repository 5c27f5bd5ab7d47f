/*!
 # Home Assistant bridge

 Mirrors the outputs to an MQTT broker as eight switches plus one master
 switch, announced through Home Assistant discovery.

 Topics, with `zebrascent` as the default base topic:

 | topic                                 | direction | payload          |
 |---------------------------------------|-----------|------------------|
 | `zebrascent/status`                   | out       | `online`/`offline` (LWT) |
 | `zebrascent/ch{n}/state`              | out       | `ON`/`OFF`       |
 | `zebrascent/ch{n}/set`                | in        | `ON`/`OFF`       |
 | `zebrascent/all/state`                | out       | `ON` iff all on  |
 | `zebrascent/all/set`                  | in        | `ON`/`OFF`       |
 | `homeassistant/switch/zebrascent/ch{n}/config` | out | discovery JSON |
 | `homeassistant/switch/zebrascent/all/config`   | out | discovery JSON |

 After every (re)connect the full current state is published, never just
 deltas, so Home Assistant cannot drift from the device.
*/

use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::channel::{Aggregate, Channel, CHANNEL_COUNT};
use crate::config::Config;
use crate::controller::{Command, Request, SharedLink, StateSnapshot};
use crate::notify::Notification;

/// Pause after a failed connection attempt before polling again
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CLIENT_CAPACITY: usize = 64;

const PAYLOAD_ON: &str = "ON";
const PAYLOAD_OFF: &str = "OFF";
const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

fn payload(on: bool) -> &'static str {
    if on {
        PAYLOAD_ON
    } else {
        PAYLOAD_OFF
    }
}

/// Reads a switch command payload, case-insensitive
pub fn parse_switch_payload(payload: &[u8]) -> Option<bool> {
    let text = std::str::from_utf8(payload).ok()?.trim().to_ascii_lowercase();
    match text.as_str() {
        "on" | "1" | "true" => Some(true),
        "off" | "0" | "false" => Some(false),
        _ => None,
    }
}

/// Topic layout for one configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
    ha_prefix: String,
}

impl Topics {
    pub fn new(config: &Config) -> Self {
        Self {
            base: config.base_topic.clone(),
            ha_prefix: config.ha_prefix.clone(),
        }
    }

    pub fn availability(&self) -> String {
        format!("{}/status", self.base)
    }

    pub fn channel_state(&self, channel: Channel) -> String {
        format!("{}/ch{}/state", self.base, channel)
    }

    pub fn channel_command(&self, channel: Channel) -> String {
        format!("{}/ch{}/set", self.base, channel)
    }

    pub fn all_state(&self) -> String {
        format!("{}/all/state", self.base)
    }

    pub fn all_command(&self) -> String {
        format!("{}/all/set", self.base)
    }

    pub fn channel_discovery(&self, channel: Channel) -> String {
        format!("{}/switch/{}/ch{}/config", self.ha_prefix, self.base, channel)
    }

    pub fn all_discovery(&self) -> String {
        format!("{}/switch/{}/all/config", self.ha_prefix, self.base)
    }

    /// Every topic the bridge listens on
    pub fn command_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Channel::all().map(|c| self.channel_command(c)).collect();
        topics.push(self.all_command());
        topics
    }

    /// Turns an incoming publish into a controller command
    pub fn parse_command(&self, topic: &str, payload: &[u8]) -> Option<Command> {
        let ch = if topic == self.all_command() {
            0
        } else {
            let rest = topic.strip_prefix(&self.base)?.strip_prefix("/ch")?;
            let n: u8 = rest.strip_suffix("/set")?.parse().ok()?;
            Channel::new(n).ok()?.number()
        };
        let on = parse_switch_payload(payload)?;
        Some(Command::SetChannel { ch, on })
    }

    fn device(&self) -> serde_json::Value {
        json!({
            "identifiers": [self.base],
            "name": "Zebra-Scent",
            "manufacturer": "Zebra-Scent",
            "model": format!("{CHANNEL_COUNT}-channel diffuser controller"),
        })
    }

    /// Discovery document for one channel switch
    pub fn channel_discovery_payload(&self, channel: Channel, name: &str) -> serde_json::Value {
        json!({
            "name": name,
            "unique_id": format!("{}_ch{}", self.base, channel),
            "command_topic": self.channel_command(channel),
            "state_topic": self.channel_state(channel),
            "availability_topic": self.availability(),
            "payload_on": PAYLOAD_ON,
            "payload_off": PAYLOAD_OFF,
            "icon": "mdi:scent",
            "device": self.device(),
        })
    }

    /// Discovery document for the master switch
    pub fn all_discovery_payload(&self) -> serde_json::Value {
        json!({
            "name": format!("All {CHANNEL_COUNT} diffusers"),
            "unique_id": format!("{}_all", self.base),
            "command_topic": self.all_command(),
            "state_topic": self.all_state(),
            "availability_topic": self.availability(),
            "payload_on": PAYLOAD_ON,
            "payload_off": PAYLOAD_OFF,
            "icon": "mdi:scent",
            "device": self.device(),
        })
    }
}

/// Broker settings that need a new connection when they change
fn needs_reconnect(a: &Config, b: &Config) -> bool {
    a.mqtt_host != b.mqtt_host
        || a.mqtt_port != b.mqtt_port
        || a.mqtt_user != b.mqtt_user
        || a.mqtt_pass != b.mqtt_pass
        || a.base_topic != b.base_topic
        || a.ha_prefix != b.ha_prefix
}

enum SessionEnd {
    ConfigChanged,
    Shutdown,
}

/// Task that keeps the broker in sync with the controller
pub struct MqttBridge {
    client_id: String,
    link: SharedLink,
    requests: mpsc::Sender<Request>,
    config_rx: watch::Receiver<Config>,
    state_rx: watch::Receiver<StateSnapshot>,
    events: mpsc::UnboundedReceiver<Notification>,
}

impl MqttBridge {
    pub fn new(
        client_id: impl Into<String>,
        link: SharedLink,
        requests: mpsc::Sender<Request>,
        config_rx: watch::Receiver<Config>,
        state_rx: watch::Receiver<StateSnapshot>,
        events: mpsc::UnboundedReceiver<Notification>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            link,
            requests,
            config_rx,
            state_rx,
            events,
        }
    }

    /// Runs until the controller goes away
    #[instrument(skip(self), fields(client_id = %self.client_id))]
    pub async fn run(mut self) {
        loop {
            let config = self.config_rx.borrow_and_update().clone();
            let end = if config.mqtt_enabled() {
                self.session(config).await
            } else {
                self.idle().await
            };
            self.link.write().mqtt_connected = false;
            if let SessionEnd::Shutdown = end {
                info!("MQTT bridge stopped");
                return;
            }
        }
    }

    /// No broker configured: drop events until the settings change
    async fn idle(&mut self) -> SessionEnd {
        info!("MQTT disabled (no host configured)");
        loop {
            tokio::select! {
                changed = self.config_rx.changed() => {
                    if changed.is_err() {
                        return SessionEnd::Shutdown;
                    }
                    if self.config_rx.borrow().mqtt_enabled() {
                        return SessionEnd::ConfigChanged;
                    }
                }
                event = self.events.recv() => {
                    if event.is_none() {
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }

    /// Drives one broker connection.
    ///
    /// Nothing in here awaits the client: requests go through `try_*`, so
    /// a stalled broker can only cost dropped messages, never a stuck task.
    async fn session(&mut self, mut config: Config) -> SessionEnd {
        let mut topics = Topics::new(&config);
        let mut options = MqttOptions::new(&self.client_id, &config.mqtt_host, config.mqtt_port);
        options.set_keep_alive(KEEP_ALIVE);
        if !config.mqtt_user.is_empty() {
            options.set_credentials(&config.mqtt_user, &config.mqtt_pass);
        }
        options.set_last_will(LastWill::new(
            topics.availability(),
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        info!(
            "Connecting to MQTT broker {}:{}",
            config.mqtt_host, config.mqtt_port
        );
        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let mut retry_at: Option<Instant> = None;

        loop {
            tokio::select! {
                polled = eventloop.poll(), if retry_at.is_none() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        self.link.write().mqtt_connected = true;
                        self.on_connect(&client, &topics, &config);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        trace!("MQTT message on {}", publish.topic);
                        match topics.parse_command(&publish.topic, &publish.payload) {
                            Some(command) => {
                                if self.requests.send(Request::new(command)).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            None => debug!("Ignoring message on {}", publish.topic),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.link.read().mqtt_connected {
                            warn!("MQTT connection lost: {}", e);
                        } else {
                            debug!("MQTT connect failed: {}", e);
                        }
                        self.link.write().mqtt_connected = false;
                        retry_at = Some(Instant::now() + RECONNECT_DELAY);
                    }
                },
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                },
                changed = self.config_rx.changed() => {
                    if changed.is_err() {
                        return SessionEnd::Shutdown;
                    }
                    let next = self.config_rx.borrow_and_update().clone();
                    if needs_reconnect(&config, &next) {
                        info!("MQTT settings changed, reconnecting");
                        return SessionEnd::ConfigChanged;
                    }
                    if next.names != config.names && self.link.read().mqtt_connected {
                        info!("Channel names changed, re-sending discovery");
                        topics = Topics::new(&next);
                        publish_discovery(&client, &topics, &next);
                    }
                    config = next;
                },
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.link.read().mqtt_connected {
                            publish_event(&client, &topics, &event);
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },
            }
        }
    }

    fn on_connect(&self, client: &AsyncClient, topics: &Topics, config: &Config) {
        for topic in topics.command_topics() {
            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                error!("Subscribe to {} failed: {}", topic, e);
            }
        }
        publish_discovery(client, topics, config);

        let state = self.state_rx.borrow().clone();
        for (topic, body) in full_state_messages(topics, &state) {
            publish(client, topic, body);
        }
        debug!("Published full state {}", state.output_mask());
    }
}

/// Availability plus every state topic, as sent after each connect
pub fn full_state_messages(topics: &Topics, state: &StateSnapshot) -> Vec<(String, &'static str)> {
    let mask = state.output_mask();
    let mut messages = vec![(topics.availability(), ONLINE)];
    messages.extend(Channel::all().map(|c| (topics.channel_state(c), payload(mask.is_on(c)))));
    messages.push((topics.all_state(), payload(mask.all_on())));
    messages
}

/// Queues a retained publish, dropping it if the client queue is full
fn publish(client: &AsyncClient, topic: String, body: impl Into<Vec<u8>>) {
    if let Err(e) = client.try_publish(&topic, QoS::AtLeastOnce, true, body) {
        warn!("Dropping publish to {}: {}", topic, e);
    }
}

fn publish_discovery(client: &AsyncClient, topics: &Topics, config: &Config) {
    for (channel, name) in config.names.iter() {
        let doc = topics.channel_discovery_payload(channel, name);
        publish(client, topics.channel_discovery(channel), doc.to_string());
    }
    let doc = topics.all_discovery_payload();
    publish(client, topics.all_discovery(), doc.to_string());
}

fn publish_event(client: &AsyncClient, topics: &Topics, event: &Notification) {
    let (topic, on) = match event {
        Notification::Channel(change) => (topics.channel_state(change.channel), change.on),
        Notification::Aggregate(aggregate) => (topics.all_state(), *aggregate == Aggregate::AllOn),
    };
    publish(client, topic, payload(on));
}
