/*!
 # Controller

 Owns the rule table, the configuration and the per-channel state, and runs
 one evaluation tick at a time:

 clock → schedule → overrides → register → notifications.

 Everything that changes state goes through a `&mut self` method, so a tick
 always sees a consistent set of rules and overrides. Read-only views for
 other tasks are published through `watch` channels.
*/

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, instrument, warn};

use crate::arbiter::OverrideArbiter;
use crate::channel::{Channel, OutputMask, Target};
use crate::clock::{ClockReading, ClockSource};
use crate::config::{Config, MqttSettings, MqttUpdate};
use crate::driver::{OutputDriver, ShiftRegisterPins};
use crate::notify::{ChangeNotifier, ChangeObserver};
use crate::schedule::{evaluate_reading, RuleRecord, RuleSet};
use crate::store::Persistence;
use crate::Result;

/// Connectivity as seen by the network side; reported, never acted on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub network_up: bool,
    pub ip: Option<String>,
    pub mqtt_connected: bool,
}

impl Link {
    /// Records the host's current address; no usable address means the
    /// network is down. Returns whether anything changed.
    pub fn update_address(&mut self, ip: Option<IpAddr>) -> bool {
        let ip = ip.filter(|ip| !ip.is_loopback() && !ip.is_unspecified());
        let next_up = ip.is_some();
        let next_ip = ip.map(|ip| ip.to_string());
        if self.network_up == next_up && self.ip == next_ip {
            return false;
        }
        self.network_up = next_up;
        self.ip = next_ip;
        true
    }
}

/// Link flags shared between the controller and the network tasks
pub type SharedLink = Arc<RwLock<Link>>;

/// Everything the UI state endpoint reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub mask: u8,
    /// Channels currently under manual control, same bit layout as `mask`
    pub override_mask: u8,
    pub time_ok: bool,
    pub now_min: u16,
    pub ip: String,
    pub names: Vec<String>,
    pub all_on: bool,
    pub any_on: bool,
    pub network_connected: bool,
    pub mqtt_enabled: bool,
    pub mqtt_connected: bool,
}

impl StateSnapshot {
    pub fn output_mask(&self) -> OutputMask {
        OutputMask::from_bits(self.mask)
    }
}

/// Operations other tasks may ask the controller to perform
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Channel 0 switches all outputs
    SetChannel { ch: u8, on: bool },
    ReplaceRules(Vec<RuleRecord>),
    ReplaceNames(Vec<String>),
    ReplaceMqtt(MqttUpdate),
    QueryState,
    QueryRules,
    QueryMqtt,
}

/// Successful outcome of a [`Command`]
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    State(StateSnapshot),
    Rules(Vec<RuleRecord>),
    Mqtt(MqttSettings),
}

/// A command plus an optional way to hear back
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub reply: Option<oneshot::Sender<Result<Reply>>>,
}

impl Request {
    /// Fire-and-forget request
    pub fn new(command: Command) -> Self {
        Self {
            command,
            reply: None,
        }
    }

    /// Request whose outcome arrives on the returned receiver
    pub fn with_reply(command: Command) -> (Self, oneshot::Receiver<Result<Reply>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }
}

pub struct Controller<C, P, S>
where
    C: ClockSource,
    P: ShiftRegisterPins,
    S: Persistence,
{
    clock: C,
    store: S,
    rules: RuleSet,
    config: Config,
    arbiter: OverrideArbiter,
    driver: OutputDriver<P>,
    notifier: ChangeNotifier,
    link: SharedLink,
    last_reading: ClockReading,
    state_tx: watch::Sender<StateSnapshot>,
    config_tx: watch::Sender<Config>,
}

impl<C, P, S> Controller<C, P, S>
where
    C: ClockSource,
    P: ShiftRegisterPins,
    S: Persistence,
{
    /// Boots the controller: loads rules and configuration from `store`,
    /// drives every output off and takes the first clock reading
    #[instrument(skip_all)]
    pub fn new(clock: C, pins: P, store: S, link: SharedLink) -> Self {
        let rules = store.load_rules();
        let config = store.load_config();
        let mut driver = OutputDriver::new(pins);
        driver.apply(OutputMask::ALL_OFF);

        let last_reading = clock.now();
        let mut arbiter = OverrideArbiter::new();
        arbiter.record_applied(OutputMask::ALL_OFF);

        let snapshot = build_snapshot(&arbiter, &config, &last_reading, &link.read());
        let (state_tx, _) = watch::channel(snapshot);
        let (config_tx, _) = watch::channel(config.clone());

        info!(
            "Controller ready: {} enabled rule(s), mqtt {}",
            rules.enabled_count(),
            if config.mqtt_enabled() { "on" } else { "off" }
        );

        Self {
            clock,
            store,
            rules,
            config,
            arbiter,
            driver,
            notifier: ChangeNotifier::new(),
            link,
            last_reading,
            state_tx,
            config_tx,
        }
    }

    pub fn subscribe(&mut self, observer: impl ChangeObserver + 'static) {
        self.notifier.subscribe(observer);
    }

    /// Latest state, refreshed after every tick and command
    pub fn state_updates(&self) -> watch::Receiver<StateSnapshot> {
        self.state_tx.subscribe()
    }

    /// Configuration, refreshed after every accepted change
    pub fn config_updates(&self) -> watch::Receiver<Config> {
        self.config_tx.subscribe()
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn arbiter(&self) -> &OverrideArbiter {
        &self.arbiter
    }

    pub fn driver(&self) -> &OutputDriver<P> {
        &self.driver
    }

    pub fn applied(&self) -> OutputMask {
        self.driver.last_applied().unwrap_or(OutputMask::ALL_OFF)
    }

    pub fn state(&self) -> StateSnapshot {
        build_snapshot(&self.arbiter, &self.config, &self.last_reading, &self.link.read())
    }

    /// One evaluation tick
    pub fn tick(&mut self) -> OutputMask {
        let reading = self.clock.now();
        let scheduled = evaluate_reading(&self.rules, &reading);
        self.commit(reading, scheduled)
    }

    fn commit(&mut self, reading: ClockReading, scheduled: OutputMask) -> OutputMask {
        if reading.synchronized != self.last_reading.synchronized {
            if reading.synchronized {
                info!("Clock synchronized, schedule active");
            } else {
                warn!("Clock lost synchronization, schedule holds outputs off");
            }
        }
        self.last_reading = reading;

        let previous = self.applied();
        let next = self.arbiter.reconcile(scheduled);
        if self.driver.apply(next) {
            self.arbiter.record_applied(next);
            self.notifier.notify(previous, next, &self.config.names);
        }
        self.publish_state();
        next
    }

    fn publish_state(&self) {
        let snapshot = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Manual switch; `ch == 0` addresses every channel.
    ///
    /// Takes effect immediately through a fresh tick.
    #[instrument(skip(self))]
    pub fn set_channel(&mut self, ch: u8, on: bool) -> Result<OutputMask> {
        let target = Target::from_wire(ch)?;
        let reading = self.clock.now();
        let scheduled = evaluate_reading(&self.rules, &reading);
        self.arbiter.set_override(target, on, scheduled);
        info!("Manual {:?} -> {}", target, if on { "ON" } else { "OFF" });
        Ok(self.commit(reading, scheduled))
    }

    /// Replaces the whole rule table.
    ///
    /// Nothing changes unless every record is valid and the table was stored.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub fn replace_rules(&mut self, records: &[RuleRecord]) -> Result<()> {
        let rules = RuleSet::from_records(records).inspect_err(|e| {
            warn!("Rule replace refused: {}", e);
        })?;
        self.store.save_rules(&rules)?;
        self.rules = rules;
        info!("Rules replaced, {} enabled", rules.enabled_count());
        self.tick();
        Ok(())
    }

    #[instrument(skip(self, names))]
    pub fn replace_names(&mut self, names: &[String]) -> Result<()> {
        let next = self.config.with_names(names).inspect_err(|e| {
            warn!("Name update refused: {}", e);
        })?;
        self.store_config(next)?;
        info!("Channel names updated");
        Ok(())
    }

    #[instrument(skip(self, update))]
    pub fn replace_mqtt_config(&mut self, update: MqttUpdate) -> Result<()> {
        let next = self.config.with_mqtt(update).inspect_err(|e| {
            warn!("MQTT settings refused: {}", e);
        })?;
        self.store_config(next)?;
        info!(
            "MQTT settings updated (host '{}', port {})",
            self.config.mqtt_host, self.config.mqtt_port
        );
        Ok(())
    }

    fn store_config(&mut self, next: Config) -> Result<()> {
        self.store.save_config(&next)?;
        self.config = next;
        self.config_tx.send_replace(self.config.clone());
        self.publish_state();
        Ok(())
    }

    /// Runs one command from the console or the bridge
    pub fn handle(&mut self, command: Command) -> Result<Reply> {
        debug!("Handling {:?}", command);
        match command {
            Command::SetChannel { ch, on } => self.set_channel(ch, on).map(|_| Reply::Done),
            Command::ReplaceRules(records) => self.replace_rules(&records).map(|_| Reply::Done),
            Command::ReplaceNames(names) => self.replace_names(&names).map(|_| Reply::Done),
            Command::ReplaceMqtt(update) => self.replace_mqtt_config(update).map(|_| Reply::Done),
            Command::QueryState => Ok(Reply::State(self.state())),
            Command::QueryRules => Ok(Reply::Rules(self.rules.to_records())),
            Command::QueryMqtt => Ok(Reply::Mqtt(self.config.mqtt_settings())),
        }
    }

    /// Runs a request and answers it if anyone is listening
    pub fn handle_request(&mut self, request: Request) {
        let outcome = self.handle(request.command);
        match request.reply {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => {
                if let Err(e) = outcome {
                    warn!("Command failed: {}", e);
                }
            }
        }
    }
}

fn build_snapshot(
    arbiter: &OverrideArbiter,
    config: &Config,
    reading: &ClockReading,
    link: &Link,
) -> StateSnapshot {
    let mut mask = OutputMask::ALL_OFF;
    let mut overrides = OutputMask::ALL_OFF;
    for channel in Channel::all() {
        let state = arbiter.state(channel);
        mask.set(channel, state.applied_on);
        overrides.set(channel, state.override_active);
    }
    StateSnapshot {
        mask: mask.bits(),
        override_mask: overrides.bits(),
        time_ok: reading.synchronized,
        now_min: reading.minute.get(),
        ip: link.ip.clone().unwrap_or_default(),
        names: config.names.to_vec(),
        all_on: mask.all_on(),
        any_on: mask.any_on(),
        network_connected: link.network_up,
        mqtt_enabled: config.mqtt_enabled(),
        mqtt_connected: link.mqtt_connected,
    }
}
