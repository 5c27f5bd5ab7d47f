/*!
 # Change notifications

 After an output write the controller tells its observers (home-automation
 bridge, UI state feed) what changed. Observers receive final values only and
 never reconcile anything themselves.
*/

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::{Aggregate, Channel, OutputMask};
use crate::config::ChannelNames;

/// One output switched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelChange {
    pub channel: Channel,
    pub on: bool,
    /// Display name at the time of the change
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Channel(ChannelChange),
    /// Emitted once after the per-channel events of a transition
    Aggregate(Aggregate),
}

/// Receiver of notifications
pub trait ChangeObserver: Send {
    fn on_change(&mut self, event: &Notification);
}

impl ChangeObserver for mpsc::UnboundedSender<Notification> {
    fn on_change(&mut self, event: &Notification) {
        if self.send(event.clone()).is_err() {
            warn!("Notification receiver dropped, event lost");
        }
    }
}

/// Fans transitions out to every registered observer
#[derive(Default)]
pub struct ChangeNotifier {
    observers: Vec<Box<dyn ChangeObserver>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: impl ChangeObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Emits the events for `old -> new` and returns how many were sent to
    /// each observer (zero when nothing changed)
    pub fn notify(&mut self, old: OutputMask, new: OutputMask, names: &ChannelNames) -> usize {
        if old == new {
            return 0;
        }

        let mut events: Vec<Notification> = old
            .changed_channels(new)
            .map(|channel| {
                Notification::Channel(ChannelChange {
                    channel,
                    on: new.is_on(channel),
                    name: names.get(channel).to_string(),
                })
            })
            .collect();
        events.push(Notification::Aggregate(new.aggregate()));

        debug!(
            "Notifying {} observer(s) of {} -> {} ({} events)",
            self.observers.len(),
            old,
            new,
            events.len()
        );
        for observer in &mut self.observers {
            for event in &events {
                observer.on_change(event);
            }
        }
        events.len()
    }
}
