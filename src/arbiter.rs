/*!
 # Manual overrides

 A manual command takes a channel away from the schedule until the schedule
 itself changes its mind for that channel. The override remembers what the
 schedule said when it was set and is dropped on the first tick where the
 schedule says something different. A schedule that merely keeps saying the
 same thing never releases it, so manual state does not flap back every tick.
*/

use tracing::{debug, instrument};

use crate::channel::{Channel, OutputMask, Target, CHANNEL_COUNT};

/// Bookkeeping for one output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelState {
    /// What the schedule wants on the latest tick
    pub scheduled_on: bool,
    pub override_active: bool,
    pub override_value: bool,
    /// Scheduled value at the moment the override was set
    pub override_anchor: bool,
    /// Last value written to the hardware
    pub applied_on: bool,
}

impl ChannelState {
    /// Value this channel should have right now
    pub fn effective(&self) -> bool {
        if self.override_active {
            self.override_value
        } else {
            self.scheduled_on
        }
    }
}

/// Merges the scheduled mask with manual overrides
#[derive(Debug, Clone, Default)]
pub struct OverrideArbiter {
    states: [ChannelState; CHANNEL_COUNT],
}

impl OverrideArbiter {
    /// All channels off, no overrides
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, channel: Channel) -> &ChannelState {
        &self.states[channel.index()]
    }

    pub fn states(&self) -> &[ChannelState; CHANNEL_COUNT] {
        &self.states
    }

    pub fn active_overrides(&self) -> usize {
        self.states.iter().filter(|s| s.override_active).count()
    }

    /// Takes manual control of `target`.
    ///
    /// `scheduled` is the schedule's verdict at the time of the command; the
    /// override lasts until that verdict changes for the channel.
    #[instrument(skip(self))]
    pub fn set_override(&mut self, target: Target, value: bool, scheduled: OutputMask) {
        for channel in Channel::all().filter(|c| target.includes(*c)) {
            let state = &mut self.states[channel.index()];
            state.override_active = true;
            state.override_value = value;
            state.override_anchor = scheduled.is_on(channel);
            state.scheduled_on = scheduled.is_on(channel);
        }
        debug!(
            "Override set for {:?} -> {}, {} active",
            target,
            value,
            self.active_overrides()
        );
    }

    /// Produces the final mask for this tick, releasing overrides whose
    /// channel just saw a schedule edge
    pub fn reconcile(&mut self, scheduled: OutputMask) -> OutputMask {
        let mut out = OutputMask::ALL_OFF;
        for channel in Channel::all() {
            let state = &mut self.states[channel.index()];
            state.scheduled_on = scheduled.is_on(channel);

            if state.override_active && state.scheduled_on != state.override_anchor {
                state.override_active = false;
                debug!(
                    "Schedule edge on channel {} ({} -> {}), releasing override",
                    channel, state.override_anchor, state.scheduled_on
                );
            }

            out.set(channel, state.effective());
        }
        out
    }

    /// Remembers what actually reached the hardware
    pub fn record_applied(&mut self, mask: OutputMask) {
        for channel in Channel::all() {
            self.states[channel.index()].applied_on = mask.is_on(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    fn only(n: u8) -> OutputMask {
        OutputMask::ALL_OFF.with(ch(n), true)
    }

    #[test]
    fn no_overrides_passes_schedule_through() {
        let mut arbiter = OverrideArbiter::new();
        assert_eq!(arbiter.reconcile(only(4)), only(4));
        assert_eq!(arbiter.reconcile(OutputMask::ALL_OFF), OutputMask::ALL_OFF);
    }

    #[test]
    fn override_replaces_scheduled_bit_immediately() {
        let mut arbiter = OverrideArbiter::new();
        arbiter.set_override(Target::One(ch(2)), true, OutputMask::ALL_OFF);
        assert_eq!(arbiter.reconcile(OutputMask::ALL_OFF), only(2));
        assert!(arbiter.state(ch(2)).override_active);
    }

    #[test]
    fn sustained_schedule_keeps_override() {
        let mut arbiter = OverrideArbiter::new();
        arbiter.reconcile(only(1));
        arbiter.set_override(Target::One(ch(1)), false, only(1));
        for _ in 0..100 {
            assert_eq!(arbiter.reconcile(only(1)), OutputMask::ALL_OFF);
        }
        assert!(arbiter.state(ch(1)).override_active);
    }

    #[test]
    fn schedule_edge_releases_override_on_that_tick() {
        let mut arbiter = OverrideArbiter::new();
        arbiter.set_override(Target::One(ch(3)), true, only(3));
        assert_eq!(arbiter.reconcile(only(3)), only(3));

        // schedule turns the channel off at its boundary
        assert_eq!(arbiter.reconcile(OutputMask::ALL_OFF), OutputMask::ALL_OFF);
        assert!(!arbiter.state(ch(3)).override_active);

        // and the schedule owns it again afterwards
        assert_eq!(arbiter.reconcile(only(3)), only(3));
    }

    #[test]
    fn edge_on_other_channel_does_not_release() {
        let mut arbiter = OverrideArbiter::new();
        arbiter.set_override(Target::One(ch(1)), true, OutputMask::ALL_OFF);
        assert_eq!(arbiter.reconcile(only(5)), only(1).with(ch(5), true));
        assert!(arbiter.state(ch(1)).override_active);
    }

    #[test]
    fn set_all_overrides_every_channel() {
        let mut arbiter = OverrideArbiter::new();
        arbiter.set_override(Target::One(ch(6)), false, OutputMask::ALL_OFF);
        arbiter.set_override(Target::All, true, OutputMask::ALL_OFF);
        assert_eq!(arbiter.reconcile(OutputMask::ALL_OFF), OutputMask::ALL_ON);
        assert_eq!(arbiter.active_overrides(), CHANNEL_COUNT);
    }

    #[test]
    fn applied_state_is_tracked() {
        let mut arbiter = OverrideArbiter::new();
        arbiter.record_applied(only(7));
        assert!(arbiter.state(ch(7)).applied_on);
        assert!(!arbiter.state(ch(1)).applied_on);
    }
}
