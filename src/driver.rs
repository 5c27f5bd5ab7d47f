/*!
 # Shift-register output driver

 The eight diffusers hang off a 74HC595-style serial-in/parallel-out
 register (DATA, CLOCK, LATCH and an active-low OUTPUT ENABLE line).

 ## Bit order

 Bits are shifted most-significant first, so channel 8 goes out first and
 channel 1 ends up in the first stage. Channel `n` therefore drives register
 output `Q(n-1)` (channel 1 on QA). This order is fixed for the board and
 must not change without rewiring.
*/

use tracing::{debug, instrument, trace};

use crate::channel::OutputMask;

/// Pin-level access to the register.
///
/// Implementations only toggle lines; sequencing lives in [`OutputDriver`].
pub trait ShiftRegisterPins {
    /// Level on the serial data line
    fn set_data(&mut self, high: bool);
    /// One rising edge on the shift clock
    fn pulse_clock(&mut self);
    /// One rising edge on the storage (latch) clock
    fn pulse_latch(&mut self);
    /// `true` drives the outputs. The line is active low on the board, the
    /// implementation takes care of the inversion.
    fn set_output_enable(&mut self, enabled: bool);
}

/// Writes output masks to the register, skipping writes that change nothing
pub struct OutputDriver<P: ShiftRegisterPins> {
    pins: P,
    /// `None` until the first write after power-up
    last_applied: Option<OutputMask>,
    write_count: u64,
}

impl<P: ShiftRegisterPins> OutputDriver<P> {
    /// Takes the pins and keeps the outputs disabled until the first mask
    /// has been latched
    pub fn new(mut pins: P) -> Self {
        pins.set_output_enable(false);
        Self {
            pins,
            last_applied: None,
            write_count: 0,
        }
    }

    /// Puts `mask` on the outputs.
    ///
    /// Returns `false` without touching the hardware when `mask` is already
    /// there. There is no read-back from the register, so a write is assumed
    /// to land.
    #[instrument(skip(self, mask), fields(mask = %mask))]
    pub fn apply(&mut self, mask: OutputMask) -> bool {
        if self.last_applied == Some(mask) {
            trace!("Mask unchanged, skipping register write");
            return false;
        }

        self.shift_out(mask);
        self.last_applied = Some(mask);
        self.write_count += 1;
        debug!("Register now {} (write #{})", mask, self.write_count);
        true
    }

    fn shift_out(&mut self, mask: OutputMask) {
        let bits = mask.bits();
        self.pins.set_output_enable(false);
        for bit in (0..8).rev() {
            self.pins.set_data(bits & (1 << bit) != 0);
            self.pins.pulse_clock();
        }
        self.pins.pulse_latch();
        self.pins.set_output_enable(true);
    }

    pub fn last_applied(&self) -> Option<OutputMask> {
        self.last_applied
    }

    /// Number of shift/latch sequences performed
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }
}

/// In-memory model of the register.
///
/// Used when running off-board and by the tests; it keeps the shift stage,
/// the storage latch and the enable line like the real part does.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRegister {
    data: bool,
    shift: u8,
    storage: u8,
    enabled: bool,
    clock_pulses: u64,
    /// Every value the outputs showed while enabled
    visible: Vec<u8>,
}

impl SimulatedRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// What the outputs currently show, `None` while disabled
    pub fn outputs(&self) -> Option<u8> {
        self.enabled.then_some(self.storage)
    }

    pub fn visible_history(&self) -> &[u8] {
        &self.visible
    }

    pub fn clock_pulses(&self) -> u64 {
        self.clock_pulses
    }
}

impl ShiftRegisterPins for SimulatedRegister {
    fn set_data(&mut self, high: bool) {
        self.data = high;
    }

    fn pulse_clock(&mut self) {
        // first stage (QA) takes the data line, everything moves one up
        self.shift = (self.shift << 1) | self.data as u8;
        self.clock_pulses += 1;
    }

    fn pulse_latch(&mut self) {
        self.storage = self.shift;
        if self.enabled {
            self.visible.push(self.storage);
        }
        trace!("Latched {:#010b}", self.storage);
    }

    fn set_output_enable(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.visible.push(self.storage);
        }
        self.enabled = enabled;
    }
}
