//! Suspend / resume tracking.
//!
//! Bus states:
//! - Active: frames flowing, normal operation
//! - Suspended: 3 ms of bus idle seen, peripheral in low power
//! - Resuming: host (external) or device (internal, remote wakeup)
//!   resume in progress
//!
//! Resume is a small state machine driven by expected-start-of-frame
//! ticks (1 ms each):
//!
//! ```text
//! External ─────────────────────────────────────────▶ Off
//! Internal ──▶ Wait(n) ──ESOF×n──▶ Start ──▶ On(m) ──ESOF×m──▶ Off
//! ```
//!
//! `Start` drives resume signalling; `On` keeps it asserted for
//! `RESUME_ASSERT_FRAMES` ticks before the bus is declared active again.

use crate::config::{RESUME_ASSERT_FRAMES, RESUME_WAIT_FRAMES};
use crate::usb::hw::UsbPeripheral;

/// Resume sequencing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResumeState {
    /// No resume in progress.
    Off,
    /// Host-initiated resume detected.
    External,
    /// Device-initiated (remote wakeup) resume requested.
    Internal,
    /// Waiting the given number of ESOF ticks before signalling.
    Wait(u8),
    /// About to drive resume signalling.
    Start,
    /// Resume signalling asserted for the given remaining ticks.
    On(u8),
}

/// Bus power state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusState {
    Active,
    Suspended,
    Resuming,
}

/// Tracks suspend and steps the resume state machine.
#[derive(Clone, Copy, Debug)]
pub struct SuspendTracker {
    resume: ResumeState,
    suspended: bool,
}

impl Default for SuspendTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendTracker {
    pub const fn new() -> Self {
        Self {
            resume: ResumeState::Off,
            suspended: false,
        }
    }

    pub fn resume_state(&self) -> ResumeState {
        self.resume
    }

    pub fn bus_state(&self) -> BusState {
        match (self.suspended, self.resume) {
            (_, ResumeState::Off) if !self.suspended => BusState::Active,
            (true, ResumeState::Off) => BusState::Suspended,
            _ => BusState::Resuming,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Bus reset: everything back to active.
    pub fn reset(&mut self, hw: &mut dyn UsbPeripheral) {
        if self.suspended {
            hw.wake();
        }
        if matches!(self.resume, ResumeState::On(_)) {
            hw.set_resume_signal(false);
        }
        *self = Self::new();
    }

    /// SUSP interrupt.
    pub fn suspend(&mut self, hw: &mut dyn UsbPeripheral) {
        if self.suspended {
            return;
        }
        info!("USB: bus suspended");
        self.suspended = true;
        self.resume = ResumeState::Off;
        hw.suspend();
    }

    /// WKUP interrupt: the host resumed the bus.
    pub fn host_resume(&mut self, hw: &mut dyn UsbPeripheral) {
        self.resume = ResumeState::External;
        self.step(hw);
    }

    /// Remote wakeup request from mainline. Ignored unless suspended.
    pub fn remote_wakeup(&mut self, hw: &mut dyn UsbPeripheral) -> bool {
        if !self.suspended || self.resume != ResumeState::Off {
            return false;
        }
        self.resume = ResumeState::Internal;
        self.step(hw);
        true
    }

    /// ESOF interrupt.
    pub fn frame_tick(&mut self, hw: &mut dyn UsbPeripheral) {
        if self.resume != ResumeState::Off {
            self.step(hw);
        }
    }

    fn step(&mut self, hw: &mut dyn UsbPeripheral) {
        self.resume = match self.resume {
            ResumeState::External => {
                hw.wake();
                self.suspended = false;
                debug!("USB: host resume");
                ResumeState::Off
            }
            ResumeState::Internal => {
                hw.wake();
                ResumeState::Wait(RESUME_WAIT_FRAMES)
            }
            ResumeState::Wait(n) if n > 1 => ResumeState::Wait(n - 1),
            ResumeState::Wait(_) => ResumeState::Start,
            ResumeState::Start => {
                hw.set_resume_signal(true);
                ResumeState::On(RESUME_ASSERT_FRAMES)
            }
            ResumeState::On(n) if n > 1 => ResumeState::On(n - 1),
            ResumeState::On(_) => {
                hw.set_resume_signal(false);
                self.suspended = false;
                debug!("USB: remote wakeup complete");
                ResumeState::Off
            }
            ResumeState::Off => ResumeState::Off,
        };
    }
}
