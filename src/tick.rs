// SPDX-License-Identifier: Apache-2.0

//! Tick source and the software gates layered on top of it.
//!
//! The tick interrupt only ever calls [`TickCounter::on_tick`]. Everything else reads the counter
//! from the main loop through a [`CriticalSection`](critical_section::CriticalSection), since
//! Cortex-M0+ has no 64-bit atomics.

use core::cell::Cell;

use critical_section::Mutex;

use crate::error::Error;

/// Absolute tick count since reset
pub type Ticks = u64;

/// Counter state, updated as a unit inside the tick interrupt
#[derive(Debug, Default, Copy, Clone)]
struct TickState {
    /// Monotonic ticks since reset. 64 bits never wrap within a session.
    total: Ticks,
    /// Ticks since the start of the current long interval
    epoch: u32,
    /// Set once `epoch` reaches the long interval, cleared by the consumer
    long_interval: bool,
}

/// Monotonic tick counter shared between the tick interrupt and the main loop.
pub struct TickCounter {
    /// Counter state
    state: Mutex<Cell<TickState>>,
    /// Ticks per long interval
    long_interval: u32,
}

impl TickCounter {
    /// Create a stopped counter raising the long-interval flag every `long_interval` ticks.
    pub const fn new(long_interval: u32) -> Self {
        Self {
            state: Mutex::new(Cell::new(TickState {
                total: 0,
                epoch: 0,
                long_interval: false,
            })),
            long_interval,
        }
    }

    /// Advance by one tick. Only called from the tick interrupt.
    pub fn on_tick(&self) {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            state.total += 1;
            state.epoch = state.epoch.saturating_add(1);
            if state.epoch >= self.long_interval {
                state.long_interval = true;
            }
            cell.set(state);
        });
    }

    /// Current tick count.
    pub fn now(&self) -> Ticks {
        critical_section::with(|cs| self.state.borrow(cs).get().total)
    }

    /// Consume the long-interval flag, starting a new epoch if it was set.
    pub fn take_long_interval(&self) -> bool {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            let elapsed = state.long_interval;
            if elapsed {
                state.epoch = 0;
                state.long_interval = false;
                cell.set(state);
            }
            elapsed
        })
    }
}

/// Software timer that opens once every `period` ticks.
///
/// A gate polled late opens once and schedules its next opening from the late tick; missed
/// periods are not replayed.
#[derive(Debug, Copy, Clone)]
pub struct TickGate {
    /// Ticks between openings
    period: u32,
    /// Tick at which the gate next opens
    next: Ticks,
}

impl TickGate {
    /// Create a gate whose first opening is `period` ticks after reset.
    pub const fn new(period: u32) -> Self {
        Self {
            period,
            next: period as Ticks,
        }
    }

    /// Returns `true`, and re-arms the gate, if it is open at `now`.
    pub fn poll(&mut self, now: Ticks) -> bool {
        if now >= self.next {
            self.next = now + self.period as Ticks;
            true
        } else {
            false
        }
    }
}

/// Outcome of one gated state-machine step.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Step<S> {
    /// State committed by the step
    pub state: S,
    /// Hardware writes that completed
    pub writes: u8,
    /// Last write failure, if any write failed
    pub failure: Option<Error>,
}

impl<S> Step<S> {
    /// Step which issued no hardware writes
    pub(crate) fn quiet(state: S) -> Self {
        Self {
            state,
            writes: 0,
            failure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_raises_long_interval_once_per_epoch() {
        let ticks = TickCounter::new(5);
        for _ in 0..4 {
            ticks.on_tick();
        }
        assert!(!ticks.take_long_interval());
        ticks.on_tick();
        assert!(ticks.take_long_interval());
        assert!(!ticks.take_long_interval());
        assert_eq!(ticks.now(), 5);

        for _ in 0..5 {
            ticks.on_tick();
        }
        assert!(ticks.take_long_interval());
        assert_eq!(ticks.now(), 10);
    }

    #[test]
    fn gate_opens_every_period() {
        let mut gate = TickGate::new(50);
        let opened: u32 = (0..=200).map(|now| gate.poll(now) as u32).sum();
        assert_eq!(opened, 4);
    }

    #[test]
    fn late_gate_does_not_burst() {
        let mut gate = TickGate::new(10);
        assert!(gate.poll(35));
        assert!(!gate.poll(36));
        assert!(!gate.poll(44));
        assert!(gate.poll(45));
    }
}
