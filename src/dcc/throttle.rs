//! Adaptive sleep that caps aggregate download throughput.
//!
//! Once per tick the summed average speed of all active transfers is compared
//! with the ceiling and the sleep grows or shrinks proportionally. A ceiling
//! of 0 disables throttling.

use std::time::Duration;

/// Microseconds added or removed per unit of speed ratio.
pub const ADJUSTMENT_FACTOR: u64 = 5;

#[derive(Debug, Clone, Default)]
pub struct ThrottleState {
    max_speed: u64,
    sleep_micros: u64,
}

impl ThrottleState {
    pub fn new(max_speed: u64) -> Self {
        Self {
            max_speed,
            sleep_micros: 0,
        }
    }

    pub fn max_speed(&self) -> u64 {
        self.max_speed
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_micros(self.sleep_micros)
    }

    /// Feed the current aggregate speed (bytes per tick) and get the new sleep.
    pub fn adjust(&mut self, current_speed: u64) -> Duration {
        if self.max_speed == 0 {
            self.sleep_micros = 0;
        } else if current_speed > self.max_speed {
            self.sleep_micros += current_speed / self.max_speed * ADJUSTMENT_FACTOR;
        } else {
            let ratio = if current_speed != 0 {
                self.max_speed / current_speed
            } else {
                1
            };
            self.sleep_micros = self
                .sleep_micros
                .saturating_sub(ratio * ADJUSTMENT_FACTOR);
        }
        self.sleep()
    }
}
