//! Round-trip-time estimation and the unreliable packet throttle.
//!
//! The throttle is a ratio on a 0..=[`PEER_PACKET_THROTTLE_SCALE`] scale. Unreliable
//! commands are dropped in proportion to how far the throttle sits below full scale,
//! and every RTT sample nudges it up or down depending on how the sample compares with
//! the round-trip time measured over the previous throttle epoch.

use tether_core::constants::{
    PEER_DEFAULT_PACKET_THROTTLE, PEER_DEFAULT_ROUND_TRIP_TIME, PEER_PACKET_THROTTLE_ACCELERATION,
    PEER_PACKET_THROTTLE_COUNTER, PEER_PACKET_THROTTLE_DECELERATION, PEER_PACKET_THROTTLE_INTERVAL,
    PEER_PACKET_THROTTLE_SCALE,
};

/// Result of feeding one RTT sample into the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAdjustment {
    /// The throttle did not move, or was reset to its limit.
    Unchanged,
    /// The sample was no worse than the last epoch; the throttle accelerated.
    Improved,
    /// The sample was well above the last epoch; the throttle decelerated.
    Degraded,
}

/// Congestion state of one peer.
#[derive(Debug, Clone)]
pub struct Congestion {
    /// Current throttle ratio
    pub packet_throttle: u32,
    /// Upper bound the throttle may reach, set by the bandwidth throttle
    pub packet_throttle_limit: u32,
    /// Rolling counter compared against the throttle to drop unreliable commands
    pub packet_throttle_counter: u32,
    /// Service time at which the current throttle epoch started
    pub packet_throttle_epoch: u32,
    /// Step added on an improved sample
    pub packet_throttle_acceleration: u32,
    /// Step removed on a degraded sample
    pub packet_throttle_deceleration: u32,
    /// Length of a throttle epoch in milliseconds
    pub packet_throttle_interval: u32,
    /// Lowest RTT seen during the previous epoch
    pub last_round_trip_time: u32,
    /// Lowest RTT seen during the current epoch
    pub lowest_round_trip_time: u32,
    /// Highest RTT variance seen during the previous epoch
    pub last_round_trip_time_variance: u32,
    /// Highest RTT variance seen during the current epoch
    pub highest_round_trip_time_variance: u32,
    /// Smoothed RTT estimate in milliseconds
    pub round_trip_time: u32,
    /// Smoothed mean deviation of the RTT
    pub round_trip_time_variance: u32,
}

impl Default for Congestion {
    fn default() -> Self {
        Congestion {
            packet_throttle: PEER_DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PEER_PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: PEER_PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: PEER_PACKET_THROTTLE_DECELERATION,
            packet_throttle_interval: PEER_PACKET_THROTTLE_INTERVAL,
            last_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            lowest_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
        }
    }
}

impl Congestion {
    /// Restores protocol defaults.
    pub fn reset(&mut self) {
        *self = Congestion::default();
    }

    /// Adjusts the throttle for one RTT sample.
    pub fn throttle(&mut self, rtt: u32) -> ThrottleAdjustment {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt <= self.last_round_trip_time {
            self.packet_throttle = self
                .packet_throttle
                .saturating_add(self.packet_throttle_acceleration)
                .min(self.packet_throttle_limit);
            return ThrottleAdjustment::Improved;
        } else if rtt
            > self
                .last_round_trip_time
                .saturating_add(self.last_round_trip_time_variance.saturating_mul(2))
        {
            self.packet_throttle =
                self.packet_throttle.saturating_sub(self.packet_throttle_deceleration);
            return ThrottleAdjustment::Degraded;
        }
        ThrottleAdjustment::Unchanged
    }

    /// Folds an RTT sample into the smoothed estimate.
    ///
    /// `first_sample` seeds the estimate directly instead of smoothing toward it.
    pub fn update_round_trip_time(&mut self, rtt: u32, first_sample: bool) {
        if first_sample {
            self.round_trip_time = rtt;
            self.round_trip_time_variance = rtt.div_ceil(2);
        } else {
            self.throttle(rtt);

            self.round_trip_time_variance -= self.round_trip_time_variance / 4;
            if rtt >= self.round_trip_time {
                let diff = rtt - self.round_trip_time;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time += diff / 8;
            } else {
                let diff = self.round_trip_time - rtt;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time -= diff / 8;
            }
        }

        self.lowest_round_trip_time = self.lowest_round_trip_time.min(self.round_trip_time);
        self.highest_round_trip_time_variance =
            self.highest_round_trip_time_variance.max(self.round_trip_time_variance);
    }

    /// Starts a new throttle epoch once the interval has elapsed.
    pub fn roll_epoch(&mut self, service_time: u32) {
        if self.packet_throttle_epoch == 0
            || service_time.wrapping_sub(self.packet_throttle_epoch) >= self.packet_throttle_interval
        {
            self.last_round_trip_time = self.lowest_round_trip_time;
            self.last_round_trip_time_variance = self.highest_round_trip_time_variance.max(1);
            self.lowest_round_trip_time = self.round_trip_time;
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
            self.packet_throttle_epoch = service_time;
        }
    }

    /// Applies throttle parameters requested by the remote side.
    pub fn configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.packet_throttle_interval = interval;
        self.packet_throttle_acceleration = acceleration;
        self.packet_throttle_deceleration = deceleration;
    }

    /// Sets the throttle ceiling, pulling the throttle down to it when above.
    pub fn set_limit(&mut self, limit: u32) {
        self.packet_throttle_limit = limit.min(PEER_PACKET_THROTTLE_SCALE);
        self.packet_throttle = self.packet_throttle.min(self.packet_throttle_limit);
    }

    /// Advances the drop counter for one unreliable command and reports whether to drop it.
    pub fn should_drop_unreliable(&mut self) -> bool {
        self.packet_throttle_counter =
            (self.packet_throttle_counter + PEER_PACKET_THROTTLE_COUNTER) % PEER_PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter > self.packet_throttle
    }

    /// Bytes of reliable data allowed in flight for a window of `window_size` bytes.
    pub fn throttled_window(&self, window_size: u32, mtu: u32) -> u32 {
        let window = (self.packet_throttle as u64 * window_size as u64
            / PEER_PACKET_THROTTLE_SCALE as u64) as u32;
        window.max(mtu)
    }

    /// Initial retransmission timeout for a reliable command.
    pub fn round_trip_timeout(&self) -> u32 {
        self.round_trip_time.saturating_add(self.round_trip_time_variance.saturating_mul(4))
    }
}
