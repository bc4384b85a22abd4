use tidewire_core::{
    config::Config,
    constants::{PACKET_LOSS_SCALE, PACKET_THROTTLE_COUNTER},
    time::time_difference,
};

/// Round-trip time estimation, packet throttle and packet loss tracking for one peer.
///
/// All times are milliseconds. The throttle is a fixed-point fraction of
/// `throttle_scale`: at `throttle_scale` every unreliable packet goes out, at
/// 0 all of them are dropped. It moves once per RTT sample, comparing the
/// sample against the best RTT seen in the previous throttle epoch.
#[derive(Debug, Clone)]
pub struct CongestionControl {
    /// Smoothed round-trip time
    round_trip_time: u32,
    /// Smoothed mean deviation of the round-trip time
    round_trip_time_variance: u32,
    /// Lowest RTT of the previous throttle epoch
    last_round_trip_time: u32,
    /// Highest variance of the previous throttle epoch
    last_round_trip_time_variance: u32,
    lowest_round_trip_time: u32,
    highest_round_trip_time_variance: u32,

    packet_throttle: u32,
    packet_throttle_limit: u32,
    packet_throttle_counter: u32,
    packet_throttle_epoch: u32,
    throttle_scale: u32,
    throttle_acceleration: u32,
    throttle_deceleration: u32,
    throttle_interval: u32,

    packet_loss: u32,
    packet_loss_variance: u32,
    packet_loss_epoch: u32,
    packet_loss_interval: u32,
    packets_sent: u32,
    packets_lost: u32,
}

impl CongestionControl {
    /// Creates congestion state seeded from the configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            round_trip_time: config.default_round_trip_time,
            round_trip_time_variance: 0,
            last_round_trip_time: config.default_round_trip_time,
            last_round_trip_time_variance: 0,
            lowest_round_trip_time: config.default_round_trip_time,
            highest_round_trip_time_variance: 0,
            packet_throttle: config.throttle_scale,
            packet_throttle_limit: config.throttle_scale,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            throttle_scale: config.throttle_scale,
            throttle_acceleration: config.throttle_acceleration,
            throttle_deceleration: config.throttle_deceleration,
            throttle_interval: config.throttle_interval,
            packet_loss: 0,
            packet_loss_variance: 0,
            packet_loss_epoch: 0,
            packet_loss_interval: config.packet_loss_interval,
            packets_sent: 0,
            packets_lost: 0,
        }
    }

    /// Replaces the throttle parameters.
    pub fn configure_throttle(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.throttle_interval = interval;
        self.throttle_acceleration = acceleration;
        self.throttle_deceleration = deceleration;
    }

    /// Moves the throttle according to a fresh RTT sample.
    ///
    /// Returns 1 when the throttle accelerated, -1 when it decelerated and 0
    /// otherwise.
    pub fn throttle(&mut self, rtt: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt <= self.last_round_trip_time {
            self.packet_throttle = self
                .packet_throttle
                .saturating_add(self.throttle_acceleration)
                .min(self.packet_throttle_limit);
            return 1;
        } else if rtt > self.last_round_trip_time + 2 * self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle.saturating_sub(self.throttle_deceleration);
            return -1;
        }
        0
    }

    /// Feeds one RTT sample taken at `now`.
    pub fn record_round_trip(&mut self, sample: u32, now: u32) {
        self.throttle(sample);

        self.round_trip_time_variance -= self.round_trip_time_variance / 4;
        if sample >= self.round_trip_time {
            self.round_trip_time += (sample - self.round_trip_time) / 8;
            self.round_trip_time_variance += (sample - self.round_trip_time) / 4;
        } else {
            self.round_trip_time -= (self.round_trip_time - sample) / 8;
            self.round_trip_time_variance += (self.round_trip_time - sample) / 4;
        }

        self.lowest_round_trip_time = self.lowest_round_trip_time.min(self.round_trip_time);
        self.highest_round_trip_time_variance =
            self.highest_round_trip_time_variance.max(self.round_trip_time_variance);

        if self.packet_throttle_epoch == 0
            || time_difference(now, self.packet_throttle_epoch) >= self.throttle_interval
        {
            self.last_round_trip_time = self.lowest_round_trip_time;
            self.last_round_trip_time_variance = self.highest_round_trip_time_variance;
            self.lowest_round_trip_time = self.round_trip_time;
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
            self.packet_throttle_epoch = now;
        }
    }

    /// Returns the current smoothed RTT.
    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    /// Returns the RTT variance.
    pub fn round_trip_time_variance(&self) -> u32 {
        self.round_trip_time_variance
    }

    /// Returns the retransmission timeout derived from the RTT: `rtt + 4 * variance`.
    pub fn retransmit_timeout(&self) -> u32 {
        self.round_trip_time.saturating_add(self.round_trip_time_variance.saturating_mul(4))
    }

    /// Returns the current throttle value.
    pub fn packet_throttle(&self) -> u32 {
        self.packet_throttle
    }

    /// Returns the throttle limit.
    pub fn packet_throttle_limit(&self) -> u32 {
        self.packet_throttle_limit
    }

    /// Returns the throttle scale.
    pub fn throttle_scale(&self) -> u32 {
        self.throttle_scale
    }

    /// Returns (interval, acceleration, deceleration).
    pub fn throttle_parameters(&self) -> (u32, u32, u32) {
        (self.throttle_interval, self.throttle_acceleration, self.throttle_deceleration)
    }

    /// Advances the throttle counter for one unreliable packet and returns
    /// true if the packet must be dropped.
    pub fn should_drop_unreliable(&mut self) -> bool {
        self.packet_throttle_counter =
            (self.packet_throttle_counter + PACKET_THROTTLE_COUNTER) % self.throttle_scale.max(1);
        self.packet_throttle_counter > self.packet_throttle
    }

    /// Scales a window by the current throttle.
    pub fn throttled_window(&self, window_size: u32) -> u32 {
        let scaled = u64::from(window_size) * u64::from(self.packet_throttle)
            / u64::from(self.throttle_scale.max(1));
        scaled as u32
    }

    /// Records a reliable command sent.
    pub fn record_sent(&mut self) {
        self.packets_sent += 1;
    }

    /// Records a reliable command that timed out.
    pub fn record_loss(&mut self) {
        self.packets_lost += 1;
    }

    /// Folds the loss ratio of the elapsed interval into the smoothed loss.
    ///
    /// Returns true if a new epoch started.
    pub fn update_packet_loss(&mut self, now: u32) -> bool {
        if self.packet_loss_epoch == 0 {
            self.packet_loss_epoch = now;
            return false;
        }
        if time_difference(now, self.packet_loss_epoch) < self.packet_loss_interval
            || self.packets_sent == 0
        {
            return false;
        }

        let loss = (u64::from(self.packets_lost) * u64::from(PACKET_LOSS_SCALE)
            / u64::from(self.packets_sent)) as u32;

        self.packet_loss_variance -= self.packet_loss_variance / 4;
        if loss >= self.packet_loss {
            self.packet_loss += (loss - self.packet_loss) / 8;
            self.packet_loss_variance += (loss - self.packet_loss) / 4;
        } else {
            self.packet_loss -= (self.packet_loss - loss) / 8;
            self.packet_loss_variance += (self.packet_loss - loss) / 4;
        }

        tracing::trace!(
            loss = self.packet_loss,
            variance = self.packet_loss_variance,
            sent = self.packets_sent,
            lost = self.packets_lost,
            "packet loss epoch"
        );

        self.packet_loss_epoch = now;
        self.packets_sent = 0;
        self.packets_lost = 0;
        true
    }

    /// Smoothed packet loss as a fraction of 65536.
    pub fn packet_loss(&self) -> u32 {
        self.packet_loss
    }

    /// Mean deviation of the packet loss.
    pub fn packet_loss_variance(&self) -> u32 {
        self.packet_loss_variance
    }

    /// Returns the packet loss rate (0.0 to 1.0).
    pub fn loss_rate(&self) -> f32 {
        self.packet_loss as f32 / PACKET_LOSS_SCALE as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> CongestionControl {
        CongestionControl::new(&Config::default())
    }

    #[test]
    fn test_rtt_converges_toward_samples() {
        let mut cc = control();
        assert_eq!(cc.round_trip_time(), 500);

        for i in 0..64 {
            cc.record_round_trip(100, 1 + i * 10);
        }
        assert!(cc.round_trip_time() < 130, "rtt = {}", cc.round_trip_time());
        assert!(cc.retransmit_timeout() >= cc.round_trip_time());
    }

    #[test]
    fn test_single_sample_update() {
        let mut cc = control();
        cc.record_round_trip(900, 1);
        // 500 + (900 - 500) / 8, variance 0 + (900 - 550) / 4
        assert_eq!(cc.round_trip_time(), 550);
        assert_eq!(cc.round_trip_time_variance(), 87);
        assert_eq!(cc.retransmit_timeout(), 550 + 4 * 87);
    }

    #[test]
    fn test_throttle_accelerates_and_clamps() {
        let mut cc = control();
        // Previous epoch: rtt 200, variance 10
        cc.last_round_trip_time = 200;
        cc.last_round_trip_time_variance = 10;
        cc.packet_throttle = 20;

        assert_eq!(cc.throttle(150), 1);
        assert_eq!(cc.packet_throttle(), 22);
        for _ in 0..20 {
            cc.throttle(150);
        }
        assert_eq!(cc.packet_throttle(), cc.packet_throttle_limit());
    }

    #[test]
    fn test_throttle_decelerates_to_zero() {
        let mut cc = control();
        cc.last_round_trip_time = 200;
        cc.last_round_trip_time_variance = 10;

        assert_eq!(cc.throttle(400), -1);
        assert_eq!(cc.packet_throttle(), 30);
        for _ in 0..40 {
            cc.throttle(400);
        }
        assert_eq!(cc.packet_throttle(), 0);
        // Within two variances of the previous epoch nothing moves
        assert_eq!(cc.throttle(215), 0);
    }

    #[test]
    fn test_unstable_epoch_resets_to_limit() {
        let mut cc = control();
        cc.last_round_trip_time = 10;
        cc.last_round_trip_time_variance = 20;
        cc.packet_throttle = 3;
        assert_eq!(cc.throttle(999), 0);
        assert_eq!(cc.packet_throttle(), 32);
    }

    #[test]
    fn test_drop_counter_respects_throttle() {
        let mut cc = control();
        // Full throttle: the counter never exceeds 32
        assert!((0..100).all(|_| !cc.should_drop_unreliable()));

        cc.packet_throttle = 0;
        let dropped = (0..32).filter(|_| cc.should_drop_unreliable()).count();
        assert!(dropped > 0 && dropped < 32);
    }

    #[test]
    fn test_throttled_window() {
        let mut cc = control();
        assert_eq!(cc.throttled_window(65536), 65536);
        cc.packet_throttle = 16;
        assert_eq!(cc.throttled_window(65536), 32768);
    }

    #[test]
    fn test_packet_loss_epoch() {
        let mut cc = control();
        assert!(!cc.update_packet_loss(1));
        for _ in 0..10 {
            cc.record_sent();
        }
        for _ in 0..5 {
            cc.record_loss();
        }
        assert!(!cc.update_packet_loss(5000));
        assert!(cc.update_packet_loss(10_001));
        // Half lost: 32768 / 8
        assert_eq!(cc.packet_loss(), 4096);
        assert!(cc.loss_rate() > 0.0);
        // Counters were reset
        assert!(!cc.update_packet_loss(20_002));
    }
}
