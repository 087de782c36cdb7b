//! Player configuration.

use std::time::Duration;

use crate::backend::HwAccelConfig;
use crate::player::PlayerError;

/// Default number of decoded frames buffered ahead of presentation.
pub const DEFAULT_FRAME_CAP: usize = 100;

/// Tuning knobs for a [`Player`](crate::player::Player).
///
/// ```ignore
/// let config = PlayerConfig::default()
///     .with_frame_cap(60)
///     .with_hw_accel(HwAccelConfig::software_only());
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    /// Capacity of the frame store
    pub frame_cap: usize,
    /// Store depth below which transfers run on the decode thread
    pub transfer_lookahead: usize,
    /// Maximum simultaneous device to host transfers
    pub max_concurrent_transfers: usize,
    /// Decode reads a slow-path seek may spend looking for its target
    pub seek_max_attempts: usize,
    /// Decode reads spent acquiring the preview frame on open
    pub initial_frame_attempts: usize,
    /// Stretch applied to the delay while video runs ahead of audio
    pub ahead_factor: f64,
    /// How much decoded audio may be queued in the sink
    pub audio_buffer_ahead: Duration,
    /// Output latency requested from the audio sink
    pub audio_latency: Duration,
    /// Decode and play the audio stream when the media has one
    pub enable_audio: bool,
    pub hw_accel: HwAccelConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            frame_cap: DEFAULT_FRAME_CAP,
            transfer_lookahead: 8,
            max_concurrent_transfers: 4,
            seek_max_attempts: 1000,
            initial_frame_attempts: 30,
            ahead_factor: 1.3,
            audio_buffer_ahead: Duration::from_secs(10),
            audio_latency: Duration::from_millis(200),
            enable_audio: true,
            hw_accel: HwAccelConfig::default(),
        }
    }
}

impl PlayerConfig {
    pub fn with_frame_cap(mut self, frame_cap: usize) -> Self {
        self.frame_cap = frame_cap;
        self
    }

    pub fn with_transfer_lookahead(mut self, lookahead: usize) -> Self {
        self.transfer_lookahead = lookahead;
        self
    }

    pub fn with_max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max;
        self
    }

    pub fn with_seek_max_attempts(mut self, attempts: usize) -> Self {
        self.seek_max_attempts = attempts;
        self
    }

    pub fn with_initial_frame_attempts(mut self, attempts: usize) -> Self {
        self.initial_frame_attempts = attempts;
        self
    }

    pub fn with_ahead_factor(mut self, factor: f64) -> Self {
        self.ahead_factor = factor;
        self
    }

    pub fn with_audio_buffer_ahead(mut self, ahead: Duration) -> Self {
        self.audio_buffer_ahead = ahead;
        self
    }

    pub fn with_audio(mut self, enabled: bool) -> Self {
        self.enable_audio = enabled;
        self
    }

    pub fn with_hw_accel(mut self, hw_accel: HwAccelConfig) -> Self {
        self.hw_accel = hw_accel;
        self
    }

    /// Store depth that triggers buffering: `frame_cap / 4`.
    pub fn low_watermark(&self) -> usize {
        self.frame_cap / 4
    }

    /// Store depth that ends buffering and seek re-priming:
    /// `ceil(frame_cap / 1.2)`.
    pub fn fill_threshold(&self) -> usize {
        (self.frame_cap * 5).div_ceil(6)
    }

    pub fn validate(&self) -> Result<(), PlayerError> {
        let invalid = |msg: &str| Err(PlayerError::InvalidConfig(msg.to_string()));
        if self.frame_cap < 4 {
            return invalid("frame_cap must be at least 4");
        }
        if self.max_concurrent_transfers == 0 {
            return invalid("max_concurrent_transfers must be at least 1");
        }
        if self.seek_max_attempts == 0 {
            return invalid("seek_max_attempts must be at least 1");
        }
        if self.initial_frame_attempts == 0 {
            return invalid("initial_frame_attempts must be at least 1");
        }
        if !self.ahead_factor.is_finite() || self.ahead_factor <= 0.0 {
            return invalid("ahead_factor must be a positive number");
        }
        if self.audio_buffer_ahead.is_zero() {
            return invalid("audio_buffer_ahead must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlayerConfig::default();
        assert_eq!(config.frame_cap, 100);
        assert_eq!(config.low_watermark(), 25);
        assert_eq!(config.fill_threshold(), 84);
        assert_eq!(config.seek_max_attempts, 1000);
        assert_eq!(config.initial_frame_attempts, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fill_threshold_rounds_up() {
        assert_eq!(PlayerConfig::default().with_frame_cap(6).fill_threshold(), 5);
        assert_eq!(PlayerConfig::default().with_frame_cap(12).fill_threshold(), 10);
        assert_eq!(PlayerConfig::default().with_frame_cap(13).fill_threshold(), 11);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            PlayerConfig::default().with_frame_cap(2),
            PlayerConfig::default().with_max_concurrent_transfers(0),
            PlayerConfig::default().with_seek_max_attempts(0),
            PlayerConfig::default().with_ahead_factor(f64::NAN),
            PlayerConfig::default().with_audio_buffer_ahead(Duration::ZERO),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(PlayerError::InvalidConfig(_))),
                "{config:?}"
            );
        }
    }
}
