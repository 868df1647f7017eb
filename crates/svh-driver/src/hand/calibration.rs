//! Unit and safety conversions
//!
//! After homing every channel owns a [`ChannelCalibration`] that maps raw
//! encoder ticks onto an angle that is zero at the hard-stop side of the
//! soft limits and grows away from it, whatever the mechanical direction.

use serde::{Deserialize, Serialize};

use super::homing::DiagnosticState;
use super::settings::{CurrentSettings, Direction, HomeSettings};

/// Soft limits and tick scale of a homed channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    /// Lower soft limit [ticks]
    pub position_min: i32,
    /// Upper soft limit [ticks]
    pub position_max: i32,
    /// Park position [ticks]
    pub position_home: i32,
    /// Radians per tick, signed by direction
    pub ticks_to_rad: f64,
    /// Direction the channel was homed in
    pub direction: Direction,
}

impl ChannelCalibration {
    /// Derive limits from the position where the hard stop was detected
    pub fn from_hard_stop(hard_stop: i32, home: &HomeSettings) -> Self {
        let low = home.minimum_offset.min(home.maximum_offset);
        let high = home.minimum_offset.max(home.maximum_offset);
        Self {
            position_min: hard_stop.saturating_add(low),
            position_max: hard_stop.saturating_add(high),
            position_home: (hard_stop as i64 + home.home_offset())
                .clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            ticks_to_rad: home.ticks_to_rad(),
            direction: home.direction,
        }
    }

    /// Tick value that maps onto zero radians
    pub fn reference(&self) -> i32 {
        match self.direction {
            Direction::Positive => self.position_max,
            Direction::Negative => self.position_min,
        }
    }

    /// Convert ticks to radians without clamping
    pub fn ticks_to_rad(&self, ticks: i32) -> f64 {
        (ticks as f64 - self.reference() as f64) * self.ticks_to_rad
    }

    /// Convert radians to the nearest tick value
    pub fn rad_to_ticks(&self, rad: f64) -> i64 {
        (rad / self.ticks_to_rad).round() as i64 + self.reference() as i64
    }

    /// Whether `ticks` lies within the soft limits
    pub fn contains(&self, ticks: i64) -> bool {
        (self.position_min as i64..=self.position_max as i64).contains(&ticks)
    }

    /// Position reported to callers [rad]; never negative
    pub fn position_rad(&self, ticks: i32) -> f64 {
        self.ticks_to_rad(ticks).max(0.0)
    }
}

/// Check a proposed current limit against what homing observed.
///
/// Until every channel is enabled there are no diagnostics to compare
/// against and everything is accepted. Afterwards the limiter magnitude may
/// not exceed `max_current_percentage` of the largest current seen.
/// The ceiling comes from the observed current extrema
/// `max(current_max, |current_min|)`, not from position diagnostics.
pub fn current_settings_are_safe(
    all_enabled: bool,
    proposed: &CurrentSettings,
    max_current_percentage: f64,
    diagnostics: &DiagnosticState,
) -> bool {
    if !all_enabled {
        return true;
    }
    let observed = (diagnostics.current_max as f64).max((diagnostics.current_min as f64).abs());
    proposed.limit_magnitude() <= max_current_percentage * observed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hand::Channel;

    #[test]
    fn test_limits_from_hard_stop() {
        let home = HomeSettings::default_for(Channel::ThumbFlexion);
        let cal = ChannelCalibration::from_hard_stop(30_000, &home);
        assert_eq!(cal.position_min, -145_000);
        assert_eq!(cal.position_max, 25_000);
        assert_eq!(cal.position_home, 15_000);
        assert_eq!(cal.reference(), 25_000);

        let home = HomeSettings::default_for(Channel::MiddleFingerProximal);
        let cal = ChannelCalibration::from_hard_stop(-30_000, &home);
        assert_eq!(cal.position_min, -28_000);
        assert_eq!(cal.position_max, 12_000);
        assert_eq!(cal.position_home, -22_000);
        assert_eq!(cal.reference(), -28_000);
    }

    #[test]
    fn test_angles_grow_away_from_stop() {
        for (channel, stop) in [(Channel::Pinky, 30_000), (Channel::IndexFingerProximal, -30_000)] {
            let cal = ChannelCalibration::from_hard_stop(stop, &HomeSettings::default_for(channel));
            assert_eq!(cal.ticks_to_rad(cal.reference()), 0.0);
            assert!(cal.ticks_to_rad(cal.position_home) > 0.0, "{channel}");
        }
    }

    #[test]
    fn test_rad_to_ticks_inverts() {
        let cal = ChannelCalibration::from_hard_stop(
            30_000,
            &HomeSettings::default_for(Channel::ThumbFlexion),
        );
        for ticks in [cal.position_min, cal.position_home, cal.position_max, 0] {
            assert_eq!(cal.rad_to_ticks(cal.ticks_to_rad(ticks)), ticks as i64);
        }
        let ticks = cal.rad_to_ticks(0.1);
        assert!((cal.ticks_to_rad(ticks as i32) - 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_negative_angles_clamp_to_zero() {
        let cal = ChannelCalibration::from_hard_stop(
            30_000,
            &HomeSettings::default_for(Channel::RingFinger),
        );
        assert!(cal.ticks_to_rad(29_000) < 0.0);
        assert_eq!(cal.position_rad(29_000), 0.0);
        assert!(!cal.contains(29_000));
        assert!(cal.contains(cal.position_max as i64));
    }

    #[test]
    fn test_current_safety_ceiling() {
        let proposed = CurrentSettings::default_for(Channel::RingFinger);
        let diagnostics = DiagnosticState {
            current_min: -400,
            current_max: 320,
            ..DiagnosticState::default()
        };
        assert!(current_settings_are_safe(false, &proposed, 0.1, &diagnostics));
        assert!(current_settings_are_safe(true, &proposed, 0.9, &diagnostics));
        assert!(!current_settings_are_safe(true, &proposed, 0.7, &diagnostics));
        assert!(!current_settings_are_safe(true, &proposed, 0.9, &DiagnosticState::default()));
    }
}
