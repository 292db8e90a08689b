//! Office-hours gate for off-peak jobs.
//!
//! Libraries run their host systems hardest while staff and patrons are
//! active. Jobs marked off-peak are held back during the configured office
//! hours and also yield mid-run when the window opens underneath them.

use chrono::Timelike;
use tracing::debug;

use crate::config::OfficeHoursConfig;

/// Decides whether off-peak work may run right now.
#[derive(Debug, Clone)]
pub struct HoursGate {
    /// Office hours as `[start, end)` local hours, `None` disables the gate.
    window: Option<(u8, u8)>,
}

impl HoursGate {
    #[must_use]
    pub fn new(window: Option<&OfficeHoursConfig>) -> Self {
        Self {
            window: window.map(|w| (w.start_hour, w.end_hour)),
        }
    }

    /// Gate that never holds anything back.
    #[must_use]
    pub fn disabled() -> Self {
        Self { window: None }
    }

    /// True when off-peak work may run at this moment, local time.
    #[must_use]
    pub fn off_peak_now(&self) -> bool {
        let off_peak = self.off_peak_at(chrono::Local::now().hour());
        if !off_peak {
            debug!("inside office hours");
        }
        off_peak
    }

    /// True when `hour` falls outside the office-hours window. A window
    /// whose start is past its end wraps around midnight.
    #[must_use]
    pub fn off_peak_at(&self, hour: u32) -> bool {
        let Some((start, end)) = self.window else {
            return true;
        };
        let (start, end) = (u32::from(start), u32::from(end));

        let inside = if start <= end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        };
        !inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(start_hour: u8, end_hour: u8) -> HoursGate {
        HoursGate::new(Some(&OfficeHoursConfig {
            start_hour,
            end_hour,
        }))
    }

    #[test]
    fn test_disabled_gate_is_always_off_peak() {
        let gate = HoursGate::disabled();
        assert!((0..24).all(|h| gate.off_peak_at(h)));
    }

    #[test]
    fn test_daytime_window_blocks_its_hours_only() {
        let gate = gate(9, 17);

        assert!(gate.off_peak_at(8));
        assert!(!gate.off_peak_at(9));
        assert!(!gate.off_peak_at(12));
        assert!(!gate.off_peak_at(16));
        assert!(gate.off_peak_at(17));
        assert!(gate.off_peak_at(23));
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let gate = gate(22, 6);

        assert!(!gate.off_peak_at(22));
        assert!(!gate.off_peak_at(23));
        assert!(!gate.off_peak_at(0));
        assert!(!gate.off_peak_at(5));
        assert!(gate.off_peak_at(6));
        assert!(gate.off_peak_at(12));
        assert!(gate.off_peak_at(21));
    }

    #[test]
    fn test_full_day_window_blocks_everything() {
        let gate = gate(0, 24);
        assert!((0..24).all(|h| !gate.off_peak_at(h)));
    }
}
