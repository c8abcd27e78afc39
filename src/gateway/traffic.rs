//! Traffic accounting.
//!
//! Agents report raw cumulative rx/tx counters which only grow, except when
//! the remote host reboots. Accounting turns them into monthly totals:
//!
//! - the first sample after a (re)configuration only syncs the raw counter
//! - a decrease is taken as a reboot, and the whole current value is new
//!   traffic
//! - totals reset once on the configured day of the month
//!
//! Everything here is a pure function over the persisted state so the ingest
//! path decides when to write.

use chrono::{Datelike, NaiveDate};

use super::error::GatewayError;
use super::types::{MetricPulse, MonitorSettingsUpdate, MonitoredHost, TrafficAccountingState};

/// Interface selection meaning "use the agent's totals".
const AUTO_INTERFACES: &str = "auto";

/// A pair of rx/tx byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub rx: u64,
    pub tx: u64,
}

/// Pick the counters that count as "current" for a host.
///
/// With an explicit selection the matching interfaces are summed. When none
/// of the configured names is present in the pulse the totals are used, so a
/// stale selection does not report zero traffic.
pub fn select_counters(pulse: &MetricPulse, interfaces: Option<&str>) -> Counters {
    let totals = Counters {
        rx: pulse.net_rx,
        tx: pulse.net_tx,
    };

    let selection = match interfaces.map(str::trim) {
        None | Some("") => return totals,
        Some(s) if s.eq_ignore_ascii_case(AUTO_INTERFACES) => return totals,
        Some(s) => s,
    };

    let mut sum = Counters::default();
    let mut found_any = false;
    for target in selection.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some(iface) = pulse.interfaces.iter().find(|i| i.name == target) {
            sum.rx = sum.rx.saturating_add(iface.rx);
            sum.tx = sum.tx.saturating_add(iface.tx);
            found_any = true;
        }
    }

    if found_any { sum } else { totals }
}

/// Bytes attributed to the interval between two raw samples.
pub fn counter_delta(prev_raw: u64, current: u64) -> u64 {
    if prev_raw == 0 {
        0
    } else if current >= prev_raw {
        current - prev_raw
    } else {
        // Counter went backwards: the remote host rebooted
        current
    }
}

/// Zero the monthly totals if `today` is the reset day and no reset happened
/// today yet. Returns whether a reset happened.
pub fn apply_reset_day(
    state: &mut TrafficAccountingState,
    reset_day: u32,
    today: NaiveDate,
) -> bool {
    if today.day() != reset_day || state.last_reset_date == Some(today) {
        return false;
    }
    state.monthly_rx = 0;
    state.monthly_tx = 0;
    state.last_reset_date = Some(today);
    true
}

/// Add the delta since the last sample to the monthly totals and sync the raw
/// counters. Returns the delta.
pub fn accumulate(state: &mut TrafficAccountingState, current: Counters) -> Counters {
    let delta = Counters {
        rx: counter_delta(state.last_raw_rx, current.rx),
        tx: counter_delta(state.last_raw_tx, current.tx),
    };
    state.monthly_rx = state.monthly_rx.saturating_add(delta.rx);
    state.monthly_tx = state.monthly_tx.saturating_add(delta.tx);
    state.last_raw_rx = current.rx;
    state.last_raw_tx = current.tx;
    delta
}

/// Check a settings update before applying it.
pub fn validate_settings(update: &MonitorSettingsUpdate) -> Result<(), GatewayError> {
    if let Some(day) = update.reset_day {
        if !(1..=31).contains(&day) {
            return Err(GatewayError::Config(format!(
                "reset_day must be between 1 and 31, got {}",
                day
            )));
        }
    }
    Ok(())
}

/// Apply a validated settings update to a host record.
///
/// Changing the interface selection resets the raw counters so the next
/// sample is only synced. Monthly totals are kept.
pub fn apply_settings(host: &mut MonitoredHost, update: &MonitorSettingsUpdate) {
    if let Some(interfaces) = &update.interfaces {
        let normalized = Some(interfaces.trim().to_string()).filter(|s| !s.is_empty());
        if normalized != host.traffic.interfaces {
            host.accounting.last_raw_rx = 0;
            host.accounting.last_raw_tx = 0;
        }
        host.traffic.interfaces = normalized;
    }
    if let Some(day) = update.reset_day {
        host.traffic.reset_day = day;
    }
    if let Some(limit) = update.limit {
        host.traffic.limit = limit;
    }
    if let Some(adjustment) = update.used_adjustment {
        host.traffic.used_adjustment = adjustment;
    }
    if let Some(mode) = update.counter_mode {
        host.traffic.counter_mode = mode;
    }
    if let Some(minutes) = update.offline_threshold_minutes {
        host.offline_threshold_minutes = Some(minutes);
    }
    if let Some(notify) = update.notify_offline {
        host.notify_offline = notify;
    }
    if let Some(channels) = &update.notify_channels {
        host.notify_channels = channels.clone();
    }
}
