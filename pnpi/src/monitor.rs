//! System inventory snapshotting and the monitor's Idle/Active ticker
//! state machine, grounded on `monitor.go`'s `gatherInterfaces`/
//! `gatherServices`/`produceReport`/`MonitorSystemStates`.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use log::error;
use pnpi_core::{
    produce_report, NetworkInterface, OutboundMessage, Service, SystemReport, SystemSnapshot,
    KNOWN_SERVICES,
};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::helper::Helper;

const REGULAR_TICK: Duration = Duration::from_secs(3);
const BURST_TICK: Duration = Duration::from_millis(1200);
const BURST_COUNT: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorControl {
    Start,
    Stop,
    Burst,
}

fn gather_interfaces(helper: &Helper) -> HashMap<String, NetworkInterface> {
    let default_wlan = helper.default_wlan_interface();

    let addrs = match if_addrs::get_if_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            error!("failed to enumerate network interfaces: {e}");
            return HashMap::new();
        }
    };

    let mut by_name: HashMap<String, BTreeSet<String>> = HashMap::new();
    for addr in addrs {
        if addr.name == "lo" {
            continue;
        }
        by_name
            .entry(addr.name)
            .or_default()
            .insert(addr.ip().to_string());
    }

    by_name
        .into_iter()
        .map(|(name, ips)| {
            let is_default_wifi = name == default_wlan;
            let ssid = if name.starts_with("wlan") && !ips.is_empty() {
                helper.report_ssid(&name)
            } else {
                String::new()
            };
            let iface = NetworkInterface {
                name: name.clone(),
                ips,
                ssid,
                is_default_wifi,
            };
            (name, iface)
        })
        .collect()
}

fn gather_services(helper: &Helper) -> HashMap<String, Service> {
    KNOWN_SERVICES
        .iter()
        .map(|&name| {
            (
                name.to_string(),
                Service {
                    name,
                    running: helper.service_is_running(name),
                },
            )
        })
        .collect()
}

pub fn inspect_system(helper: &Helper) -> SystemSnapshot {
    SystemSnapshot {
        interfaces: gather_interfaces(helper),
        services: gather_services(helper),
        wifi_country: helper.wifi_country_code(),
    }
}

fn full_report(snapshot: &SystemSnapshot) -> SystemReport {
    let mut interfaces: Vec<_> = snapshot.interfaces.values().cloned().collect();
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    let mut services: Vec<_> = snapshot.services.values().copied().collect();
    services.sort_by(|a, b| a.name.cmp(b.name));
    SystemReport::Full {
        interfaces,
        services,
        wifi_country: snapshot.wifi_country.clone(),
    }
}

/// Drive the Idle/Active + regular/burst ticker state machine. The first
/// control code received MUST be `Start`; anything else (or channel
/// closure before any code arrives) is treated as a worker panic by the
/// caller, matching the original's "first control code never arrives" /
/// "invalid first control code" fatal conditions.
///
/// Every active tick sends exactly one message, even when nothing changed:
/// a no-diff tick still produces `OutboundMessage::Empty` rather than being
/// silently dropped, so the session's writer stays "live" for the
/// pending-counter bookkeeping the same way an actual report would.
pub async fn run(
    helper: Helper,
    mut control_rx: mpsc::Receiver<MonitorControl>,
    reports_tx: mpsc::Sender<OutboundMessage>,
) {
    match control_rx.recv().await {
        Some(MonitorControl::Start) => {}
        other => panic!("monitor: first control code must be Start, got {other:?}"),
    }

    let mut active = true;
    let mut burst_remaining: u8 = 0;
    let mut previous = inspect_system(&helper);
    if reports_tx.send(full_report(&previous).into()).await.is_err() {
        return;
    }

    let mut regular_ticker = interval(REGULAR_TICK);
    regular_ticker.tick().await;
    let mut burst_ticker = interval(BURST_TICK);
    burst_ticker.tick().await;

    loop {
        tokio::select! {
            control = control_rx.recv() => {
                match control {
                    Some(MonitorControl::Start) => {
                        active = true;
                        previous = inspect_system(&helper);
                        if reports_tx.send(full_report(&previous).into()).await.is_err() {
                            return;
                        }
                    }
                    Some(MonitorControl::Stop) => {
                        active = false;
                        burst_remaining = 0;
                    }
                    Some(MonitorControl::Burst) => {
                        if active {
                            burst_remaining = BURST_COUNT;
                        }
                    }
                    None => return,
                }
            }
            _ = regular_ticker.tick(), if active => {
                let snapshot = inspect_system(&helper);
                let message = produce_report(&snapshot, &previous).into();
                previous = snapshot;
                if reports_tx.send(message).await.is_err() {
                    return;
                }
            }
            _ = burst_ticker.tick(), if active && burst_remaining > 0 => {
                burst_remaining -= 1;
                let snapshot = inspect_system(&helper);
                let message = produce_report(&snapshot, &previous).into();
                previous = snapshot;
                if reports_tx.send(message).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnpi_core::DeviceIdentity;
    use tokio::sync::mpsc;

    // Just exercises the DeviceIdentity import path stays correct after
    // refactors; the real propagation tests live in pnpi-core.
    #[test]
    fn sanity_device_identity_default_is_null() {
        assert!(DeviceIdentity::default().is_null());
    }

    #[tokio::test]
    #[should_panic(expected = "first control code must be Start")]
    async fn monitor_requires_start_as_first_control_code() {
        let (control_tx, control_rx) = mpsc::channel(4);
        let (reports_tx, _reports_rx) = mpsc::channel(4);

        control_tx.send(MonitorControl::Stop).await.unwrap();
        drop(control_tx);

        let helper = Helper::new_for_test();
        run(helper, control_rx, reports_tx).await;
    }
}
