//! The data model shared between the USB/discovery layer and the session
//! supervisor: device identities, the discovery history map, system
//! inventory snapshots, and the command/report shapes that cross the wire.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Vendor ID Android devices advertise once switched into accessory mode.
pub const AOA_VENDOR_ID: u16 = 0x18D1;
/// Accessory-mode product ID.
pub const AOA_PRODUCT_ID: u16 = 0x2D00;
/// Accessory-mode product ID, debug-adb variant.
pub const AOA_PRODUCT_ID_ADB: u16 = 0x2D01;

/// `(bus, address, vendor_id, product_id)` identity of a USB device as seen
/// across enumeration cycles. Equality is structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceIdentity {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    /// The sentinel identity meaning "no device found".
    pub const NULL: DeviceIdentity = DeviceIdentity {
        bus: 0,
        address: 0,
        vendor_id: 0,
        product_id: 0,
    };

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// True iff the device has already switched into AOA accessory mode.
    pub fn is_accessory_mode(&self) -> bool {
        self.vendor_id == AOA_VENDOR_ID
            && matches!(self.product_id, AOA_PRODUCT_ID | AOA_PRODUCT_ID_ADB)
    }
}

/// Per-identity bookkeeping carried across discovery scan cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceHistory {
    #[default]
    NoAction,
    SwitchRequested,
    SwitchFailed,
    OpenFailed,
}

pub type DeviceMap = HashMap<DeviceIdentity, DeviceHistory>;

/// Apply the propagation rule from a previous history entry, given the
/// identity's current accessory-mode status.
pub fn propagate_history(identity: DeviceIdentity, previous: DeviceHistory) -> DeviceHistory {
    if identity.is_accessory_mode() {
        match previous {
            DeviceHistory::OpenFailed => DeviceHistory::OpenFailed,
            _ => DeviceHistory::NoAction,
        }
    } else {
        match previous {
            DeviceHistory::SwitchRequested => DeviceHistory::SwitchFailed,
            other => other,
        }
    }
}

/// Rebuild the device map for a scan cycle: carry over history for
/// identities seen before (via the propagation rule), default the rest to
/// `NoAction`, and pick at most one accessory target and one switch target.
///
/// Tie-breaking among multiple eligible candidates in the same category is
/// deterministic: ascending `(bus, address)`.
pub fn update_device_map(
    discovered: impl IntoIterator<Item = DeviceIdentity>,
    previous: &DeviceMap,
) -> (DeviceMap, Option<DeviceIdentity>, Option<DeviceIdentity>) {
    let mut merged = DeviceMap::new();
    for identity in discovered {
        let history = previous
            .get(&identity)
            .map(|h| propagate_history(identity, *h))
            .unwrap_or_default();
        merged.insert(identity, history);
    }

    let mut identities: Vec<DeviceIdentity> = merged.keys().copied().collect();
    identities.sort_by_key(|i| (i.bus, i.address));

    let mut accessory_target = None;
    let mut switch_target = None;
    for identity in identities {
        if merged[&identity] != DeviceHistory::NoAction {
            continue;
        }
        if identity.is_accessory_mode() {
            accessory_target.get_or_insert(identity);
        } else {
            switch_target.get_or_insert(identity);
        }
    }

    (merged, accessory_target, switch_target)
}

/// A single host network interface, as reported to the tethered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(rename = "ip")]
    pub ips: BTreeSet<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ssid: String,
    #[serde(rename = "wifi")]
    pub is_default_wifi: bool,
}

/// A host service whose running state we can report and toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Service {
    pub name: &'static str,
    pub running: bool,
}

/// The fixed set of services this daemon knows about.
pub const KNOWN_SERVICES: [&str; 2] = ["SSH", "VNC"];

/// A single Wi-Fi access point observation from a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hotspot {
    pub ssid: String,
    pub open: bool,
    pub signal: i32,
}

/// A selectable Wi-Fi regulatory country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Country {
    pub code: String,
    pub name: String,
}

/// A point-in-time snapshot of everything the monitor tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSnapshot {
    pub interfaces: HashMap<String, NetworkInterface>,
    pub services: HashMap<String, Service>,
    pub wifi_country: String,
}

/// The result of diffing two snapshots: either a full dump or a delta.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemReport {
    Full {
        interfaces: Vec<NetworkInterface>,
        services: Vec<Service>,
        wifi_country: String,
    },
    Change {
        interfaces: Vec<NetworkInterface>,
        services: Vec<Service>,
        wifi_country: String,
    },
}

/// Diff `new` against `old`. Returns `None` when nothing reportable changed.
///
/// A full report is emitted whenever the *set* of interface or service names
/// differs; otherwise only entries whose value actually changed are
/// reported. A Wi-Fi country change alone (with interfaces/services
/// otherwise identical) does not by itself force a report - this mirrors
/// the upstream diffing rule, which only inspects interfaces/services.
pub fn produce_report(new: &SystemSnapshot, old: &SystemSnapshot) -> Option<SystemReport> {
    let new_if_keys: BTreeSet<&String> = new.interfaces.keys().collect();
    let old_if_keys: BTreeSet<&String> = old.interfaces.keys().collect();
    let new_sv_keys: BTreeSet<&String> = new.services.keys().collect();
    let old_sv_keys: BTreeSet<&String> = old.services.keys().collect();

    if new_if_keys != old_if_keys || new_sv_keys != old_sv_keys {
        let mut interfaces: Vec<_> = new.interfaces.values().cloned().collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        let mut services: Vec<_> = new.services.values().copied().collect();
        services.sort_by(|a, b| a.name.cmp(b.name));
        return Some(SystemReport::Full {
            interfaces,
            services,
            wifi_country: new.wifi_country.clone(),
        });
    }

    let mut interfaces: Vec<NetworkInterface> = new
        .interfaces
        .iter()
        .filter(|(name, iface)| old.interfaces.get(*name) != Some(*iface))
        .map(|(_, iface)| iface.clone())
        .collect();
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));

    let mut services: Vec<Service> = new
        .services
        .iter()
        .filter(|(name, svc)| old.services.get(*name) != Some(*svc))
        .map(|(_, svc)| *svc)
        .collect();
    services.sort_by(|a, b| a.name.cmp(b.name));

    if interfaces.is_empty() && services.is_empty() {
        None
    } else {
        Some(SystemReport::Change {
            interfaces,
            services,
            wifi_country: new.wifi_country.clone(),
        })
    }
}

/// A command received from the tethered device.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub action: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Command {
    /// Whether this action, if dispatched to the executor, should also
    /// trigger a monitor burst (spec: connect/disconnect/start/stop/country).
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self.action.as_str(),
            "connect" | "disconnect" | "start" | "stop" | "country"
        )
    }
}

/// Outcome of dispatching a `Command` to the executor. Logged only, never
/// sent back over the wire.
#[derive(Debug)]
pub struct CommandResult {
    pub command: Command,
    pub error: Option<String>,
}

/// Messages the host can send to the tethered device. The JSON `type` tag
/// discriminates; field-omission rules per variant are spelled out in the
/// wire schema (spec ~6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "states")]
    States {
        interfaces: Vec<NetworkInterface>,
        services: Vec<Service>,
        wifi_country_code: String,
    },
    #[serde(rename = "change")]
    Change {
        #[serde(skip_serializing_if = "Vec::is_empty")]
        interfaces: Vec<NetworkInterface>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        services: Vec<Service>,
        wifi_country_code: String,
    },
    #[serde(rename = "scan")]
    Scan { hotspots: Vec<Hotspot> },
    #[serde(rename = "choices")]
    Choices { countries: Vec<Country> },
    /// A monitor tick produced no diff. Serializes as a literal `{}`, not
    /// `{"type":"empty"}` - `build_frame` special-cases this variant rather
    /// than deriving its wire form, since the wire contract is a bare empty
    /// object kept only to hold the writer "live" for the pending counter.
    Empty,
}

impl From<SystemReport> for OutboundMessage {
    fn from(report: SystemReport) -> Self {
        match report {
            SystemReport::Full {
                interfaces,
                services,
                wifi_country,
            } => OutboundMessage::States {
                interfaces,
                services,
                wifi_country_code: wifi_country,
            },
            SystemReport::Change {
                interfaces,
                services,
                wifi_country,
            } => OutboundMessage::Change {
                interfaces,
                services,
                wifi_country_code: wifi_country,
            },
        }
    }
}

impl From<Option<SystemReport>> for OutboundMessage {
    fn from(report: Option<SystemReport>) -> Self {
        match report {
            Some(report) => report.into(),
            None => OutboundMessage::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(bus: u8, address: u8, vendor: u16, product: u16) -> DeviceIdentity {
        DeviceIdentity {
            bus,
            address,
            vendor_id: vendor,
            product_id: product,
        }
    }

    #[test]
    fn accessory_mode_detection() {
        assert!(id(1, 2, 0x18D1, 0x2D00).is_accessory_mode());
        assert!(id(1, 2, 0x18D1, 0x2D01).is_accessory_mode());
        assert!(!id(1, 2, 0x04E8, 0x6860).is_accessory_mode());
    }

    #[test]
    fn null_identity() {
        assert!(DeviceIdentity::default().is_null());
        assert!(!id(1, 2, 0x18D1, 0x2D00).is_null());
    }

    #[test]
    fn propagation_keeps_open_failed() {
        let i = id(1, 2, 0x18D1, 0x2D00);
        assert_eq!(
            propagate_history(i, DeviceHistory::OpenFailed),
            DeviceHistory::OpenFailed
        );
        assert_eq!(
            propagate_history(i, DeviceHistory::SwitchRequested),
            DeviceHistory::NoAction
        );
    }

    #[test]
    fn propagation_marks_switch_failed() {
        let i = id(1, 2, 0x04E8, 0x6860);
        assert_eq!(
            propagate_history(i, DeviceHistory::SwitchRequested),
            DeviceHistory::SwitchFailed
        );
        assert_eq!(
            propagate_history(i, DeviceHistory::NoAction),
            DeviceHistory::NoAction
        );
    }

    // Invariant 1: repeatedly applying the propagation rule over an
    // unchanged device set reaches a fixed point.
    #[test]
    fn propagation_is_idempotent_at_fixed_point() {
        let switching = id(1, 2, 0x04E8, 0x6860);
        let opened = id(1, 3, 0x18D1, 0x2D00);

        let mut map = DeviceMap::new();
        map.insert(switching, DeviceHistory::SwitchFailed);
        map.insert(opened, DeviceHistory::OpenFailed);

        let (merged1, _, _) = update_device_map([switching, opened], &map);
        let (merged2, _, _) = update_device_map([switching, opened], &merged1);

        assert_eq!(merged1, merged2);
    }

    // Invariant 2: at most one accessory target, at most one switch target.
    #[test]
    fn at_most_one_target_per_category() {
        let a1 = id(1, 2, 0x18D1, 0x2D00);
        let a2 = id(1, 4, 0x18D1, 0x2D01);
        let s1 = id(1, 3, 0x04E8, 0x6860);
        let s2 = id(1, 5, 0x05C6, 0x9025);

        let (_, accessory, switch) = update_device_map([a1, a2, s1, s2], &DeviceMap::new());
        assert_eq!(accessory, Some(a1));
        assert_eq!(switch, Some(s1));
    }

    #[test]
    fn switch_target_selection_is_deterministic() {
        let s_high = id(2, 1, 0x04E8, 0x6860);
        let s_low = id(1, 9, 0x04E8, 0x6860);

        let (_, _, switch) = update_device_map([s_high, s_low], &DeviceMap::new());
        assert_eq!(switch, Some(s_low));
    }

    // S1: switch requested on cycle 1, device reappears in accessory mode
    // on cycle 2 and is picked up as the open target.
    #[test]
    fn scenario_switch_then_open() {
        let phone = id(1, 2, 0x04E8, 0x6860);
        let phone_in_accessory_mode = id(1, 3, 0x18D1, 0x2D00);

        let (map, accessory, switch) = update_device_map([phone], &DeviceMap::new());
        assert_eq!(accessory, None);
        assert_eq!(switch, Some(phone));

        let (_, accessory, switch) = update_device_map([phone_in_accessory_mode], &map);
        assert_eq!(accessory, Some(phone_in_accessory_mode));
        assert_eq!(switch, None);
    }

    // S2: a device already enumerated in accessory mode with no prior
    // history opens on the very first cycle.
    #[test]
    fn scenario_accessory_already_present() {
        let phone = id(1, 2, 0x18D1, 0x2D01);
        let (_, accessory, switch) = update_device_map([phone], &DeviceMap::new());
        assert_eq!(accessory, Some(phone));
        assert_eq!(switch, None);
    }

    // S3: a switch that fails to reappear is marked SwitchFailed and
    // stays that way across further cycles until the identity vanishes
    // and comes back.
    #[test]
    fn scenario_switch_fails_to_reappear() {
        let phone = id(1, 2, 0x04E8, 0x6860);

        let (mut map, _, switch) = update_device_map([phone], &DeviceMap::new());
        assert_eq!(switch, Some(phone));
        // Caller records the outcome of the attempted switch before the
        // next cycle, the same way the outer loop calls `discovery::mark`.
        map.insert(phone, DeviceHistory::SwitchRequested);

        let (map, accessory, switch) = update_device_map([phone], &map);
        assert_eq!(accessory, None);
        assert_eq!(switch, None);
        assert_eq!(map[&phone], DeviceHistory::SwitchFailed);

        let (map, _, switch) = update_device_map([phone], &map);
        assert_eq!(switch, None);
        assert_eq!(map[&phone], DeviceHistory::SwitchFailed);

        let (map, _, _) = update_device_map(std::iter::empty::<DeviceIdentity>(), &map);
        assert!(map.is_empty());
        let (_, _, switch) = update_device_map([phone], &map);
        assert_eq!(switch, Some(phone));
    }

    fn iface(name: &str, ip: &str, wifi: bool) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            ips: [ip.to_string()].into_iter().collect(),
            ssid: String::new(),
            is_default_wifi: wifi,
        }
    }

    fn svc(name: &'static str, running: bool) -> Service {
        Service { name, running }
    }

    fn snapshot(ifaces: &[NetworkInterface], services: &[Service]) -> SystemSnapshot {
        SystemSnapshot {
            interfaces: ifaces.iter().map(|i| (i.name.clone(), i.clone())).collect(),
            services: services.iter().map(|s| (s.name.to_string(), *s)).collect(),
            wifi_country: "US".to_string(),
        }
    }

    // Invariant 3 (first half): identical snapshots diff to nothing.
    #[test]
    fn identical_snapshots_produce_no_report() {
        let snap = snapshot(&[iface("eth0", "10.0.0.1", false)], &[svc("SSH", true)]);
        assert_eq!(produce_report(&snap, &snap), None);
    }

    // Invariant 3 (second half): a full report iff the key-sets differ.
    #[test]
    fn key_set_change_forces_full_report() {
        let old = snapshot(&[iface("eth0", "10.0.0.1", false)], &[svc("SSH", true)]);
        let new = snapshot(
            &[
                iface("eth0", "10.0.0.1", false),
                iface("wlan0", "10.0.0.2", true),
            ],
            &[svc("SSH", true)],
        );

        match produce_report(&new, &old) {
            Some(SystemReport::Full { interfaces, .. }) => assert_eq!(interfaces.len(), 2),
            other => panic!("expected full report, got {other:?}"),
        }
    }

    #[test]
    fn value_change_without_key_change_is_a_diff() {
        let old = snapshot(&[iface("eth0", "10.0.0.1", false)], &[svc("SSH", false)]);
        let new = snapshot(&[iface("eth0", "10.0.0.1", false)], &[svc("SSH", true)]);

        match produce_report(&new, &old) {
            Some(SystemReport::Change {
                interfaces,
                services,
                ..
            }) => {
                assert!(interfaces.is_empty());
                assert_eq!(services, vec![svc("SSH", true)]);
            }
            other => panic!("expected change report, got {other:?}"),
        }
    }

    #[test]
    fn state_changing_actions() {
        let cmd = |a: &str| Command {
            action: a.to_string(),
            args: vec![],
        };
        assert!(cmd("connect").is_state_changing());
        assert!(cmd("country").is_state_changing());
        assert!(!cmd("halt").is_state_changing());
        assert!(!cmd("monitor").is_state_changing());
    }
}
