//! Periodic Wi-Fi hotspot scanning with debounce, grounded on
//! `scan.go`'s `scanForResult`/`WifiScan`.

use std::process::Command;
use std::time::Duration;

use log::warn;
use pnpi_core::Hotspot;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::helper::Helper;

const TICK_PERIOD: Duration = Duration::from_millis(6600);
const MAX_COOL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Start,
    Stop,
}

fn hex_escape_count(ssid: &str) -> usize {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"\\x[0-9a-fA-F]{2}").unwrap());
    re.find_iter(ssid).count()
}

fn ssid_is_valid(ssid: &str) -> bool {
    if ssid.is_empty() {
        return false;
    }
    hex_escape_count(ssid) < 6
}

fn info_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?sm)Signal level=(-[0-9]+) dBm.*?Encryption key:(on|off).*?ESSID:"(.*?)""#)
            .unwrap()
    })
}

/// Run `iwlist scan` via the helper's shell-out convention and parse every
/// section it finds. Invalid SSIDs (empty, or padded with ≥6 hex escapes)
/// are dropped.
fn scan_for_result() -> Vec<Hotspot> {
    let output = match Command::new("iwlist").arg("scan").output() {
        Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
        Err(e) => {
            warn!("iwlist scan failed to run: {e}");
            return Vec::new();
        }
    };

    info_pattern()
        .captures_iter(&output)
        .filter_map(|caps| {
            let signal: i32 = caps[1].parse().ok()?;
            let open = &caps[2] == "off";
            let ssid = caps[3].to_string();
            if !ssid_is_valid(&ssid) {
                return None;
            }
            Some(Hotspot { ssid, open, signal })
        })
        .collect()
}

/// Drive the scan ticker/debounce state machine until `control_rx` closes
/// or reports `Stop` followed by closure. `helper` is accepted for
/// symmetry with the monitor/executor workers even though the scan itself
/// shells out directly, matching the original's direct `exec.Command` call.
pub async fn run(
    _helper: Helper,
    mut control_rx: mpsc::Receiver<ScanControl>,
    results_tx: mpsc::Sender<Vec<Hotspot>>,
) {
    let mut active = false;
    let mut cool: u8 = 0;
    let mut ticker = interval(TICK_PERIOD);
    ticker.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            control = control_rx.recv() => {
                match control {
                    Some(ScanControl::Start) => {
                        active = true;
                        cool = 0;
                        let result = scan_for_result();
                        if results_tx.send(result).await.is_err() {
                            return;
                        }
                    }
                    Some(ScanControl::Stop) => {
                        active = false;
                    }
                    None => return,
                }
            }
            _ = ticker.tick(), if active => {
                let result = scan_for_result();
                let emit = if result.is_empty() {
                    cool = (cool + 1).min(MAX_COOL);
                    cool >= MAX_COOL
                } else {
                    cool = 0;
                    true
                };
                if emit && results_tx.send(result).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ssid_passes() {
        assert!(ssid_is_valid("HomeNetwork"));
    }

    #[test]
    fn empty_ssid_rejected() {
        assert!(!ssid_is_valid(""));
    }

    #[test]
    fn heavily_escaped_ssid_rejected() {
        let padded = r"\x00\x00\x00\x00\x00\x00";
        assert!(!ssid_is_valid(padded));
    }

    #[test]
    fn parses_iwlist_sections() {
        let sample = r#"
          Cell 01 - Address: AA:BB:CC:DD:EE:FF
                    Signal level=-42 dBm
                    Encryption key:on
                    ESSID:"HomeNetwork"
          Cell 02 - Address: 11:22:33:44:55:66
                    Signal level=-70 dBm
                    Encryption key:off
                    ESSID:"OpenGuest"
        "#;
        let matches: Vec<_> = info_pattern()
            .captures_iter(sample)
            .map(|c| (c[1].to_string(), c[2].to_string(), c[3].to_string()))
            .collect();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].2, "HomeNetwork");
        assert_eq!(matches[1].1, "off");
    }

    // Invariant 7: debounce suppresses exactly the first empty after a
    // non-empty run, then emits every subsequent empty.
    #[test]
    fn debounce_sequence_matches_expected_emission_pattern() {
        let inputs = [true, false, false, false, false];
        let mut cool: u8 = 0;
        let mut emitted = Vec::new();
        for &has_result in &inputs {
            let emit = if has_result {
                cool = 0;
                true
            } else {
                cool = (cool + 1).min(MAX_COOL);
                cool >= MAX_COOL
            };
            emitted.push(emit);
        }
        assert_eq!(emitted, vec![true, false, true, true, true]);
    }
}
