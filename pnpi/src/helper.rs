//! Wraps the `raspi-config` helper subprocess: the only component allowed
//! to actually mutate host OS state (Wi-Fi, services, halt, reboot).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;
use pnpi_core::Country;

use crate::error::DaemonError;

const EXECUTABLE_BY_ALL: u32 = 0o111;

#[derive(Debug, Clone)]
pub struct Helper {
    script_path: PathBuf,
}

impl Helper {
    /// Resolve `raspi-config` under `dir` and verify it exists and is
    /// executable by all. Fatal (not transient) if either check fails.
    pub fn new(dir: &Path) -> Result<Self, DaemonError> {
        let script_path = dir.join("raspi-config");
        let metadata = std::fs::metadata(&script_path).map_err(|e| {
            DaemonError::FatalStartup(format!(
                "helper script not found at {}: {e}",
                script_path.display()
            ))
        })?;

        if metadata.permissions().mode() & EXECUTABLE_BY_ALL != EXECUTABLE_BY_ALL {
            return Err(DaemonError::FatalStartup(format!(
                "helper script at {} is not executable by all",
                script_path.display()
            )));
        }

        Ok(Self { script_path })
    }

    fn run(&self, args: &[&str]) -> Result<String, DaemonError> {
        debug!("helper invoke: {:?} {:?}", self.script_path, args);
        let output = Command::new(&self.script_path)
            .args(args)
            .output()
            .map_err(|e| DaemonError::HelperFailure(format!("failed to spawn helper: {e}")))?;

        if !output.status.success() {
            return Err(DaemonError::HelperFailure(format!(
                "helper exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Non-fatal variant for read-only queries: an error becomes an empty
    /// string rather than propagating, per the monitor's error contract.
    fn run_or_empty(&self, args: &[&str]) -> String {
        self.run(args).unwrap_or_default()
    }

    pub fn halt_system(&self) -> Result<(), DaemonError> {
        self.run(&["halt", "-h"]).map(|_| ())
    }

    pub fn reboot_system(&self) -> Result<(), DaemonError> {
        self.run(&["reboot"]).map(|_| ())
    }

    pub fn start_service(&self, name: &str) -> Result<(), DaemonError> {
        self.run(&[Self::do_fn(name)?, "0"]).map(|_| ())
    }

    pub fn stop_service(&self, name: &str) -> Result<(), DaemonError> {
        self.run(&[Self::do_fn(name)?, "1"]).map(|_| ())
    }

    pub fn service_is_running(&self, name: &str) -> bool {
        let Ok(get_fn) = Self::get_fn(name) else {
            return false;
        };
        self.run_or_empty(&[get_fn]) == "0"
    }

    pub fn wifi_connect(&self, ssid: &str, passphrase: &str) -> Result<(), DaemonError> {
        self.run(&["do_wifi_ssid_passphrase", ssid, passphrase])
            .map(|_| ())
    }

    pub fn wifi_disconnect(&self, ssid: &str) -> Result<(), DaemonError> {
        self.run(&["do_wifi_ssid_disconnect", ssid]).map(|_| ())
    }

    pub fn wifi_country_code(&self) -> String {
        self.run_or_empty(&["get_wifi_country"])
    }

    pub fn set_wifi_country(&self, code: &str) -> Result<(), DaemonError> {
        self.run(&["do_wifi_country", code]).map(|_| ())
    }

    pub fn available_wifi_countries(&self) -> Vec<Country> {
        let output = self.run_or_empty(&["list_wifi_countries"]);
        output
            .lines()
            .filter_map(|line| {
                let (code, name) = line.split_once(',')?;
                Some(Country {
                    code: code.to_string(),
                    name: name.to_string(),
                })
            })
            .collect()
    }

    /// Only the first line of `list_wlan_interfaces` names the default
    /// Wi-Fi adapter; empty string means none.
    pub fn default_wlan_interface(&self) -> String {
        self.run_or_empty(&["list_wlan_interfaces"])
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    /// Unlike the other queries, this bypasses the `raspi-config` helper
    /// entirely and reads the SSID straight off `iwgetid`; there's no
    /// raspi-config action for it.
    pub fn report_ssid(&self, interface: &str) -> String {
        Command::new("iwgetid")
            .args([interface, "--raw"])
            .output()
            .ok()
            .filter(|output| output.status.success())
            .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
            .unwrap_or_default()
    }

    fn do_fn(service: &str) -> Result<&'static str, DaemonError> {
        match service {
            "SSH" => Ok("do_ssh"),
            "VNC" => Ok("do_vnc"),
            other => Err(DaemonError::HelperFailure(format!(
                "unknown service: {other}"
            ))),
        }
    }

    fn get_fn(service: &str) -> Result<&'static str, DaemonError> {
        match service {
            "SSH" => Ok("get_ssh"),
            "VNC" => Ok("get_vnc"),
            other => Err(DaemonError::HelperFailure(format!(
                "unknown service: {other}"
            ))),
        }
    }
}

#[cfg(test)]
impl Helper {
    /// Build a `Helper` without the filesystem preflight, for tests that
    /// never actually invoke the subprocess.
    pub fn new_for_test() -> Self {
        Helper {
            script_path: PathBuf::from("/nonexistent/raspi-config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn do_fn_maps_known_services() {
        assert_eq!(Helper::do_fn("SSH").unwrap(), "do_ssh");
        assert_eq!(Helper::do_fn("VNC").unwrap(), "do_vnc");
        assert!(Helper::do_fn("HTTP").is_err());
    }

    #[test]
    fn parses_country_list() {
        let helper = Helper {
            script_path: PathBuf::from("/nonexistent/raspi-config"),
        };
        // available_wifi_countries shells out and swallows the failure,
        // yielding an empty list rather than panicking.
        assert!(helper.available_wifi_countries().is_empty());
    }
}
