//! Dispatches `Command`s to the helper subprocess, grounded on
//! `execute.go`'s `ExecuteCommands` switch.

use log::error;
use pnpi_core::{Command, CommandResult};
use tokio::sync::mpsc;

use crate::helper::Helper;

/// Run the executor: drain `commands_rx` until it closes, dispatching each
/// command to the helper and reporting the outcome. An unrecognized
/// action is a worker panic, matching the original's `panic("Invalid
/// command")` - the caller wraps this future in a panic guard.
pub async fn run(
    helper: Helper,
    mut commands_rx: mpsc::Receiver<Command>,
    results_tx: mpsc::Sender<CommandResult>,
) {
    while let Some(command) = commands_rx.recv().await {
        let error = dispatch(&helper, &command);
        if let Some(ref e) = error {
            error!("command {:?} failed: {e}", command.action);
        }
        if results_tx
            .send(CommandResult {
                command,
                error,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

fn dispatch(helper: &Helper, command: &Command) -> Option<String> {
    let result = match command.action.as_str() {
        "connect" => {
            let ssid = command.args.first().map(String::as_str).unwrap_or("");
            let pass = command.args.get(1).map(String::as_str).unwrap_or("");
            helper.wifi_connect(ssid, pass)
        }
        "disconnect" => {
            let ssid = command.args.first().map(String::as_str).unwrap_or("");
            helper.wifi_disconnect(ssid)
        }
        "start" => {
            let service = command.args.first().map(String::as_str).unwrap_or("");
            helper.start_service(service)
        }
        "stop" => {
            let service = command.args.first().map(String::as_str).unwrap_or("");
            helper.stop_service(service)
        }
        "country" => {
            let code = command.args.first().map(String::as_str).unwrap_or("");
            helper.set_wifi_country(code)
        }
        "halt" => helper.halt_system(),
        "reboot" => helper.reboot_system(),
        other => {
            panic!("Invalid command: {other}");
        }
    };

    result.err().map(|e| e.to_string())
}
