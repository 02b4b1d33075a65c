mod cli;
mod error;
mod executor;
mod helper;
mod monitor;
mod process_guard;
mod scanner;
mod session;

use std::process::exit;
use std::time::Duration;

use clap::Parser;
use futures_util::FutureExt;
use log::{error, info, warn, LevelFilter};
use pnpi_core::{DeviceHistory, DeviceMap};
use tokio::task::LocalSet;

use cli::Args;
use error::DaemonError;
use helper::Helper;

const PROCESS_NAME: &str = "pnpi";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(if args.quiet {
            LevelFilter::Info
        } else {
            LevelFilter::Debug
        })
        .init();

    if process_guard::another_instance_running(PROCESS_NAME, std::process::id()) {
        error!("another {PROCESS_NAME} instance is already running");
        exit(1);
    }

    let helper = match Helper::new(&args.dir) {
        Ok(helper) => helper,
        Err(DaemonError::FatalStartup(msg)) => {
            error!("{msg}");
            exit(1);
        }
        Err(e) => {
            error!("unexpected startup error: {e}");
            exit(1);
        }
    };

    let local_set = LocalSet::new();
    local_set
        .run_until(async move {
            let logic = tokio::task::spawn_local(run_outer_loop(helper));

            let ctrl_c_listener = tokio::task::spawn_local(async move {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to listen for Ctrl-C");
                warn!("received Ctrl-C, shutting down");

                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to listen for second Ctrl-C");
                error!("received second Ctrl-C, forcing exit");
                exit(1);
            });

            futures_util::select_biased! {
                _ = logic.fuse() => {}
                _ = ctrl_c_listener.fuse() => {}
            }
        })
        .await;

    info!("exiting");
}

/// Repeatedly: discover/switch/open an accessory stack, then run a
/// session over it until the link drops. `device_map` is the process-wide
/// carry-over state threaded explicitly through this loop rather than
/// living as a global.
async fn run_outer_loop(helper: Helper) {
    let mut device_map: DeviceMap = DeviceMap::new();

    loop {
        let (map, accessory_target, switch_target) =
            pnpi_usb::run_discovery_cycle(&device_map).await;
        device_map = map;

        if let Some(identity) = accessory_target {
            match pnpi_usb::open_stack(identity).await {
                Ok(stack) => {
                    info!("accessory mode opened: {identity:?}");
                    let (reader, writer, closer) = stack.split();
                    session::run(reader, writer, helper.clone()).await;
                    if let Err(e) = closer.close().await {
                        warn!("error closing accessory stack: {e}");
                    }
                }
                Err(e) => {
                    let e = DaemonError::from(e);
                    warn!("cannot open accessory mode: {identity:?}, {e}");
                    pnpi_usb::discovery::mark(&mut device_map, identity, DeviceHistory::OpenFailed);
                }
            }
            continue;
        }

        if let Some(identity) = switch_target {
            info!("requesting switch: {identity:?}");
            match pnpi_usb::request_switch(identity).await {
                Ok(()) => {
                    pnpi_usb::discovery::mark(&mut device_map, identity, DeviceHistory::SwitchRequested);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    warn!("cannot switch to accessory mode: {identity:?}, {e}");
                    pnpi_usb::discovery::mark(&mut device_map, identity, DeviceHistory::SwitchFailed);
                }
            }
        } else {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}
