use std::path::PathBuf;

use clap::Parser;

/// Host-side accessory daemon for a tethered Android device.
#[derive(Parser, Debug)]
#[command(name = "pnpi", version, about)]
pub struct Args {
    /// Directory containing the raspi-config helper script.
    #[arg(short = 'd', long = "dir")]
    pub dir: PathBuf,

    /// Lower the log level to info.
    #[arg(short = 'z', long = "quiet")]
    pub quiet: bool,
}
