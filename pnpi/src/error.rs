use thiserror::Error;

/// Top-level classification of everything that can go wrong. `main` maps
/// `FatalStartup` to a non-zero exit; `TransientUsb`, `WorkerPanic`, and
/// `WriterBackpressure` are constructed by the outer discovery loop and
/// session supervisor purely to get a consistent `Display` message logged
/// at the point of failure, and never propagate back to `main`.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("fatal startup error: {0}")]
    FatalStartup(String),

    #[error("transient USB error: {0}")]
    TransientUsb(#[from] pnpi_usb::UsbError),

    #[error("worker {0} panicked")]
    WorkerPanic(&'static str),

    #[error("writer backpressure exceeded limit")]
    WriterBackpressure,

    #[error("helper command failed: {0}")]
    HelperFailure(String),
}
