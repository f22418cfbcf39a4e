use thiserror::Error;

/// Only fatal conditions surface; per-packet failures are dropped where
/// they happen.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("tunnel device error: {0}")]
    Device(#[from] std::io::Error),
}
