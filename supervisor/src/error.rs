use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("insufficient privileges: {0}")]
    Privilege(String),

    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    #[error("hypervisor launch failed: {0}")]
    HypervisorLaunch(String),

    #[error("vm gateway unreachable: {0}")]
    VmUnreachable(String),

    #[error("tor bootstrap timed out after {0:?}")]
    BootstrapTimeout(Duration),

    #[error("vm exited unexpectedly (status {0})")]
    VmExited(i32),

    #[error("control channel error [{class}]: {desc}")]
    ControlChannel { class: String, desc: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
