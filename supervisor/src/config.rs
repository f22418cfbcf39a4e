//! Supervisor configuration: a JSON file holding the VM network topology,
//! hypervisor resources, and Tor bridge/proxy settings.

use crate::error::SupervisorError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const ACCEL_BACKENDS: &[&str] = &["", "kvm", "hvf", "whpx", "tcg"];
pub const BRIDGE_TRANSPORTS: &[&str] = &["", "none", "obfs4", "meek-lite", "snowflake"];
pub const PROXY_TYPES: &[&str] = &["", "http", "https", "socks5"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub use_bridges: bool,
    pub transport: String,
    pub bridges: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub address: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tap_name: String,
    pub host_ip: String,
    pub vm_ip: String,
    pub subnet_mask: String,
    pub dns1: String,
    pub dns2: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub trans_port: u16,
    pub dns_port: u16,
    pub vm_memory_mb: u32,
    pub vm_cpus: u32,
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub state_disk_path: PathBuf,
    pub qmp_socket_path: PathBuf,
    pub verbose: bool,
    pub accel: String,
    pub headless: bool,
    pub bridge: BridgeConfig,
    pub proxy: ProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tap_name: "tap0".to_string(),
            host_ip: "10.10.10.2".to_string(),
            vm_ip: "10.10.10.1".to_string(),
            subnet_mask: "255.255.255.252".to_string(),
            dns1: "10.10.10.1".to_string(),
            dns2: "10.10.10.1".to_string(),
            socks_port: 9050,
            control_port: 9051,
            trans_port: 9040,
            dns_port: 9053,
            vm_memory_mb: 512,
            vm_cpus: 1,
            kernel_path: PathBuf::from("/var/lib/torgate/kernel"),
            initrd_path: PathBuf::from("/var/lib/torgate/initrd"),
            state_disk_path: PathBuf::from("/var/lib/torgate/state.img"),
            qmp_socket_path: PathBuf::from("/run/torgate/qmp.sock"),
            verbose: false,
            accel: String::new(),
            headless: true,
            bridge: BridgeConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, SupervisorError> {
        check_file_mode(path)?;
        let data = tokio::fs::read(path).await?;
        let config: Config = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), SupervisorError> {
        let data = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, data).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        parse_ip("host_ip", &self.host_ip)?;
        parse_ip("vm_ip", &self.vm_ip)?;
        parse_ip("subnet_mask", &self.subnet_mask)?;
        parse_ip("dns1", &self.dns1)?;
        parse_ip("dns2", &self.dns2)?;

        for (name, port) in [
            ("socks_port", self.socks_port),
            ("control_port", self.control_port),
            ("trans_port", self.trans_port),
            ("dns_port", self.dns_port),
        ] {
            if port == 0 {
                return Err(SupervisorError::ConfigValidation(format!(
                    "{name} must be in 1..=65535"
                )));
            }
        }

        if !(32..=4096).contains(&self.vm_memory_mb) {
            return Err(SupervisorError::ConfigValidation(format!(
                "vm_memory_mb {} outside 32..=4096",
                self.vm_memory_mb
            )));
        }
        if !(1..=16).contains(&self.vm_cpus) {
            return Err(SupervisorError::ConfigValidation(format!(
                "vm_cpus {} outside 1..=16",
                self.vm_cpus
            )));
        }

        if self.tap_name.is_empty()
            || self.tap_name.len() > 15
            || !self
                .tap_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SupervisorError::ConfigValidation(format!(
                "tap_name {:?} must be 1..=15 chars of [A-Za-z0-9_-]",
                self.tap_name
            )));
        }

        check_enum("accel", &self.accel, ACCEL_BACKENDS)?;
        check_enum("bridge.transport", &self.bridge.transport, BRIDGE_TRANSPORTS)?;
        check_enum("proxy.type", &self.proxy.proxy_type, PROXY_TYPES)?;

        for (name, path) in [
            ("kernel_path", &self.kernel_path),
            ("initrd_path", &self.initrd_path),
            ("state_disk_path", &self.state_disk_path),
            ("qmp_socket_path", &self.qmp_socket_path),
        ] {
            let raw = path.as_os_str();
            if raw.is_empty() {
                return Err(SupervisorError::ConfigValidation(format!(
                    "{name} must not be empty"
                )));
            }
            if path.to_string_lossy().contains('\0') {
                return Err(SupervisorError::ConfigValidation(format!(
                    "{name} contains a NUL byte"
                )));
            }
        }

        Ok(())
    }

    pub fn host_ip_addr(&self) -> Result<Ipv4Addr, SupervisorError> {
        parse_ip("host_ip", &self.host_ip)
    }

    pub fn vm_ip_addr(&self) -> Result<Ipv4Addr, SupervisorError> {
        parse_ip("vm_ip", &self.vm_ip)
    }

    pub fn subnet_mask_addr(&self) -> Result<Ipv4Addr, SupervisorError> {
        parse_ip("subnet_mask", &self.subnet_mask)
    }
}

fn parse_ip(name: &str, value: &str) -> Result<Ipv4Addr, SupervisorError> {
    value.parse::<Ipv4Addr>().map_err(|_| {
        SupervisorError::ConfigValidation(format!("{name} {value:?} is not an IPv4 literal"))
    })
}

fn check_enum(name: &str, value: &str, allowed: &[&str]) -> Result<(), SupervisorError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(SupervisorError::ConfigValidation(format!(
            "{name} {value:?} not one of {allowed:?}"
        )))
    }
}

#[cfg(unix)]
fn check_file_mode(path: &Path) -> Result<(), SupervisorError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(path)?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(SupervisorError::ConfigValidation(format!(
            "{} is mode {:03o}; must be 0600 or stricter",
            path.display(),
            mode
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_file_mode(_path: &Path) -> Result<(), SupervisorError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_ip_literal() {
        let mut config = Config::default();
        config.vm_ip = "10.10.10".to_string();
        assert!(matches!(
            config.validate(),
            Err(SupervisorError::ConfigValidation(_))
        ));
    }

    #[test]
    fn rejects_zero_port() {
        let mut config = Config::default();
        config.socks_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_memory_out_of_range() {
        let mut config = Config::default();
        config.vm_memory_mb = 16;
        assert!(config.validate().is_err());
        config.vm_memory_mb = 8192;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_shell_metacharacters_in_tap_name() {
        let mut config = Config::default();
        config.tap_name = "tap0; rm -rf /".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_accel() {
        let mut config = Config::default();
        config.accel = "xen".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_transport_and_proxy() {
        let mut config = Config::default();
        config.bridge.transport = "obfs3".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.proxy_type = "socks4".to_string();
        assert!(config.validate().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn load_rejects_group_readable_file() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::default();
        config.save(&path).await.unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(Config::load(&path).await.is_err());

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        Config::load(&path).await.unwrap();
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.bridge.use_bridges = true;
        config.bridge.transport = "obfs4".to_string();
        config.save(&path).await.unwrap();

        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.bridge.transport, "obfs4");
        assert_eq!(loaded.socks_port, config.socks_port);
    }
}
