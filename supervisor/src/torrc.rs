//! Renders the `torrc.override` blob handed to the guest on its state disk.
//!
//! Every value interpolated into the blob came from the config file, which
//! an attacker with user-level file access may have edited. Each field is
//! therefore checked against a per-field character allowlist, and newlines
//! or control characters anywhere are rejected outright.

use crate::config::{BridgeConfig, ProxyConfig};
use crate::error::SupervisorError;

pub const OVERRIDE_FILE_NAME: &str = "torrc.override";

pub fn render(bridge: &BridgeConfig, proxy: &ProxyConfig) -> Result<String, SupervisorError> {
    let mut out = String::new();

    if bridge.use_bridges {
        out.push_str("UseBridges 1\n");
        if let Some(plugin) = transport_plugin(&bridge.transport) {
            check_field("bridge.transport", &bridge.transport, is_name_char)?;
            out.push_str(&format!(
                "ClientTransportPlugin {} exec {}\n",
                bridge.transport, plugin
            ));
        }
        for line in &bridge.bridges {
            check_field("bridge line", line, is_bridge_char)?;
            out.push_str(&format!("Bridge {line}\n"));
        }
    }

    match proxy.proxy_type.as_str() {
        "" => {}
        "http" => {
            check_field("proxy.address", &proxy.address, is_addr_char)?;
            out.push_str(&format!("HTTPProxy {}\n", proxy.address));
        }
        "https" => {
            check_field("proxy.address", &proxy.address, is_addr_char)?;
            out.push_str(&format!("HTTPSProxy {}\n", proxy.address));
            if !proxy.username.is_empty() {
                check_field("proxy.username", &proxy.username, is_cred_char)?;
                check_field("proxy.password", &proxy.password, is_cred_char)?;
                out.push_str(&format!(
                    "HTTPSProxyAuthenticator {}:{}\n",
                    proxy.username, proxy.password
                ));
            }
        }
        "socks5" => {
            check_field("proxy.address", &proxy.address, is_addr_char)?;
            out.push_str(&format!("Socks5Proxy {}\n", proxy.address));
            if !proxy.username.is_empty() {
                check_field("proxy.username", &proxy.username, is_cred_char)?;
                check_field("proxy.password", &proxy.password, is_cred_char)?;
                out.push_str(&format!("Socks5ProxyUsername {}\n", proxy.username));
                out.push_str(&format!("Socks5ProxyPassword {}\n", proxy.password));
            }
        }
        other => {
            return Err(SupervisorError::ConfigValidation(format!(
                "proxy.type {other:?} not supported"
            )));
        }
    }

    Ok(out)
}

fn transport_plugin(transport: &str) -> Option<&'static str> {
    match transport {
        "obfs4" | "meek-lite" => Some("/usr/bin/obfs4proxy"),
        "snowflake" => Some("/usr/bin/snowflake-client"),
        _ => None,
    }
}

fn check_field(
    name: &str,
    value: &str,
    allowed: fn(char) -> bool,
) -> Result<(), SupervisorError> {
    if value.is_empty() {
        return Err(SupervisorError::ConfigValidation(format!(
            "{name} must not be empty"
        )));
    }
    for c in value.chars() {
        if c.is_control() || !allowed(c) {
            return Err(SupervisorError::ConfigValidation(format!(
                "{name} contains forbidden character {c:?}"
            )));
        }
    }
    Ok(())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

// Bridge lines carry transport names, host:port, fingerprints, and
// base64-ish key=value parameters.
fn is_bridge_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || " .:[]+/=_-".contains(c)
}

fn is_addr_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || ".:[]-".contains(c)
}

fn is_cred_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "._-@#%+=".contains(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, ProxyConfig};

    fn obfs4_bridge() -> BridgeConfig {
        BridgeConfig {
            use_bridges: true,
            transport: "obfs4".to_string(),
            bridges: vec![
                "obfs4 192.0.2.3:443 AAAABBBBCCCCDDDD cert=abc+def/123= iat-mode=0".to_string(),
            ],
        }
    }

    #[test]
    fn renders_obfs4_bridge_lines() {
        let out = render(&obfs4_bridge(), &ProxyConfig::default()).unwrap();
        assert!(out.starts_with("UseBridges 1\n"));
        assert!(out.contains("ClientTransportPlugin obfs4 exec /usr/bin/obfs4proxy"));
        assert!(out.contains("Bridge obfs4 192.0.2.3:443"));
    }

    #[test]
    fn renders_socks5_proxy_with_auth() {
        let proxy = ProxyConfig {
            proxy_type: "socks5".to_string(),
            address: "198.51.100.7:1080".to_string(),
            username: "user".to_string(),
            password: "pw_123".to_string(),
        };
        let out = render(&BridgeConfig::default(), &proxy).unwrap();
        assert!(out.contains("Socks5Proxy 198.51.100.7:1080"));
        assert!(out.contains("Socks5ProxyUsername user"));
        assert!(out.contains("Socks5ProxyPassword pw_123"));
    }

    #[test]
    fn rejects_newline_injection_in_bridge_line() {
        let mut bridge = obfs4_bridge();
        bridge.bridges[0].push_str("\nSocksPort 0.0.0.0:9");
        assert!(render(&bridge, &ProxyConfig::default()).is_err());
    }

    #[test]
    fn rejects_directive_smuggling_in_credentials() {
        let proxy = ProxyConfig {
            proxy_type: "https".to_string(),
            address: "198.51.100.7:443".to_string(),
            username: "user name".to_string(),
            password: "x".to_string(),
        };
        assert!(render(&BridgeConfig::default(), &proxy).is_err());
    }

    #[test]
    fn empty_config_renders_empty_blob() {
        let out = render(&BridgeConfig::default(), &ProxyConfig::default()).unwrap();
        assert!(out.is_empty());
    }
}
