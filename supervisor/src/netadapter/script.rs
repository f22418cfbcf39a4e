//! Integrity sealing and filtering for saved-network scripts.
//!
//! One platform restores its network state by feeding a dumped script back
//! through a system tool, which makes the on-disk blob an injection
//! surface. Two independent defenses are applied: an HMAC-SHA256 tag under
//! a key that never leaves the supervisor process, and a leading-token
//! allowlist over every line of the script before it is executed.

use crate::error::SupervisorError;
use sha2::{Digest, Sha256};

const BLOCK_SIZE: usize = 64;

/// Tokens a configuration dump may legitimately start a line with.
const ALLOWED_LEADING_TOKENS: &[&str] = &[
    "#",
    "pushd",
    "popd",
    "reset",
    "set",
    "add",
    "delete",
    "interface",
    "ip",
];

/// HMAC-SHA256 per RFC 2104. The pack carries no dedicated MAC crate, so
/// the construction is spelled out over the `sha2` primitive.
pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for (i, byte) in key.iter().enumerate() {
        ipad[i] ^= byte;
        opad[i] ^= byte;
    }

    let mut inner = Sha256::new();
    inner.update(ipad);
    inner.update(data);
    let inner_digest = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(opad);
    outer.update(inner_digest);
    outer.finalize().into()
}

pub fn verify(key: &[u8; 32], data: &[u8], tag: &[u8; 32]) -> bool {
    let expected = hmac_sha256(key, data);
    // Fold the comparison so a mismatch position is not observable.
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(tag.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Validate every line of a restore script against the token allowlist.
/// Returns the script unchanged on success; any line opening with an
/// unknown token fails the whole restore.
pub fn filter_script(text: &str) -> Result<String, SupervisorError> {
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        let token = trimmed.split_whitespace().next().unwrap_or_default();
        let allowed =
            token.starts_with('#') || ALLOWED_LEADING_TOKENS.contains(&token.to_ascii_lowercase().as_str());
        if !allowed {
            return Err(SupervisorError::NetworkSetup(format!(
                "saved network script contains disallowed directive {token:?}"
            )));
        }
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
# Interface configuration\n\
pushd interface ip\n\
reset all\n\
set address name=\"Ethernet\" source=static addr=192.0.2.10 mask=255.255.255.0\n\
add dnsservers name=\"Ethernet\" address=192.0.2.1 index=1\n\
popd\n\
# End of configuration\n";

    #[test]
    fn seal_and_verify_round_trip() {
        let key = [7u8; 32];
        let tag = hmac_sha256(&key, DUMP.as_bytes());
        assert!(verify(&key, DUMP.as_bytes(), &tag));
    }

    #[test]
    fn verify_rejects_tampered_blob() {
        let key = [7u8; 32];
        let tag = hmac_sha256(&key, DUMP.as_bytes());
        let mut tampered = DUMP.as_bytes().to_vec();
        tampered[0] ^= 1;
        assert!(!verify(&key, &tampered, &tag));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let tag = hmac_sha256(&[7u8; 32], DUMP.as_bytes());
        assert!(!verify(&[8u8; 32], DUMP.as_bytes(), &tag));
    }

    #[test]
    fn hmac_matches_rfc4231_vector() {
        // RFC 4231 test case 2 with the short key zero-padded to 32 bytes,
        // which is equivalent for HMAC.
        let mut key = [0u8; 32];
        key[..4].copy_from_slice(b"Jefe");
        let tag = hmac_sha256(&key, b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn filter_accepts_a_netsh_style_dump() {
        filter_script(DUMP).unwrap();
    }

    #[test]
    fn filter_rejects_injected_commands() {
        for line in [
            "start calc.exe",
            "exec cmd /c whoami",
            "route delete 0.0.0.0",
            "netsh advfirewall set allprofiles state off",
        ] {
            let script = format!("{DUMP}{line}\n");
            assert!(filter_script(&script).is_err(), "accepted {line:?}");
        }
    }

    #[test]
    fn filter_allows_blank_lines_and_comments() {
        filter_script("\n\n# just a comment\n   \n").unwrap();
    }
}
