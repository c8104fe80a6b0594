#![forbid(unsafe_code)]

use trackpage_contracts::credential_secrets::CredentialSecretId;
use trackpage_engines::session_vault::{parse_secret_id, SessionVault};

pub const VAULT_USAGE: &str = "usage: trackpage vault <set|has|del|ls> [key_id]";

/// Runs one vault subcommand and returns what should be printed. Never echoes a secret.
pub fn execute_vault_command(
    vault: &SessionVault,
    subcommand: &str,
    key_id: Option<&str>,
    value: Option<&str>,
) -> Result<String, String> {
    match subcommand {
        "set" => {
            let key = require_key_id(key_id)?;
            let raw = value.ok_or_else(|| "missing secret input value".to_string())?;
            vault
                .set_secret(key, raw)
                .map_err(|e| format!("failed to store {}: {e}", key.as_str()))?;
            Ok("OK".to_string())
        }
        "has" => {
            let key = require_key_id(key_id)?;
            let has = vault
                .stored_secret_ids()
                .map_err(|e| format!("failed to check {}: {e}", key.as_str()))?
                .contains(&key);
            Ok(if has { "YES" } else { "NO" }.to_string())
        }
        "del" => {
            let key = require_key_id(key_id)?;
            let removed = vault
                .delete_secret(key)
                .map_err(|e| format!("failed to delete {}: {e}", key.as_str()))?;
            Ok(if removed { "OK" } else { "ABSENT" }.to_string())
        }
        "ls" => {
            let keys = vault
                .stored_secret_ids()
                .map_err(|e| format!("failed to list keys: {e}"))?;
            Ok(keys
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join("\n"))
        }
        _ => Err(format!(
            "unknown vault subcommand: {subcommand}. expected one of: set, has, del, ls"
        )),
    }
}

pub fn require_key_id(raw: Option<&str>) -> Result<CredentialSecretId, String> {
    let allowed = CredentialSecretId::allowed_key_names().join(", ");
    let raw = raw.ok_or_else(|| format!("missing key id. allowed: {allowed}"))?;
    parse_secret_id(raw).map_err(|_| format!("unknown key id '{raw}'. allowed: {allowed}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault() -> (tempfile::TempDir, SessionVault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = SessionVault::for_paths(
            dir.path().join("session_vault.json"),
            dir.path().join("session_vault.master.key"),
        );
        (dir, vault)
    }

    #[test]
    fn at_vault_cli_01_set_has_del_roundtrip() {
        let (_dir, vault) = temp_vault();
        assert_eq!(
            execute_vault_command(&vault, "set", Some("connect_access_token"), Some("tok-1"))
                .unwrap(),
            "OK"
        );
        assert_eq!(
            execute_vault_command(&vault, "has", Some("connect_access_token"), None).unwrap(),
            "YES"
        );
        assert_eq!(
            execute_vault_command(&vault, "ls", None, None).unwrap(),
            "connect_access_token"
        );
        assert_eq!(
            execute_vault_command(&vault, "del", Some("connect_access_token"), None).unwrap(),
            "OK"
        );
        assert_eq!(
            execute_vault_command(&vault, "del", Some("connect_access_token"), None).unwrap(),
            "ABSENT"
        );
        assert_eq!(
            execute_vault_command(&vault, "has", Some("connect_access_token"), None).unwrap(),
            "NO"
        );
    }

    #[test]
    fn at_vault_cli_02_output_never_contains_secret_value() {
        let (dir, vault) = temp_vault();
        let sentinel = "DO_NOT_LEAK_SENTINEL";
        let out =
            execute_vault_command(&vault, "set", Some("connect_login_email"), Some(sentinel))
                .unwrap();
        assert!(!out.contains(sentinel));
        let on_disk = std::fs::read_to_string(dir.path().join("session_vault.json")).unwrap();
        assert!(!on_disk.contains(sentinel));
    }

    #[test]
    fn at_vault_cli_03_unknown_key_and_subcommand_are_rejected() {
        let (_dir, vault) = temp_vault();
        let err = execute_vault_command(&vault, "has", Some("openai_api_key"), None).unwrap_err();
        assert!(err.contains("connect_access_token"));
        assert!(execute_vault_command(&vault, "has", None, None)
            .unwrap_err()
            .starts_with("missing key id"));
        assert!(execute_vault_command(&vault, "rotate", None, None).is_err());
    }
}
