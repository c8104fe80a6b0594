#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use trackpage_contracts::credential_secrets::CredentialSecretId;

const VAULT_FORMAT: u8 = 1;
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

#[derive(Debug)]
pub enum VaultError {
    UnknownKeyId(String),
    EmptySecret,
    UnsupportedFormat(u8),
    Io { path: PathBuf, source: std::io::Error },
    Corrupt(String),
    /// Authentication tag mismatch: wrong master key, tampering, or an entry moved
    /// under another key id.
    Sealing,
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownKeyId(key) => write!(f, "unknown key id: {key}"),
            Self::EmptySecret => write!(f, "secret value must not be empty"),
            Self::UnsupportedFormat(v) => write!(f, "unsupported vault format {v}"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Corrupt(msg) => write!(f, "vault file is corrupt: {msg}"),
            Self::Sealing => write!(f, "vault entry failed authentication"),
        }
    }
}

impl std::error::Error for VaultError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> VaultError + '_ {
    move |source| VaultError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// On-disk layout. Each value is base64 of `nonce || ciphertext`, sealed with the key
/// id as associated data.
#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultFile {
    format: u8,
    secrets: BTreeMap<CredentialSecretId, String>,
}

struct MasterKey(Aes256Gcm);

impl MasterKey {
    fn load_or_create(path: &Path) -> Result<Self, VaultError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => BASE64
                .decode(raw.trim())
                .map_err(|e| VaultError::Corrupt(format!("master key: {e}")))?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let mut fresh = vec![0u8; KEY_BYTES];
                OsRng.fill_bytes(&mut fresh);
                create_owner_only(path, BASE64.encode(&fresh).as_bytes())?;
                fresh
            }
            Err(err) => return Err(io_at(path)(err)),
        };
        Aes256Gcm::new_from_slice(&raw)
            .map(Self)
            .map_err(|_| VaultError::Corrupt("master key has the wrong length".to_string()))
    }

    fn seal(&self, key_id: CredentialSecretId, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .0
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: key_id.as_str().as_bytes(),
                },
            )
            .map_err(|_| VaultError::Sealing)?;
        let mut packed = nonce.to_vec();
        packed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(packed))
    }

    fn open(&self, key_id: CredentialSecretId, sealed: &str) -> Result<String, VaultError> {
        let packed = BASE64
            .decode(sealed)
            .map_err(|e| VaultError::Corrupt(format!("{}: {e}", key_id.as_str())))?;
        if packed.len() <= NONCE_BYTES {
            return Err(VaultError::Corrupt(format!("{}: entry too short", key_id.as_str())));
        }
        let (nonce, ciphertext) = packed.split_at(NONCE_BYTES);
        let plaintext = self
            .0
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key_id.as_str().as_bytes(),
                },
            )
            .map_err(|_| VaultError::Sealing)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Sealing)
    }
}

/// Encrypted store for the Connect session, so a restart reuses the token instead of
/// logging in again. The AES-256-GCM master key sits in a separate owner-only file.
#[derive(Debug, Clone)]
pub struct SessionVault {
    vault_path: PathBuf,
    key_path: PathBuf,
}

impl SessionVault {
    /// `TRACKPAGE_VAULT_PATH`, else the per-user config dir.
    pub fn default_local() -> Self {
        let vault_path = env::var("TRACKPAGE_VAULT_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_vault_path);
        let key_path = vault_path.with_extension("master.key");
        Self::for_paths(vault_path, key_path)
    }

    pub fn for_paths(vault_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            vault_path,
            key_path,
        }
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }

    pub fn set_secret(&self, key_id: CredentialSecretId, value: &str) -> Result<(), VaultError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(VaultError::EmptySecret);
        }
        self.ensure_dirs()?;
        let sealed = MasterKey::load_or_create(&self.key_path)?.seal(key_id, value)?;
        let mut file = self.load()?;
        file.secrets.insert(key_id, sealed);
        self.store(&file)
    }

    pub fn resolve_secret(&self, key_id: CredentialSecretId) -> Result<Option<String>, VaultError> {
        let file = self.load()?;
        let Some(sealed) = file.secrets.get(&key_id) else {
            return Ok(None);
        };
        let key = MasterKey::load_or_create(&self.key_path)?;
        key.open(key_id, sealed).map(Some)
    }

    /// Returns whether an entry was removed.
    pub fn delete_secret(&self, key_id: CredentialSecretId) -> Result<bool, VaultError> {
        let mut file = self.load()?;
        if file.secrets.remove(&key_id).is_none() {
            return Ok(false);
        }
        self.store(&file)?;
        Ok(true)
    }

    /// Key ids with a stored entry, without decrypting anything.
    pub fn stored_secret_ids(&self) -> Result<Vec<CredentialSecretId>, VaultError> {
        Ok(self.load()?.secrets.into_keys().collect())
    }

    fn ensure_dirs(&self) -> Result<(), VaultError> {
        for path in [&self.vault_path, &self.key_path] {
            if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(dir).map_err(io_at(dir))?;
            }
        }
        Ok(())
    }

    fn load(&self) -> Result<VaultFile, VaultError> {
        let raw = match fs::read_to_string(&self.vault_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(VaultFile {
                    format: VAULT_FORMAT,
                    ..VaultFile::default()
                })
            }
            Err(err) => return Err(io_at(&self.vault_path)(err)),
        };
        let file: VaultFile =
            serde_json::from_str(&raw).map_err(|e| VaultError::Corrupt(e.to_string()))?;
        if file.format != VAULT_FORMAT {
            return Err(VaultError::UnsupportedFormat(file.format));
        }
        Ok(file)
    }

    fn store(&self, file: &VaultFile) -> Result<(), VaultError> {
        self.ensure_dirs()?;
        let body = serde_json::to_vec_pretty(file).map_err(|e| VaultError::Corrupt(e.to_string()))?;
        let tmp = self.vault_path.with_extension("json.tmp");
        let mut out = File::create(&tmp).map_err(io_at(&tmp))?;
        out.write_all(&body)
            .and_then(|_| out.sync_all())
            .map_err(io_at(&tmp))?;
        fs::rename(&tmp, &self.vault_path).map_err(io_at(&self.vault_path))
    }
}

pub fn parse_secret_id(raw: &str) -> Result<CredentialSecretId, VaultError> {
    CredentialSecretId::parse(raw).ok_or_else(|| VaultError::UnknownKeyId(raw.to_string()))
}

fn default_vault_path() -> PathBuf {
    let config_root = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    config_root.join("trackpage").join("session_vault.json")
}

fn create_owner_only(path: &Path, data: &[u8]) -> Result<(), VaultError> {
    let mut options = OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(io_at(path))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(io_at(path))
}
