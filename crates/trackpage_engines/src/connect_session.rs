#![forbid(unsafe_code)]

use std::env;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use trackpage_contracts::credential_secrets::CredentialSecretId;
use url::Url;

use crate::activity_source::SourceError;
use crate::connect_client::{source_error_from_ureq, ConnectClient, ConnectHttpConfig};
use crate::credentials::{CredentialError, CredentialProvider};
use crate::session_vault::{SessionVault, VaultError};

#[derive(Debug)]
pub enum SessionError {
    /// No stored token works and no login endpoint is configured.
    LoginUnavailable,
    Rejected { http_status: u16 },
    Credentials(CredentialError),
    Source(SourceError),
    Vault(VaultError),
    Protocol(String),
    Config(url::ParseError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoginUnavailable => write!(
                f,
                "no valid session token and TRACKPAGE_CONNECT_LOGIN_URL is not set"
            ),
            Self::Rejected { http_status } => {
                write!(f, "login rejected (http status {http_status})")
            }
            Self::Credentials(err) => write!(f, "{err}"),
            Self::Source(err) => write!(f, "session check failed: {err}"),
            Self::Vault(err) => write!(f, "session vault: {err}"),
            Self::Protocol(msg) => write!(f, "unexpected login reply: {msg}"),
            Self::Config(err) => write!(f, "invalid connect url: {err}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CredentialError> for SessionError {
    fn from(value: CredentialError) -> Self {
        Self::Credentials(value)
    }
}

impl From<SourceError> for SessionError {
    fn from(value: SourceError) -> Self {
        Self::Source(value)
    }
}

impl From<VaultError> for SessionError {
    fn from(value: VaultError) -> Self {
        Self::Vault(value)
    }
}

impl From<url::ParseError> for SessionError {
    fn from(value: url::ParseError) -> Self {
        Self::Config(value)
    }
}

#[derive(Debug, Serialize)]
struct PasswordLoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct MfaLoginRequest<'a> {
    mfa_ticket: &'a str,
    code: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct LoginReply {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub mfa_required: bool,
    #[serde(default)]
    pub mfa_ticket: Option<String>,
}

/// Resolves an authenticated [`ConnectClient`] at startup.
///
/// Order: explicit token from the environment, token stored in the vault, then a
/// credential login against the login broker (with one MFA round when asked). A
/// stored token the service rejects is dropped from the vault.
#[derive(Debug, Clone)]
pub struct ConnectSessionBroker {
    http: ConnectHttpConfig,
    login_url: Option<Url>,
    env_token: Option<String>,
    vault: SessionVault,
}

impl ConnectSessionBroker {
    pub fn new(
        http: ConnectHttpConfig,
        login_url: Option<Url>,
        env_token: Option<String>,
        vault: SessionVault,
    ) -> Self {
        Self {
            http,
            login_url,
            env_token,
            vault,
        }
    }

    pub fn from_env(vault: SessionVault) -> Result<Self, SessionError> {
        let http = ConnectHttpConfig::from_env()?;
        let login_url = match non_empty_env("TRACKPAGE_CONNECT_LOGIN_URL") {
            Some(raw) => Some(Url::parse(&raw)?),
            None => None,
        };
        Ok(Self::new(
            http,
            login_url,
            non_empty_env("TRACKPAGE_CONNECT_TOKEN"),
            vault,
        ))
    }

    pub fn establish(
        &self,
        credentials: &dyn CredentialProvider,
    ) -> Result<ConnectClient, SessionError> {
        if let Some(token) = self.env_token.as_ref() {
            match self.try_token(token)? {
                Some(client) => {
                    info!("using session token from environment");
                    return Ok(client);
                }
                None => warn!("session token from environment was rejected"),
            }
        }

        if let Some(token) = self.vault.resolve_secret(CredentialSecretId::ConnectAccessToken)? {
            match self.try_token(&token)? {
                Some(client) => {
                    info!(vault = %self.vault.vault_path().display(), "using stored session token");
                    return Ok(client);
                }
                None => {
                    warn!("stored session token was rejected, discarding it");
                    self.vault
                        .delete_secret(CredentialSecretId::ConnectAccessToken)?;
                }
            }
        }

        let token = self.login(credentials)?;
        Ok(ConnectClient::new(self.http.clone(), token))
    }

    /// `Ok(None)` when the service rejects the token; other failures propagate.
    fn try_token(&self, token: &str) -> Result<Option<ConnectClient>, SessionError> {
        let client = ConnectClient::new(self.http.clone(), token.to_string());
        match client.verify_session() {
            Ok(()) => Ok(Some(client)),
            Err(err) if err.is_auth() => Ok(None),
            Err(err) => Err(SessionError::Source(err)),
        }
    }

    fn login(&self, credentials: &dyn CredentialProvider) -> Result<String, SessionError> {
        let login_url = self.login_url.as_ref().ok_or(SessionError::LoginUnavailable)?;
        let creds = credentials.obtain_credentials()?;
        let agent = self.http.build_agent();

        let first = post_login(
            &agent,
            login_url,
            &PasswordLoginRequest {
                email: &creds.email,
                password: &creds.password,
            },
        )?;
        let token = match first {
            LoginReply {
                access_token: Some(token),
                ..
            } => token,
            LoginReply {
                mfa_required: true,
                mfa_ticket: Some(ticket),
                ..
            } => {
                let code = credentials.obtain_mfa_code()?;
                let second = post_login(
                    &agent,
                    login_url,
                    &MfaLoginRequest {
                        mfa_ticket: &ticket,
                        code: code.trim(),
                    },
                )?;
                second.access_token.ok_or_else(|| {
                    SessionError::Protocol("mfa reply carried no access_token".to_string())
                })?
            }
            _ => {
                return Err(SessionError::Protocol(
                    "reply carried neither access_token nor an mfa challenge".to_string(),
                ))
            }
        };

        if token.trim().is_empty() {
            return Err(SessionError::Protocol("empty access_token".to_string()));
        }
        // Persist failure only warns; the next start logs in again.
        if let Err(err) = self
            .vault
            .set_secret(CredentialSecretId::ConnectAccessToken, &token)
            .and_then(|_| {
                self.vault
                    .set_secret(CredentialSecretId::ConnectLoginEmail, &creds.email)
            })
        {
            warn!("could not persist session token: {err}");
        }
        info!("logged in, session token stored");
        Ok(token)
    }
}

fn post_login<T: Serialize>(
    agent: &ureq::Agent,
    login_url: &Url,
    body: &T,
) -> Result<LoginReply, SessionError> {
    let payload = serde_json::to_value(body)
        .map_err(|e| SessionError::Protocol(format!("login payload encode failed: {e}")))?;
    let resp = match agent
        .post(login_url.as_str())
        .set("accept", "application/json")
        .send_json(payload)
    {
        Ok(resp) => resp,
        Err(ureq::Error::Status(code, _)) if code == 401 || code == 403 => {
            return Err(SessionError::Rejected { http_status: code })
        }
        Err(err) => return Err(SessionError::Source(source_error_from_ureq(err))),
    };
    let raw = resp
        .into_string()
        .map_err(|e| SessionError::Source(SourceError::transport("read_body", e.to_string())))?;
    parse_login_reply(&raw)
}

pub fn parse_login_reply(raw: &str) -> Result<LoginReply, SessionError> {
    serde_json::from_str::<LoginReply>(raw)
        .map_err(|e| SessionError::Protocol(format!("login reply is not valid json: {e}")))
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
