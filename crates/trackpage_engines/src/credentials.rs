#![forbid(unsafe_code)]

use std::env;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    Unavailable(&'static str),
    Input(String),
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(what) => write!(f, "{what} not available"),
            Self::Input(msg) => write!(f, "credential input failed: {msg}"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Source of login material for the remote service. Kept apart from the sync engine,
/// which only ever sees an authenticated activity source.
pub trait CredentialProvider {
    fn obtain_credentials(&self) -> Result<Credentials, CredentialError>;
    fn obtain_mfa_code(&self) -> Result<String, CredentialError>;
}

/// Reads `TRACKPAGE_EMAIL`/`TRACKPAGE_PASSWORD`, falling back to `EMAIL`/`PASSWORD`.
/// Never answers MFA challenges.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn obtain_credentials(&self) -> Result<Credentials, CredentialError> {
        let email = first_non_empty_env(&["TRACKPAGE_EMAIL", "EMAIL"])
            .ok_or(CredentialError::Unavailable("login email"))?;
        let password = first_non_empty_env(&["TRACKPAGE_PASSWORD", "PASSWORD"])
            .ok_or(CredentialError::Unavailable("login password"))?;
        Ok(Credentials { email, password })
    }

    fn obtain_mfa_code(&self) -> Result<String, CredentialError> {
        Err(CredentialError::Unavailable("mfa code"))
    }
}

fn first_non_empty_env(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Asks each provider in turn; the first success wins. Only `Unavailable` falls
/// through, an input error from an interactive provider is returned as is.
pub struct ChainedCredentialProvider {
    providers: Vec<Box<dyn CredentialProvider + Send + Sync>>,
}

impl ChainedCredentialProvider {
    pub fn new(providers: Vec<Box<dyn CredentialProvider + Send + Sync>>) -> Self {
        Self { providers }
    }
}

impl CredentialProvider for ChainedCredentialProvider {
    fn obtain_credentials(&self) -> Result<Credentials, CredentialError> {
        let mut last = CredentialError::Unavailable("login credentials");
        for provider in &self.providers {
            match provider.obtain_credentials() {
                Ok(creds) => return Ok(creds),
                Err(err @ CredentialError::Unavailable(_)) => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    fn obtain_mfa_code(&self) -> Result<String, CredentialError> {
        let mut last = CredentialError::Unavailable("mfa code");
        for provider in &self.providers {
            match provider.obtain_mfa_code() {
                Ok(code) => return Ok(code),
                Err(err @ CredentialError::Unavailable(_)) => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }
}

/// Fixed answers, for tests and for non-interactive deployments that inject secrets.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    pub credentials: Option<Credentials>,
    pub mfa_code: Option<String>,
}

impl CredentialProvider for StaticCredentialProvider {
    fn obtain_credentials(&self) -> Result<Credentials, CredentialError> {
        self.credentials
            .clone()
            .ok_or(CredentialError::Unavailable("login credentials"))
    }

    fn obtain_mfa_code(&self) -> Result<String, CredentialError> {
        self.mfa_code
            .clone()
            .ok_or(CredentialError::Unavailable("mfa code"))
    }
}
