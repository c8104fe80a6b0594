#![forbid(unsafe_code)]

/// Keys the session vault is allowed to hold.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSecretId {
    ConnectAccessToken,
    ConnectLoginEmail,
}

impl CredentialSecretId {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectAccessToken => "connect_access_token",
            Self::ConnectLoginEmail => "connect_login_email",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[Self::ConnectAccessToken, Self::ConnectLoginEmail]
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "connect_access_token" => Some(Self::ConnectAccessToken),
            "connect_login_email" => Some(Self::ConnectLoginEmail),
            _ => None,
        }
    }

    pub fn allowed_key_names() -> Vec<&'static str> {
        Self::all().iter().map(|id| id.as_str()).collect()
    }
}
