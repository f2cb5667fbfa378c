//! Bearer token decoding.
//!
//! Tokens are issued by an external service and are opaque to the rest of
//! the gateway: a URL-safe base64 JSON document naming the account, the
//! workspace, and optional role extras. Signature verification happens at
//! the issuer boundary; here we only decode and shape-check.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid base64 token: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("invalid token payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("token issued for product {got}, this gateway serves {expected}")]
    WrongProduct { expected: String, got: String },
}

/// Workspace identity as carried inside a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceId {
    pub name: String,
    pub product_id: String,
    #[serde(default)]
    pub url: String,
}

impl WorkspaceId {
    /// Canonical registry key for this workspace. The url is preferred
    /// when the issuer set one; otherwise the name disambiguated by
    /// product.
    pub fn key(&self) -> String {
        if self.url.is_empty() {
            format!("{}/{}", self.product_id, self.name).to_lowercase()
        } else {
            self.url.to_lowercase()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenExtra {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub account_email: String,
    pub workspace: WorkspaceId,
    #[serde(default)]
    pub extra: TokenExtra,
}

impl TokenClaims {
    pub fn is_admin(&self) -> bool {
        self.extra.admin
    }

    /// Sessions carrying the upgrade role may attach while their
    /// workspace is mid-upgrade and are excluded from broadcasts.
    pub fn is_upgrade_role(&self) -> bool {
        self.extra.role.as_deref() == Some("upgrade")
    }

    /// Backup agents attach read-only and mark the workspace as having a
    /// backup in progress.
    pub fn is_backup_role(&self) -> bool {
        self.extra.role.as_deref() == Some("backup")
    }
}

pub fn decode_token(token: &str, expected_product: &str) -> Result<TokenClaims, TokenError> {
    let bytes = URL_SAFE_NO_PAD.decode(token)?;
    let claims: TokenClaims = serde_json::from_slice(&bytes)?;
    if claims.workspace.product_id != expected_product {
        return Err(TokenError::WrongProduct {
            expected: expected_product.to_string(),
            got: claims.workspace.product_id,
        });
    }
    Ok(claims)
}

/// Encode claims into the wire form. The gateway only needs this for
/// tests and local tooling; production tokens come from the issuer.
pub fn encode_token(claims: &TokenClaims) -> String {
    let json = serde_json::to_vec(claims).expect("token claims serialise");
    URL_SAFE_NO_PAD.encode(json)
}
