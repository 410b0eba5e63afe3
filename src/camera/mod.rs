//! Camera descriptors and the ordered camera registry.
//!
//! Descriptors are created once at startup from configuration. The only runtime
//! mutation is a credential refresh (or the reactive expiry flag set when a
//! credentialed stream fails).

mod credential;
mod registry;

pub use credential::{validate_token, Credential};
pub use registry::{CameraListing, CameraRegistry};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Placeholder substituted with the credential token when resolving a URL.
pub const TOKEN_PLACEHOLDER: &str = "{token}";

/// How frames are acquired from a camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Still image refetched on a fixed interval.
    PollingImage,
    /// Segmented/adaptive video stream (HLS and friends).
    AdaptiveStream,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::PollingImage => write!(f, "polling-image"),
            SourceKind::AdaptiveStream => write!(f, "adaptive-stream"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CameraSource {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    url_template: String,
    credential: Option<Credential>,
}

impl CameraSource {
    pub fn new(id: &str, name: &str, kind: SourceKind, url_template: &str) -> Result<Self> {
        if id.trim().is_empty() {
            return Err(anyhow!("camera id must not be empty"));
        }
        if name.trim().is_empty() {
            return Err(anyhow!("camera '{}' must have a display name", id));
        }
        // The template must parse once the placeholder is filled in.
        let probe = url_template.replace(TOKEN_PLACEHOLDER, "token");
        Url::parse(&probe).with_context(|| format!("camera '{}' has an invalid url", id))?;
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            url_template: url_template.to_string(),
            credential: None,
        })
    }

    /// Attach an initial credential. Templates without `{token}` cannot take one.
    pub fn with_credential(mut self, token: &str, expired: bool) -> Result<Self> {
        if !self.uses_token() {
            return Err(anyhow!(
                "camera '{}' url has no {} placeholder",
                self.id,
                TOKEN_PLACEHOLDER
            ));
        }
        self.credential = Some(Credential::new(token, expired)?);
        Ok(self)
    }

    pub fn uses_token(&self) -> bool {
        self.url_template.contains(TOKEN_PLACEHOLDER)
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn credential_expired(&self) -> bool {
        self.credential.as_ref().is_some_and(|c| c.is_expired())
    }

    pub fn url_template(&self) -> &str {
        &self.url_template
    }

    /// URL with the credential substituted. A missing credential leaves an
    /// empty token so the request fails upstream rather than leaking the
    /// placeholder.
    pub fn resolved_url(&self) -> String {
        if !self.uses_token() {
            return self.url_template.clone();
        }
        let token = self.credential.as_ref().map(|c| c.token()).unwrap_or("");
        self.url_template.replace(TOKEN_PLACEHOLDER, token)
    }

    pub(crate) fn refresh_credential(&mut self, token: &str) -> Result<()> {
        if !self.uses_token() {
            return Err(anyhow!(
                "camera '{}' does not take a credential token",
                self.id
            ));
        }
        match self.credential.as_mut() {
            Some(credential) => credential.refresh(token),
            None => {
                self.credential = Some(Credential::new(token, false)?);
                Ok(())
            }
        }
    }

    pub(crate) fn expire_credential(&mut self) -> bool {
        match self.credential.as_mut() {
            Some(credential) => {
                credential.mark_expired();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_token_placeholder() {
        let camera = CameraSource::new(
            "fl511-3732",
            "FL511 Camera 3732",
            SourceKind::AdaptiveStream,
            "https://dim-se12.example:8200/chan-3732/index.m3u8?token={token}",
        )
        .unwrap()
        .with_credential("abc123", false)
        .unwrap();
        assert_eq!(
            camera.resolved_url(),
            "https://dim-se12.example:8200/chan-3732/index.m3u8?token=abc123"
        );
    }

    #[test]
    fn rejects_credential_without_placeholder() {
        let camera = CameraSource::new(
            "still",
            "Still",
            SourceKind::PollingImage,
            "http://cams.example/api/camera-image/95-079",
        )
        .unwrap();
        assert!(camera.with_credential("abc", false).is_err());
    }

    #[test]
    fn rejects_bad_descriptors() {
        assert!(CameraSource::new("", "x", SourceKind::PollingImage, "stub://x").is_err());
        assert!(CameraSource::new("a", " ", SourceKind::PollingImage, "stub://x").is_err());
        assert!(CameraSource::new("a", "A", SourceKind::PollingImage, "not a url").is_err());
    }

    #[test]
    fn source_kind_uses_kebab_case() {
        let kind: SourceKind = serde_json::from_str("\"adaptive-stream\"").unwrap();
        assert_eq!(kind, SourceKind::AdaptiveStream);
        assert_eq!(SourceKind::PollingImage.to_string(), "polling-image");
    }
}
