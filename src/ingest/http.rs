use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::synthetic_image;
use crate::camera::{CameraRegistry, SourceKind};
use crate::task::Pending;

/// Upper bound on a still image response.
const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024;

const SYNTHETIC_WIDTH: u32 = 640;
const SYNTHETIC_HEIGHT: u32 = 400;

/// Fetches and decodes still images without blocking the caller.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Pending<RgbImage>;
}

/// `ureq`-backed fetcher. `stub://` URLs produce synthetic frames in place;
/// `stub://fail...` URLs always fail.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl ImageFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Pending<RgbImage> {
        if let Some(rest) = url.strip_prefix("stub://") {
            return Pending::ready(synthetic_fetch(rest));
        }
        let agent = self.agent.clone();
        let url = url.to_string();
        Pending::spawn("image-fetch", move || fetch_image(&agent, &url))
    }
}

fn synthetic_fetch(rest: &str) -> Result<RgbImage> {
    if rest.starts_with("fail") {
        return Err(anyhow!("synthetic fetch failure for stub://{}", rest));
    }
    // The cache-bust suffix makes every request distinct.
    let digest = Sha256::digest(rest.as_bytes());
    let seed = u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    Ok(synthetic_image(SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT, seed))
}

fn fetch_image(agent: &ureq::Agent, url: &str) -> Result<RgbImage> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch still image from {}", redact_query(url)))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_IMAGE_BYTES)
        .read_to_end(&mut bytes)
        .context("read still image body")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty image response"));
    }
    let image = image::load_from_memory(&bytes).context("decode still image")?;
    Ok(image.into_rgb8())
}

/// HEAD the URL and return the HTTP status. Error statuses are returned as
/// values; only transport failures are errors.
pub fn probe_url(url: &str, timeout: Duration) -> Result<u16> {
    if let Some(rest) = url.strip_prefix("stub://") {
        return Ok(if rest.starts_with("fail") { 403 } else { 200 });
    }
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    match agent.head(url).call() {
        Ok(response) => Ok(response.status()),
        Err(ureq::Error::Status(code, _)) => Ok(code),
        Err(e) => Err(anyhow!(e)).with_context(|| format!("probe {}", redact_query(url))),
    }
}

/// Outcome of probing one credentialed stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CredentialProbe {
    pub camera_id: String,
    pub name: String,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl CredentialProbe {
    pub fn works(&self) -> bool {
        matches!(self.status, Some(200..=399))
    }
}

/// HEAD every token-taking stream with its current credential.
pub fn probe_credentials(registry: &CameraRegistry, timeout: Duration) -> Vec<CredentialProbe> {
    registry
        .cameras()
        .iter()
        .filter(|camera| camera.kind == SourceKind::AdaptiveStream && camera.uses_token())
        .map(|camera| {
            let (status, error) = match probe_url(&camera.resolved_url(), timeout) {
                Ok(code) => (Some(code), None),
                Err(e) => (None, Some(format!("{:#}", e))),
            };
            log::debug!("credential probe {}: {:?}", camera.id, status);
            CredentialProbe {
                camera_id: camera.id.clone(),
                name: camera.name.clone(),
                status,
                error,
            }
        })
        .collect()
}

/// Query strings can carry tokens; keep them out of logs and errors.
pub(crate) fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
