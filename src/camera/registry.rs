use std::collections::HashSet;

use anyhow::{anyhow, Result};
use serde::Serialize;

use super::{CameraSource, SourceKind};

/// One entry of the camera selection list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CameraListing {
    pub id: String,
    pub display_name: String,
    pub kind: SourceKind,
    pub credential_expired: bool,
}

/// Ordered camera list plus the current selection.
///
/// Failure bookkeeping lives here so the pipeline can advance past cameras whose
/// streams died without looping forever.
#[derive(Debug)]
pub struct CameraRegistry {
    cameras: Vec<CameraSource>,
    selected: usize,
    failed: HashSet<usize>,
}

impl CameraRegistry {
    pub fn new(cameras: Vec<CameraSource>) -> Result<Self> {
        if cameras.is_empty() {
            return Err(anyhow!("camera registry requires at least one camera"));
        }
        let mut seen = HashSet::new();
        for camera in &cameras {
            if !seen.insert(camera.id.as_str()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.id));
            }
        }
        Ok(Self {
            cameras,
            selected: 0,
            failed: HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn cameras(&self) -> &[CameraSource] {
        &self.cameras
    }

    pub fn listing(&self) -> Vec<CameraListing> {
        self.cameras
            .iter()
            .map(|camera| CameraListing {
                id: camera.id.clone(),
                display_name: camera.name.clone(),
                kind: camera.kind,
                credential_expired: camera.credential_expired(),
            })
            .collect()
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected(&self) -> &CameraSource {
        &self.cameras[self.selected]
    }

    pub fn get(&self, index: usize) -> Option<&CameraSource> {
        self.cameras.get(index)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.cameras.iter().position(|camera| camera.id == id)
    }

    /// Manual selection. Clears failure history.
    pub fn select(&mut self, index: usize) -> Result<&CameraSource> {
        self.select_index(index)?;
        self.failed.clear();
        Ok(&self.cameras[index])
    }

    /// Selection made while advancing past a failed camera.
    pub(crate) fn advance_to(&mut self, index: usize) -> Result<&CameraSource> {
        self.select_index(index)?;
        Ok(&self.cameras[index])
    }

    fn select_index(&mut self, index: usize) -> Result<()> {
        if index >= self.cameras.len() {
            return Err(anyhow!(
                "camera index {} out of range (have {})",
                index,
                self.cameras.len()
            ));
        }
        self.selected = index;
        Ok(())
    }

    pub fn mark_failed(&mut self, index: usize) {
        self.failed.insert(index);
    }

    /// First camera after the current one (wrapping) that has not failed.
    pub fn next_candidate(&self) -> Option<usize> {
        let len = self.cameras.len();
        (1..=len)
            .map(|offset| (self.selected + offset) % len)
            .find(|index| !self.failed.contains(index))
    }

    /// Apply a replacement token. Returns the camera's index.
    pub fn update_credential(&mut self, id: &str, token: &str) -> Result<usize> {
        let index = self
            .index_of(id)
            .ok_or_else(|| anyhow!("unknown camera id '{}'", id))?;
        self.cameras[index].refresh_credential(token)?;
        log::info!(
            "credential updated for camera {} (fingerprint {})",
            id,
            self.cameras[index]
                .credential()
                .map(|c| c.fingerprint())
                .unwrap_or_default()
        );
        Ok(index)
    }

    /// Flag a credential as expired after its stream failed. Returns false when
    /// the camera has no credential.
    pub fn mark_credential_expired(&mut self, index: usize) -> bool {
        self.cameras
            .get_mut(index)
            .is_some_and(|camera| camera.expire_credential())
    }

    /// Pair comma-separated tokens, in order, with the adaptive-stream cameras
    /// that take a token.
    pub fn positional_credentials(&self, input: &str) -> Vec<(String, String)> {
        let tokens = input
            .split(',')
            .map(|token| token.trim())
            .filter(|token| !token.is_empty());
        self.cameras
            .iter()
            .filter(|camera| camera.kind == SourceKind::AdaptiveStream && camera.uses_token())
            .zip(tokens)
            .map(|(camera, token)| (camera.id.clone(), token.to_string()))
            .collect()
    }
}
