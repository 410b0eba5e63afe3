use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::{CameraRegistry, CameraSource, SourceKind};
use crate::detect::DetectorSettings;
use crate::overlay::{OverlaySettings, DEFAULT_SURFACE_HEIGHT, DEFAULT_SURFACE_WIDTH};
use crate::process::{LabelRule, LabelTable, DEFAULT_CONFIDENCE_THRESHOLD};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DETECT_INTERVAL_MS: u64 = 2_000;
const DEFAULT_FRAME_RETRY_MS: u64 = 1_000;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_MAX_MEDIA_RECOVERIES: u32 = 3;
/// Upper bound for every configured period.
const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

#[derive(Deserialize, Default)]
struct CamwatchConfigFile {
    cameras: Option<Vec<CameraConfigFile>>,
    polling: Option<PollingConfigFile>,
    stream: Option<StreamConfigFile>,
    detection: Option<DetectionConfigFile>,
    overlay: Option<OverlayConfigFile>,
    counts: Option<CountsConfigFile>,
}

#[derive(Deserialize)]
struct CameraConfigFile {
    id: String,
    name: String,
    kind: SourceKind,
    url: String,
    token: Option<String>,
    #[serde(default)]
    token_expired: bool,
}

#[derive(Debug, Deserialize, Default)]
struct PollingConfigFile {
    interval_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    proxy_base: Option<String>,
    max_media_recoveries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    interval_ms: Option<u64>,
    frame_retry_ms: Option<u64>,
    confidence_threshold: Option<f32>,
    labels: Option<Vec<LabelRule>>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    detection_line: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CountsConfigFile {
    reset_on_camera_switch: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CamwatchConfig {
    pub cameras: Vec<CameraConfig>,
    pub polling: PollingSettings,
    pub stream: StreamSettings,
    pub detection: DetectionConfig,
    pub overlay: OverlaySettings,
    pub reset_on_camera_switch: bool,
}

#[derive(Clone)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
    pub token: Option<String>,
    pub token_expired: bool,
}

impl std::fmt::Debug for CameraConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("token_expired", &self.token_expired)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PollingSettings {
    pub interval: Duration,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub proxy_base: Option<String>,
    pub max_media_recoveries: u32,
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: (u32, u32),
    pub interval: Duration,
    pub frame_retry: Duration,
    pub confidence_threshold: f32,
    pub labels: Vec<LabelRule>,
}

impl DetectionConfig {
    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            model_path: self.model_path.clone(),
            input_size: self.input_size,
        }
    }

    pub fn label_table(&self) -> Result<LabelTable> {
        LabelTable::new(self.labels.clone())
    }
}

impl CamwatchConfig {
    /// Defaults, then the file named by `CAMWATCH_CONFIG`, then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamwatchConfigFile) -> Result<Self> {
        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .map(|camera| CameraConfig {
                    id: camera.id,
                    name: camera.name,
                    kind: camera.kind,
                    url: camera.url,
                    token: camera.token,
                    token_expired: camera.token_expired,
                })
                .collect(),
            None => default_cameras(),
        };
        let polling = PollingSettings {
            interval: Duration::from_secs(
                file.polling
                    .as_ref()
                    .and_then(|polling| polling.interval_secs)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            fetch_timeout: Duration::from_secs(
                file.polling
                    .as_ref()
                    .and_then(|polling| polling.fetch_timeout_secs)
                    .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
        };
        let stream = StreamSettings {
            proxy_base: file
                .stream
                .as_ref()
                .and_then(|stream| stream.proxy_base.clone()),
            max_media_recoveries: file
                .stream
                .as_ref()
                .and_then(|stream| stream.max_media_recoveries)
                .unwrap_or(DEFAULT_MAX_MEDIA_RECOVERIES),
        };
        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionConfig {
            backend: detection_file
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            model_path: detection_file.model_path,
            input_size: (
                detection_file.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                detection_file.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            ),
            interval: Duration::from_millis(
                detection_file
                    .interval_ms
                    .unwrap_or(DEFAULT_DETECT_INTERVAL_MS),
            ),
            frame_retry: Duration::from_millis(
                detection_file
                    .frame_retry_ms
                    .unwrap_or(DEFAULT_FRAME_RETRY_MS),
            ),
            confidence_threshold: detection_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            labels: detection_file
                .labels
                .unwrap_or_else(LabelTable::default_rules),
        };
        let overlay = OverlaySettings {
            width: file
                .overlay
                .as_ref()
                .and_then(|overlay| overlay.width)
                .unwrap_or(DEFAULT_SURFACE_WIDTH),
            height: file
                .overlay
                .as_ref()
                .and_then(|overlay| overlay.height)
                .unwrap_or(DEFAULT_SURFACE_HEIGHT),
            detection_line: file
                .overlay
                .and_then(|overlay| overlay.detection_line)
                .unwrap_or(true),
        };
        let reset_on_camera_switch = file
            .counts
            .and_then(|counts| counts.reset_on_camera_switch)
            .unwrap_or(false);
        Ok(Self {
            cameras,
            polling,
            stream,
            detection,
            overlay,
            reset_on_camera_switch,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(backend) = std::env::var("CAMWATCH_BACKEND") {
            if !backend.trim().is_empty() {
                self.detection.backend = backend.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("CAMWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detection.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(secs) = std::env::var("CAMWATCH_POLL_INTERVAL_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                anyhow!("CAMWATCH_POLL_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.polling.interval = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("CAMWATCH_DETECT_INTERVAL_SECS") {
            let secs: f64 = secs.trim().parse().map_err(|_| {
                anyhow!("CAMWATCH_DETECT_INTERVAL_SECS must be a number of seconds")
            })?;
            self.detection.interval = Duration::try_from_secs_f64(secs).map_err(|_| {
                anyhow!("CAMWATCH_DETECT_INTERVAL_SECS must be a finite, non-negative number")
            })?;
        }
        if let Ok(confidence) = std::env::var("CAMWATCH_CONFIDENCE") {
            self.detection.confidence_threshold = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMWATCH_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(proxy) = std::env::var("CAMWATCH_PROXY_BASE") {
            self.stream.proxy_base = if proxy.trim().is_empty() {
                None
            } else {
                Some(proxy.trim().to_string())
            };
        }
        if let Ok(reset) = std::env::var("CAMWATCH_RESET_ON_SWITCH") {
            self.reset_on_camera_switch = parse_bool(&reset)
                .ok_or_else(|| anyhow!("CAMWATCH_RESET_ON_SWITCH must be true or false"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        let mut ids = HashSet::new();
        for camera in &self.cameras {
            if !ids.insert(camera.id.as_str()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.id));
            }
        }
        if self.polling.interval.is_zero() {
            return Err(anyhow!("polling interval must be greater than zero"));
        }
        if self.polling.fetch_timeout.is_zero() {
            return Err(anyhow!("fetch timeout must be greater than zero"));
        }
        if self.detection.interval.is_zero() {
            return Err(anyhow!("detection interval must be greater than zero"));
        }
        if self.detection.frame_retry.is_zero() {
            return Err(anyhow!("frame retry delay must be greater than zero"));
        }
        for (what, value) in [
            ("polling interval", self.polling.interval),
            ("fetch timeout", self.polling.fetch_timeout),
            ("detection interval", self.detection.interval),
            ("frame retry delay", self.detection.frame_retry),
        ] {
            if value > MAX_INTERVAL {
                return Err(anyhow!(
                    "{} must be at most {}s, got {}s",
                    what,
                    MAX_INTERVAL.as_secs(),
                    value.as_secs()
                ));
            }
        }
        let threshold = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if self.overlay.width == 0 || self.overlay.height == 0 {
            return Err(anyhow!("overlay size must be non-zero"));
        }
        let (input_w, input_h) = self.detection.input_size;
        if input_w == 0 || input_h == 0 {
            return Err(anyhow!("model input size must be non-zero"));
        }
        // Normalizes keywords and rejects empty ones.
        self.detection.labels = self.detection.label_table()?.rules().to_vec();
        if let Some(proxy) = &self.stream.proxy_base {
            url::Url::parse(proxy).with_context(|| format!("invalid proxy base '{}'", proxy))?;
        }
        Ok(())
    }

    /// Camera registry with initial credentials applied.
    pub fn build_registry(&self) -> Result<CameraRegistry> {
        let cameras = self
            .cameras
            .iter()
            .map(|camera| {
                let source = CameraSource::new(&camera.id, &camera.name, camera.kind, &camera.url)?;
                match &camera.token {
                    Some(token) => source.with_credential(token, camera.token_expired),
                    None => Ok(source),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        CameraRegistry::new(cameras)
    }
}

fn default_cameras() -> Vec<CameraConfig> {
    vec![
        CameraConfig {
            id: "demo-still".to_string(),
            name: "Demo Still Camera".to_string(),
            kind: SourceKind::PollingImage,
            url: "stub://demo/still".to_string(),
            token: None,
            token_expired: false,
        },
        CameraConfig {
            id: "demo-stream".to_string(),
            name: "Demo Stream Camera".to_string(),
            kind: SourceKind::AdaptiveStream,
            url: "stub://demo/stream".to_string(),
            token: None,
            token_expired: false,
        },
    ]
}

fn read_config_file(path: &Path) -> Result<CamwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
