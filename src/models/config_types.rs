use serde::{Deserialize, Serialize};

pub const DEFAULT_HUB_BASE_URL: &str = "https://huggingface.co/Xenova";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MobileNetVersion {
    V1,
    V2,
}

impl TryFrom<u8> for MobileNetVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MobileNetVersion::V1),
            2 => Ok(MobileNetVersion::V2),
            other => Err(format!("Unsupported MobileNet version: {}", other)),
        }
    }
}

impl From<MobileNetVersion> for u8 {
    fn from(version: MobileNetVersion) -> Self {
        match version {
            MobileNetVersion::V1 => 1,
            MobileNetVersion::V2 => 2,
        }
    }
}

/// Which pretrained MobileNet to fetch, and how to read its output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub version: MobileNetVersion,
    /// Width multiplier.
    pub alpha: f32,
    /// Input resolution; only consulted for checkpoints fetched from explicit URLs.
    pub input_size: Option<u32>,
    pub top_k: usize,
    pub hub_base_url: String,
    pub model_url: Option<String>,
    pub labels_url: Option<String>,
    pub use_gpu: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            version: MobileNetVersion::V2,
            alpha: 1.0,
            input_size: None,
            top_k: 3,
            hub_base_url: DEFAULT_HUB_BASE_URL.to_string(),
            model_url: None,
            labels_url: None,
            use_gpu: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
}
