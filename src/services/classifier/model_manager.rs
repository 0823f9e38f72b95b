use crate::error::AppError;
use crate::models::classify_types::Prediction;
use crate::models::config_types::{MobileNetVersion, ModelConfig};
use crate::services::classifier::inference;
use crate::services::classifier::{ImageClassifier, ModelLoader};
use futures::future::BoxFuture;
use futures::StreamExt;
use image::DynamicImage;
use ort::session::Session;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Input size assumed for checkpoints fetched from explicit URLs.
pub const DEFAULT_INPUT_SIZE: u32 = 224;

/// One concrete MobileNet checkpoint: architecture, width and input resolution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Checkpoint {
    pub version: MobileNetVersion,
    pub alpha: f32,
    pub input_size: u32,
}

impl Checkpoint {
    const fn new(version: MobileNetVersion, alpha: f32, input_size: u32) -> Self {
        Self {
            version,
            alpha,
            input_size,
        }
    }

    /// Hub name, e.g. `mobilenet_v2_1.0_224`.
    pub fn name(&self) -> String {
        format!(
            "mobilenet_v{}_{}_{}",
            u8::from(self.version),
            format_alpha(self.alpha),
            self.input_size
        )
    }
}

/// The checkpoints the hub actually publishes. Each (version, alpha) pair
/// exists at exactly one resolution.
pub const PUBLISHED_CHECKPOINTS: &[Checkpoint] = &[
    Checkpoint::new(MobileNetVersion::V1, 1.0, 224),
    Checkpoint::new(MobileNetVersion::V1, 0.75, 192),
    Checkpoint::new(MobileNetVersion::V2, 1.4, 224),
    Checkpoint::new(MobileNetVersion::V2, 1.0, 224),
    Checkpoint::new(MobileNetVersion::V2, 0.75, 160),
    Checkpoint::new(MobileNetVersion::V2, 0.35, 96),
];

/// `1.0` stays `1.0`, `0.75` stays `0.75`, matching hub checkpoint names.
fn format_alpha(alpha: f32) -> String {
    if alpha.fract() == 0.0 {
        format!("{:.1}", alpha)
    } else {
        format!("{}", alpha)
    }
}

fn published(version: MobileNetVersion, alpha: f32) -> Option<Checkpoint> {
    PUBLISHED_CHECKPOINTS
        .iter()
        .copied()
        .find(|c| c.version == version && (c.alpha - alpha).abs() < f32::EPSILON)
}

/// Picks the checkpoint a config asks for and rejects configs that cannot
/// produce predictions.
///
/// Pairs the hub does not publish are only accepted when both `model_url`
/// and `labels_url` point somewhere else.
pub fn resolve_checkpoint(config: &ModelConfig) -> Result<Checkpoint, AppError> {
    if config.top_k == 0 {
        return Err(AppError::model_load("top_k must be at least 1"));
    }

    if let Some(checkpoint) = published(config.version, config.alpha) {
        return match config.input_size {
            Some(size) if size != checkpoint.input_size => Err(AppError::model_load(format!(
                "{} is published at {}px, not {}px",
                checkpoint.name(),
                checkpoint.input_size,
                size
            ))),
            _ => Ok(checkpoint),
        };
    }

    if config.model_url.is_some() && config.labels_url.is_some() {
        if config.alpha <= 0.0 {
            return Err(AppError::model_load(format!(
                "Invalid alpha {}",
                config.alpha
            )));
        }
        return Ok(Checkpoint::new(
            config.version,
            config.alpha,
            config.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
        ));
    }

    let available: Vec<String> = PUBLISHED_CHECKPOINTS.iter().map(|c| c.name()).collect();
    Err(AppError::model_load(format!(
        "No published checkpoint for MobileNet v{} alpha {}; set model_url and labels_url or pick one of {}",
        u8::from(config.version),
        config.alpha,
        available.join(", ")
    )))
}

pub fn model_url(config: &ModelConfig, checkpoint: &Checkpoint) -> String {
    config.model_url.clone().unwrap_or_else(|| {
        format!(
            "{}/{}/resolve/main/onnx/model.onnx",
            config.hub_base_url.trim_end_matches('/'),
            checkpoint.name()
        )
    })
}

pub fn labels_url(config: &ModelConfig, checkpoint: &Checkpoint) -> String {
    config.labels_url.clone().unwrap_or_else(|| {
        format!(
            "{}/{}/resolve/main/config.json",
            config.hub_base_url.trim_end_matches('/'),
            checkpoint.name()
        )
    })
}

/// Reads the `id2label` map of a hub `config.json` into index order.
pub fn parse_labels(content: &str) -> Result<Vec<String>, AppError> {
    let config: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| AppError::model_load(format!("Failed to parse label config: {}", e)))?;

    let id2label = config["id2label"]
        .as_object()
        .ok_or_else(|| AppError::model_load("Label config missing id2label field"))?;

    let mut labels: Vec<(usize, String)> = Vec::with_capacity(id2label.len());
    for (k, v) in id2label {
        let idx = k
            .parse::<usize>()
            .map_err(|_| AppError::model_load(format!("Invalid label index: {}", k)))?;
        let label = v.as_str().unwrap_or("unknown").to_string();
        labels.push((idx, label));
    }
    labels.sort_by_key(|(idx, _)| *idx);

    Ok(labels.into_iter().map(|(_, label)| label).collect())
}

pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Downloads, caches and opens MobileNet checkpoints.
#[derive(Clone)]
pub struct ModelManager {
    pub model_dir: PathBuf,
    on_progress: Option<ProgressFn>,
}

impl ModelManager {
    pub fn new(app_data_dir: PathBuf) -> Self {
        Self {
            model_dir: app_data_dir.join("models"),
            on_progress: None,
        }
    }

    /// Called with the download percentage (0-100) while weights are fetched.
    pub fn with_progress(mut self, on_progress: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    pub fn model_path(&self, checkpoint: &Checkpoint) -> PathBuf {
        self.model_dir.join(format!("{}.onnx", checkpoint.name()))
    }

    pub fn labels_path(&self, checkpoint: &Checkpoint) -> PathBuf {
        self.model_dir
            .join(format!("{}-config.json", checkpoint.name()))
    }

    pub fn is_downloaded(&self, checkpoint: &Checkpoint) -> bool {
        self.model_path(checkpoint).exists() && self.labels_path(checkpoint).exists()
    }

    /// Fetches weights and labels unless both are already cached.
    pub async fn download_model(&self, config: &ModelConfig) -> Result<Checkpoint, AppError> {
        let checkpoint = resolve_checkpoint(config)?;
        if self.is_downloaded(&checkpoint) {
            return Ok(checkpoint);
        }

        tokio::fs::create_dir_all(&self.model_dir).await.map_err(|e| {
            AppError::model_load(format!("Failed to create model directory: {}", e))
        })?;

        let labels_path = self.labels_path(&checkpoint);
        if !labels_path.exists() {
            download_file(&labels_url(config, &checkpoint), &labels_path, None).await?;
        }

        let model_path = self.model_path(&checkpoint);
        if !model_path.exists() {
            log::info!("Downloading {} weights", checkpoint.name());
            download_file(
                &model_url(config, &checkpoint),
                &model_path,
                self.on_progress.as_ref(),
            )
            .await?;
        }

        Ok(checkpoint)
    }

    pub async fn load_model(&self, config: &ModelConfig) -> Result<MobileNet, AppError> {
        let checkpoint = self.download_model(config).await?;

        let labels_path = self.labels_path(&checkpoint);
        let content = tokio::fs::read_to_string(&labels_path).await.map_err(|e| {
            AppError::model_load(format!(
                "Failed to read label config {}: {}",
                labels_path.display(),
                e
            ))
        })?;
        let labels = parse_labels(&content)?;

        let model_path = self.model_path(&checkpoint);
        let use_gpu = config.use_gpu;
        let session = tokio::task::spawn_blocking(move || open_session(&model_path, use_gpu))
            .await
            .map_err(|e| {
                AppError::model_load(format!("Failed to spawn model loading task: {}", e))
            })??;

        log::info!("Loaded {} ({} labels)", checkpoint.name(), labels.len());

        Ok(MobileNet {
            session,
            labels,
            input_size: checkpoint.input_size,
            top_k: config.top_k,
        })
    }
}

impl ModelLoader for ModelManager {
    type Model = MobileNet;

    fn load(&self, config: &ModelConfig) -> BoxFuture<'static, Result<MobileNet, AppError>> {
        let manager = self.clone();
        let config = config.clone();
        Box::pin(async move { manager.load_model(&config).await })
    }
}

fn open_session(model_path: &Path, use_gpu: bool) -> Result<Session, AppError> {
    let _ = ort::init().with_name("mobilenet-predict").commit();

    let mut builder = Session::builder()
        .map_err(|e| AppError::model_load(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| AppError::model_load(format!("Failed to set optimization level: {}", e)))?
        .with_intra_threads(4)
        .map_err(|e| AppError::model_load(format!("Failed to set intra threads: {}", e)))?;

    if use_gpu {
        builder = builder
            .with_execution_providers([
                ort::execution_providers::DirectMLExecutionProvider::default().build(),
                ort::execution_providers::CoreMLExecutionProvider::default().build(),
                ort::execution_providers::CUDAExecutionProvider::default().build(),
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ])
            .map_err(|e| {
                AppError::model_load(format!("Failed to register GPU execution providers: {}", e))
            })?;
    }

    builder
        .commit_from_file(model_path)
        .map_err(|e| AppError::model_load(format!("Failed to load ONNX model: {}", e)))
}

/// A ready-to-run MobileNet checkpoint.
pub struct MobileNet {
    session: Session,
    labels: Vec<String>,
    input_size: u32,
    top_k: usize,
}

impl ImageClassifier for MobileNet {
    fn classify(&mut self, image: &DynamicImage) -> Result<Vec<Prediction>, AppError> {
        let tensor = inference::preprocess_image(image, self.input_size)?;
        inference::run_inference_with_model(&mut self.session, tensor, &self.labels, self.top_k)
    }
}

/// Streams `url` into `dest` via a `.part` file so an interrupted download is
/// never mistaken for a cached one.
async fn download_file(
    url: &str,
    dest: &Path,
    on_progress: Option<&ProgressFn>,
) -> Result<(), AppError> {
    let response = reqwest::Client::new().get(url).send().await?;

    if !response.status().is_success() {
        return Err(AppError::model_load(format!(
            "Failed to download {}: HTTP {}",
            url,
            response.status()
        )));
    }

    let part_path = dest.with_extension("part");
    if let Err(e) = stream_to_file(response, &part_path, on_progress).await {
        let _ = tokio::fs::remove_file(&part_path).await;
        return Err(e);
    }

    tokio::fs::rename(&part_path, dest).await.map_err(|e| {
        AppError::model_load(format!("Failed to finalize {}: {}", dest.display(), e))
    })?;

    if let Some(report) = on_progress {
        report(100);
    }

    Ok(())
}

async fn stream_to_file(
    response: reqwest::Response,
    path: &Path,
    on_progress: Option<&ProgressFn>,
) -> Result<(), AppError> {
    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;
    let mut last_emit = 0;

    let mut file = tokio::fs::File::create(path).await.map_err(|e| {
        AppError::model_load(format!("Failed to create file {}: {}", path.display(), e))
    })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        downloaded += chunk.len() as u64;
        tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
            .await
            .map_err(|e| AppError::model_load(format!("Failed to write to file: {}", e)))?;

        if let Some(report) = on_progress {
            if total_size > 0 {
                // 100 is reported once the file is in place.
                let progress = ((downloaded * 100) / total_size).min(99);
                if progress > last_emit {
                    report(progress);
                    last_emit = progress;
                }
            }
        }
    }

    tokio::io::AsyncWriteExt::flush(&mut file)
        .await
        .map_err(|e| AppError::model_load(format!("Failed to flush file: {}", e)))
}
