pub mod inference;
pub mod model_manager;

use crate::error::AppError;
use crate::models::classify_types::Prediction;
use crate::models::config_types::ModelConfig;
use futures::future::BoxFuture;
use image::DynamicImage;

/// A loaded model that turns an image into ranked predictions.
pub trait ImageClassifier: Send + 'static {
    fn classify(&mut self, image: &DynamicImage) -> Result<Vec<Prediction>, AppError>;
}

/// Acquires a model for the given configuration.
pub trait ModelLoader: Send + Sync + 'static {
    type Model: ImageClassifier;

    fn load(&self, config: &ModelConfig) -> BoxFuture<'static, Result<Self::Model, AppError>>;
}
