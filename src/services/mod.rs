pub mod classifier;
pub mod config_service;
pub mod exif_service;
pub mod image_decoder;
pub mod workflow;
