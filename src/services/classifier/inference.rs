use crate::error::AppError;
use crate::models::classify_types::Prediction;
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;

const BACKGROUND_LABEL: &str = "background";

/// Resizes to `input_size` square and scales pixels to [-1, 1] in NCHW layout.
pub fn preprocess_image(img: &DynamicImage, input_size: u32) -> Result<Array4<f32>, AppError> {
    let rgb = img
        .resize_exact(input_size, input_size, FilterType::Triangle)
        .to_rgb8();

    let hw = (input_size * input_size) as usize;
    let mut data = vec![0f32; 3 * hw];
    for (i, pixel) in rgb.pixels().enumerate() {
        data[i] = pixel[0] as f32 / 127.5 - 1.0;
        data[hw + i] = pixel[1] as f32 / 127.5 - 1.0;
        data[2 * hw + i] = pixel[2] as f32 / 127.5 - 1.0;
    }

    Array4::from_shape_vec((1, 3, input_size as usize, input_size as usize), data)
        .map_err(|e| AppError::classify(format!("Failed to create tensor: {}", e)))
}

/// Softmax over the logits, then the `top_k` most likely classes, best first.
///
/// Checkpoints trained with a leading "background" class carry one logit
/// more than there are real classes; that logit is dropped before softmax.
pub fn logits_to_predictions(logits: &[f32], labels: &[String], top_k: usize) -> Vec<Prediction> {
    let skip = match labels.first() {
        Some(first) if first.eq_ignore_ascii_case(BACKGROUND_LABEL) && logits.len() > 1 => 1,
        _ => 0,
    };
    let logits = &logits[skip..];
    if logits.is_empty() {
        return Vec::new();
    }

    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let exp_sum: f32 = exp.iter().sum();

    let mut indexed: Vec<(usize, f32)> = exp
        .into_iter()
        .map(|e| e / exp_sum)
        .enumerate()
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(top_k);

    indexed
        .into_iter()
        .map(|(idx, confidence)| {
            let label_idx = idx + skip;
            let label = labels
                .get(label_idx)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", label_idx));
            Prediction { label, confidence }
        })
        .collect()
}

pub fn run_inference_with_model(
    session: &mut Session,
    input: Array4<f32>,
    labels: &[String],
    top_k: usize,
) -> Result<Vec<Prediction>, AppError> {
    let input_name = session
        .inputs()
        .first()
        .ok_or_else(|| AppError::classify("Model has no inputs"))?
        .name()
        .to_string();

    let input_tensor = Value::from_array(input)
        .map_err(|e| AppError::classify(format!("Failed to create tensor value: {}", e)))?;

    let outputs = session
        .run(ort::inputs![input_name.as_str() => input_tensor])
        .map_err(|e| AppError::classify(format!("Inference failed: {}", e)))?;

    let output_value = outputs
        .values()
        .next()
        .ok_or_else(|| AppError::classify("Model produced no outputs"))?;

    let (_, logits) = output_value
        .try_extract_tensor::<f32>()
        .map_err(|e| AppError::classify(format!("Failed to extract output tensor: {}", e)))?;

    Ok(logits_to_predictions(logits, labels, top_k))
}
