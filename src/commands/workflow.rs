use crate::error::AppError;
use crate::models::workflow_types::WorkflowSnapshot;
use crate::services::classifier::model_manager::ModelManager;
use crate::services::image_decoder::{FileImageDecoder, IMAGE_EXTENSIONS};
use crate::services::workflow::Workflow;
use std::path::PathBuf;
use tauri::{AppHandle, State};
use tauri_plugin_dialog::DialogExt;

pub type AppWorkflow = Workflow<ModelManager, FileImageDecoder>;

#[tauri::command]
pub async fn get_workflow_state(
    workflow: State<'_, AppWorkflow>,
) -> Result<WorkflowSnapshot, AppError> {
    Ok(workflow.snapshot().await)
}

#[tauri::command]
pub async fn retry_model_load(
    workflow: State<'_, AppWorkflow>,
) -> Result<WorkflowSnapshot, AppError> {
    workflow.retry_model_load().await
}

/// Selects `path`, or asks the user for a file when none is given.
#[tauri::command]
pub async fn select_image(
    app: AppHandle,
    workflow: State<'_, AppWorkflow>,
    path: Option<String>,
) -> Result<WorkflowSnapshot, AppError> {
    let file = match path {
        Some(p) => Some(PathBuf::from(p)),
        None => pick_image(&app).await?,
    };
    workflow.select_image(file).await
}

#[tauri::command]
pub async fn classify(workflow: State<'_, AppWorkflow>) -> Result<WorkflowSnapshot, AppError> {
    workflow.classify().await
}

async fn pick_image(app: &AppHandle) -> Result<Option<PathBuf>, AppError> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    app.dialog()
        .file()
        .add_filter("Images", IMAGE_EXTENSIONS)
        .pick_file(move |file| {
            let _ = tx.send(file);
        });

    let picked = rx
        .await
        .map_err(|_| AppError::from("File dialog closed unexpectedly"))?;

    picked
        .map(|file| {
            file.into_path()
                .map_err(|e| AppError::from(format!("Unsupported file location: {}", e)))
        })
        .transpose()
}
