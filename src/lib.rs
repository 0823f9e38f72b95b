#[cfg(feature = "desktop")]
pub mod commands;
pub mod error;
pub mod models;
pub mod services;

#[cfg(feature = "desktop")]
pub fn run() {
    use commands::workflow::AppWorkflow;
    use services::classifier::model_manager::ModelManager;
    use services::config_service;
    use services::image_decoder::FileImageDecoder;
    use tauri::{Emitter, Manager};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    tauri::Builder::default()
        .plugin(tauri_plugin_dialog::init())
        .plugin(tauri_plugin_window_state::Builder::default().build())
        .setup(|app| {
            let app_data_dir = app.path().app_data_dir()?;
            std::fs::create_dir_all(&app_data_dir)?;

            let config = config_service::load_config(&app_data_dir)?;

            let progress_handle = app.handle().clone();
            let model_manager = ModelManager::new(app_data_dir).with_progress(move |progress| {
                let _ = progress_handle.emit("download-progress", progress);
            });

            let workflow = AppWorkflow::new(model_manager, FileImageDecoder, config.model);
            app.manage(workflow.clone());

            // Push every state change to the webview.
            let app_handle = app.handle().clone();
            let mut changes = workflow.subscribe();
            tauri::async_runtime::spawn(async move {
                while changes.changed().await.is_ok() {
                    let snapshot = changes.borrow_and_update().clone();
                    if let Err(e) = app_handle.emit("workflow-state", snapshot) {
                        log::warn!("Failed to emit workflow state: {}", e);
                    }
                }
            });

            // Load failures land in the snapshot; the window offers a retry.
            tauri::async_runtime::spawn(async move {
                let _ = workflow.initialize().await;
            });

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::workflow::get_workflow_state,
            commands::workflow::select_image,
            commands::workflow::classify,
            commands::workflow::retry_model_load,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
