//! The load → select → classify workflow behind the main window.
//!
//! One [`Workflow`] owns the model handle, the selected image and the latest
//! predictions. Every select/classify request takes a sequence number and its
//! result is applied only if no newer request was issued in the meantime, so
//! a slow decode or inference can never overwrite a newer selection.

use crate::error::AppError;
use crate::models::classify_types::Prediction;
use crate::models::config_types::ModelConfig;
use crate::models::workflow_types::{Phase, WorkflowSnapshot};
use crate::services::classifier::{ImageClassifier, ModelLoader};
use crate::services::image_decoder::{DecodedImage, ImageDecoder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

enum ModelSlot<M> {
    NotStarted,
    Loading,
    Ready(Arc<std::sync::Mutex<M>>),
    Failed,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Decode,
    Classify,
}

#[derive(Clone, Copy)]
struct Pending {
    seq: u64,
    kind: PendingKind,
}

struct WorkflowState<M> {
    model: ModelSlot<M>,
    image: Option<Arc<DecodedImage>>,
    predictions: Option<Vec<Prediction>>,
    error: Option<AppError>,
    pending: Option<Pending>,
    latest_seq: u64,
}

impl<M> WorkflowState<M> {
    fn new() -> Self {
        Self {
            model: ModelSlot::NotStarted,
            image: None,
            predictions: None,
            error: None,
            pending: None,
            latest_seq: 0,
        }
    }

    fn phase(&self) -> Phase {
        match self.model {
            ModelSlot::NotStarted | ModelSlot::Loading => return Phase::Loading,
            ModelSlot::Failed => return Phase::Failed,
            ModelSlot::Ready(_) => {}
        }
        match self.pending.map(|p| p.kind) {
            Some(PendingKind::Decode) => Phase::Decoding,
            Some(PendingKind::Classify) => Phase::Classifying,
            None if self.predictions.is_some() => Phase::ResultsAvailable,
            None if self.image.is_some() => Phase::ImageSelected,
            None => Phase::Ready,
        }
    }

    fn snapshot(&self) -> WorkflowSnapshot {
        let phase = self.phase();
        WorkflowSnapshot {
            phase,
            loading: phase == Phase::Loading,
            image_name: self.image.as_ref().map(|i| i.file_name.clone()),
            image_uri: self.image.as_ref().map(|i| i.data_uri.clone()),
            predictions: self.predictions.clone(),
            error: self.error.clone(),
        }
    }

    fn model(&self) -> Result<Arc<std::sync::Mutex<M>>, AppError> {
        match &self.model {
            ModelSlot::Ready(model) => Ok(model.clone()),
            _ => Err(AppError::not_ready("Model is not loaded yet")),
        }
    }

    fn issue(&mut self, kind: PendingKind) -> u64 {
        self.latest_seq += 1;
        self.pending = Some(Pending {
            seq: self.latest_seq,
            kind,
        });
        self.latest_seq
    }

    fn is_current(&self, seq: u64) -> bool {
        self.latest_seq == seq
    }
}

struct Shared<L: ModelLoader, D> {
    loader: L,
    decoder: D,
    config: ModelConfig,
    state: Mutex<WorkflowState<L::Model>>,
    changes: watch::Sender<WorkflowSnapshot>,
}

pub struct Workflow<L: ModelLoader, D: ImageDecoder> {
    shared: Arc<Shared<L, D>>,
}

impl<L: ModelLoader, D: ImageDecoder> Clone for Workflow<L, D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<L: ModelLoader, D: ImageDecoder> Workflow<L, D> {
    pub fn new(loader: L, decoder: D, config: ModelConfig) -> Self {
        let (changes, _) = watch::channel(WorkflowSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                loader,
                decoder,
                config,
                state: Mutex::new(WorkflowState::new()),
                changes,
            }),
        }
    }

    pub async fn snapshot(&self) -> WorkflowSnapshot {
        self.shared.state.lock().await.snapshot()
    }

    /// Yields a fresh snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.shared.changes.subscribe()
    }

    fn publish(&self, state: &WorkflowState<L::Model>) -> WorkflowSnapshot {
        let snapshot = state.snapshot();
        self.shared.changes.send_replace(snapshot.clone());
        snapshot
    }

    /// Acquires the model. A no-op once it is loaded.
    pub async fn initialize(&self) -> Result<WorkflowSnapshot, AppError> {
        {
            let mut state = self.shared.state.lock().await;
            match state.model {
                ModelSlot::Ready(_) => return Ok(state.snapshot()),
                ModelSlot::Loading => return Err(AppError::not_ready("Model is already loading")),
                ModelSlot::NotStarted | ModelSlot::Failed => {}
            }
            state.model = ModelSlot::Loading;
            state.error = None;
            self.publish(&state);
        }

        log::info!(
            "Loading MobileNet v{} (alpha {})",
            u8::from(self.shared.config.version),
            self.shared.config.alpha
        );
        let result = self.shared.loader.load(&self.shared.config).await;

        let mut state = self.shared.state.lock().await;
        match result {
            Ok(model) => {
                state.model = ModelSlot::Ready(Arc::new(std::sync::Mutex::new(model)));
                log::info!("Model ready");
                Ok(self.publish(&state))
            }
            Err(e) => {
                log::error!("Failed to load model: {}", e);
                state.model = ModelSlot::Failed;
                state.error = Some(e.clone());
                self.publish(&state);
                Err(e)
            }
        }
    }

    pub async fn retry_model_load(&self) -> Result<WorkflowSnapshot, AppError> {
        {
            let state = self.shared.state.lock().await;
            match state.model {
                ModelSlot::Ready(_) => return Ok(state.snapshot()),
                ModelSlot::Loading => return Err(AppError::not_ready("Model is already loading")),
                ModelSlot::NotStarted | ModelSlot::Failed => {}
            }
        }
        self.initialize().await
    }

    /// Replaces the selected image. `None` (picker dismissed) changes nothing.
    pub async fn select_image(&self, file: Option<PathBuf>) -> Result<WorkflowSnapshot, AppError> {
        let Some(path) = file else {
            return Ok(self.snapshot().await);
        };

        let seq = {
            let mut state = self.shared.state.lock().await;
            state.model()?;
            state.predictions = None;
            state.error = None;
            let seq = state.issue(PendingKind::Decode);
            self.publish(&state);
            seq
        };

        let shared = self.shared.clone();
        let decode_path = path.clone();
        let result = tokio::task::spawn_blocking(move || shared.decoder.decode(&decode_path))
            .await
            .unwrap_or_else(|e| Err(e.into()));

        let mut state = self.shared.state.lock().await;
        if !state.is_current(seq) {
            log::debug!("Discarding stale decode of {}", path.display());
            return Ok(state.snapshot());
        }
        state.pending = None;

        match result {
            Ok(image) => {
                log::info!("Selected image {}", image.file_name);
                state.image = Some(Arc::new(image));
                Ok(self.publish(&state))
            }
            Err(e) => {
                log::error!("Failed to decode {}: {}", path.display(), e);
                state.error = Some(e.clone());
                self.publish(&state);
                Err(e)
            }
        }
    }

    /// Runs the model on the selected image. Predictions keep the model's order.
    pub async fn classify(&self) -> Result<WorkflowSnapshot, AppError> {
        let (seq, model, image) = {
            let mut state = self.shared.state.lock().await;
            let model = state.model()?;
            if matches!(state.pending, Some(p) if p.kind == PendingKind::Decode) {
                return Err(AppError::not_ready("Image is still being decoded"));
            }
            let image = state
                .image
                .clone()
                .ok_or_else(|| AppError::not_ready("No image selected"))?;
            state.error = None;
            let seq = state.issue(PendingKind::Classify);
            self.publish(&state);
            (seq, model, image)
        };

        let result = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| AppError::classify("Model lock poisoned"))?;
            model.classify(&image.image)
        })
        .await
        .unwrap_or_else(|e| Err(e.into()));

        let mut state = self.shared.state.lock().await;
        if !state.is_current(seq) {
            log::debug!("Discarding stale classification");
            return Ok(state.snapshot());
        }
        state.pending = None;

        match result {
            Ok(predictions) => {
                log::info!("Classified into {} predictions", predictions.len());
                state.predictions = Some(predictions);
                Ok(self.publish(&state))
            }
            Err(e) => {
                log::error!("Classification failed: {}", e);
                state.error = Some(e.clone());
                self.publish(&state);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use futures::future::BoxFuture;
    use image::DynamicImage;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Condvar;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Blocks a worker thread until the test opens it.
    #[derive(Clone, Default)]
    struct Gate(Arc<(std::sync::Mutex<bool>, Condvar)>);

    impl Gate {
        fn open(&self) {
            let (lock, cvar) = &*self.0;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }

        fn wait(&self) {
            let (lock, cvar) = &*self.0;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
        }
    }

    struct FakeModel {
        predictions: Vec<Prediction>,
        fail: bool,
        gate: Option<Gate>,
    }

    impl ImageClassifier for FakeModel {
        fn classify(&mut self, _image: &DynamicImage) -> Result<Vec<Prediction>, AppError> {
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            if self.fail {
                return Err(AppError::classify("inference exploded"));
            }
            Ok(self.predictions.clone())
        }
    }

    #[derive(Default)]
    struct FakeLoader {
        predictions: Vec<Prediction>,
        failures_left: Arc<AtomicUsize>,
        load_gate: Option<Arc<Notify>>,
        classify_gate: Option<Gate>,
        classify_fails: bool,
    }

    impl ModelLoader for FakeLoader {
        type Model = FakeModel;

        fn load(&self, _config: &ModelConfig) -> BoxFuture<'static, Result<FakeModel, AppError>> {
            let failures_left = self.failures_left.clone();
            let load_gate = self.load_gate.clone();
            let model = FakeModel {
                predictions: self.predictions.clone(),
                fail: self.classify_fails,
                gate: self.classify_gate.clone(),
            };
            Box::pin(async move {
                if let Some(gate) = load_gate {
                    gate.notified().await;
                }
                let failing = failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(AppError::model_load("hub unreachable"));
                }
                Ok(model)
            })
        }
    }

    #[derive(Default)]
    struct FakeDecoder {
        slow: Option<(String, Gate)>,
    }

    impl ImageDecoder for FakeDecoder {
        fn decode(&self, path: &Path) -> Result<DecodedImage, AppError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if let Some((slow_name, gate)) = &self.slow {
                if *slow_name == name {
                    gate.wait();
                }
            }
            if name == "broken.png" {
                return Err(AppError::decode("not an image"));
            }
            Ok(DecodedImage {
                data_uri: format!("data:image/png;base64,{}", name),
                file_name: name,
                image: DynamicImage::new_rgb8(4, 4),
            })
        }
    }

    fn cat_predictions() -> Vec<Prediction> {
        // Deliberately not sorted: the workflow must not reorder.
        vec![
            Prediction::new("tiger cat", 0.21),
            Prediction::new("tabby, tabby cat", 0.64),
            Prediction::new("Egyptian cat", 0.09),
        ]
    }

    fn workflow(loader: FakeLoader, decoder: FakeDecoder) -> Workflow<FakeLoader, FakeDecoder> {
        Workflow::new(loader, decoder, ModelConfig::default())
    }

    async fn ready_workflow(
        loader: FakeLoader,
        decoder: FakeDecoder,
    ) -> Workflow<FakeLoader, FakeDecoder> {
        let wf = workflow(loader, decoder);
        wf.initialize().await.unwrap();
        wf
    }

    async fn wait_for_phase(rx: &mut watch::Receiver<WorkflowSnapshot>, phase: Phase) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.phase == phase))
            .await
            .expect("timed out waiting for phase")
            .expect("workflow dropped");
    }

    #[tokio::test]
    async fn starts_loading() {
        let wf = workflow(FakeLoader::default(), FakeDecoder::default());
        let snapshot = wf.snapshot().await;

        assert_eq!(snapshot.phase, Phase::Loading);
        assert!(snapshot.loading);
        assert!(snapshot.image_uri.is_none());
        assert!(snapshot.predictions.is_none());
    }

    #[tokio::test]
    async fn select_then_classify_returns_service_output_in_order() {
        let loader = FakeLoader {
            predictions: cat_predictions(),
            ..FakeLoader::default()
        };
        let wf = ready_workflow(loader, FakeDecoder::default()).await;
        assert_eq!(wf.snapshot().await.phase, Phase::Ready);

        let selected = wf
            .select_image(Some(PathBuf::from("/pics/cat.png")))
            .await
            .unwrap();
        assert_eq!(selected.phase, Phase::ImageSelected);
        assert_eq!(selected.image_name.as_deref(), Some("cat.png"));
        assert_eq!(
            selected.image_uri.as_deref(),
            Some("data:image/png;base64,cat.png")
        );

        let classified = wf.classify().await.unwrap();
        assert_eq!(classified.phase, Phase::ResultsAvailable);
        let predictions = classified.predictions.unwrap();
        assert_eq!(predictions, cat_predictions());
        assert!(predictions
            .iter()
            .all(|p| (0.0..=1.0).contains(&p.confidence)));
    }

    #[tokio::test]
    async fn selecting_a_new_image_clears_predictions_first() {
        let gate = Gate::default();
        let loader = FakeLoader {
            predictions: cat_predictions(),
            ..FakeLoader::default()
        };
        let decoder = FakeDecoder {
            slow: Some(("dog.png".to_string(), gate.clone())),
        };
        let wf = ready_workflow(loader, decoder).await;
        wf.select_image(Some(PathBuf::from("cat.png"))).await.unwrap();
        assert!(wf.classify().await.unwrap().predictions.is_some());

        let mut rx = wf.subscribe();
        let task = tokio::spawn({
            let wf = wf.clone();
            async move { wf.select_image(Some(PathBuf::from("dog.png"))).await }
        });
        wait_for_phase(&mut rx, Phase::Decoding).await;

        let decoding = wf.snapshot().await;
        assert!(decoding.predictions.is_none());
        assert_eq!(decoding.image_name.as_deref(), Some("cat.png"));

        gate.open();
        let done = task.await.unwrap().unwrap();
        assert_eq!(done.phase, Phase::ImageSelected);
        assert_eq!(done.image_name.as_deref(), Some("dog.png"));
        assert!(done.predictions.is_none());
    }

    #[tokio::test]
    async fn classify_without_image_is_rejected() {
        let wf = ready_workflow(FakeLoader::default(), FakeDecoder::default()).await;

        let err = wf.classify().await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::NotReady);
        assert_eq!(wf.snapshot().await.phase, Phase::Ready);
    }

    #[tokio::test]
    async fn nothing_runs_before_the_model_is_loaded() {
        let load_gate = Arc::new(Notify::new());
        let loader = FakeLoader {
            load_gate: Some(load_gate.clone()),
            ..FakeLoader::default()
        };
        let wf = workflow(loader, FakeDecoder::default());

        assert_eq!(wf.classify().await.unwrap_err().kind, ErrorKind::NotReady);

        let mut rx = wf.subscribe();
        let init = tokio::spawn({
            let wf = wf.clone();
            async move { wf.initialize().await }
        });
        wait_for_phase(&mut rx, Phase::Loading).await;

        assert_eq!(wf.classify().await.unwrap_err().kind, ErrorKind::NotReady);
        let err = wf
            .select_image(Some(PathBuf::from("cat.png")))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert_eq!(wf.snapshot().await.phase, Phase::Loading);

        load_gate.notify_one();
        assert_eq!(init.await.unwrap().unwrap().phase, Phase::Ready);
    }

    #[tokio::test]
    async fn model_load_failure_is_reported_and_retry_recovers() {
        let loader = FakeLoader {
            failures_left: Arc::new(AtomicUsize::new(1)),
            ..FakeLoader::default()
        };
        let wf = workflow(loader, FakeDecoder::default());

        let err = wf.initialize().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelLoad);

        let failed = wf.snapshot().await;
        assert_eq!(failed.phase, Phase::Failed);
        assert!(!failed.loading);
        assert_eq!(failed.error.unwrap().message, "hub unreachable");
        assert_eq!(wf.classify().await.unwrap_err().kind, ErrorKind::NotReady);

        let recovered = wf.retry_model_load().await.unwrap();
        assert_eq!(recovered.phase, Phase::Ready);
        assert!(recovered.error.is_none());
    }

    #[tokio::test]
    async fn initialize_is_idempotent_once_ready() {
        let wf = ready_workflow(FakeLoader::default(), FakeDecoder::default()).await;
        wf.select_image(Some(PathBuf::from("cat.png"))).await.unwrap();

        let again = wf.initialize().await.unwrap();
        assert_eq!(again.phase, Phase::ImageSelected);
        assert_eq!(wf.retry_model_load().await.unwrap().phase, Phase::ImageSelected);
    }

    #[tokio::test]
    async fn dismissed_picker_changes_nothing() {
        let wf = ready_workflow(FakeLoader::default(), FakeDecoder::default()).await;
        wf.select_image(Some(PathBuf::from("cat.png"))).await.unwrap();

        let snapshot = wf.select_image(None).await.unwrap();

        assert_eq!(snapshot.phase, Phase::ImageSelected);
        assert_eq!(snapshot.image_name.as_deref(), Some("cat.png"));
    }

    #[tokio::test]
    async fn stale_decode_never_overwrites_newer_selection() {
        let gate = Gate::default();
        let decoder = FakeDecoder {
            slow: Some(("huge.png".to_string(), gate.clone())),
        };
        let wf = ready_workflow(FakeLoader::default(), decoder).await;

        let mut rx = wf.subscribe();
        let slow = tokio::spawn({
            let wf = wf.clone();
            async move { wf.select_image(Some(PathBuf::from("huge.png"))).await }
        });
        wait_for_phase(&mut rx, Phase::Decoding).await;

        let fast = wf
            .select_image(Some(PathBuf::from("small.png")))
            .await
            .unwrap();
        assert_eq!(fast.image_name.as_deref(), Some("small.png"));

        gate.open();
        let after_slow = slow.await.unwrap().unwrap();
        assert_eq!(after_slow.image_name.as_deref(), Some("small.png"));
        assert_eq!(wf.snapshot().await.phase, Phase::ImageSelected);
    }

    #[tokio::test]
    async fn stale_classification_is_discarded_after_reselect() {
        let gate = Gate::default();
        let loader = FakeLoader {
            predictions: cat_predictions(),
            classify_gate: Some(gate.clone()),
            ..FakeLoader::default()
        };
        let wf = ready_workflow(loader, FakeDecoder::default()).await;
        wf.select_image(Some(PathBuf::from("cat.png"))).await.unwrap();

        let mut rx = wf.subscribe();
        let classify = tokio::spawn({
            let wf = wf.clone();
            async move { wf.classify().await }
        });
        wait_for_phase(&mut rx, Phase::Classifying).await;

        wf.select_image(Some(PathBuf::from("dog.png"))).await.unwrap();
        gate.open();
        classify.await.unwrap().unwrap();

        let snapshot = wf.snapshot().await;
        assert_eq!(snapshot.phase, Phase::ImageSelected);
        assert_eq!(snapshot.image_name.as_deref(), Some("dog.png"));
        assert!(snapshot.predictions.is_none());
    }

    #[tokio::test]
    async fn classify_waits_for_pending_decode() {
        let gate = Gate::default();
        let decoder = FakeDecoder {
            slow: Some(("cat.png".to_string(), gate.clone())),
        };
        let wf = ready_workflow(FakeLoader::default(), decoder).await;

        let mut rx = wf.subscribe();
        let select = tokio::spawn({
            let wf = wf.clone();
            async move { wf.select_image(Some(PathBuf::from("cat.png"))).await }
        });
        wait_for_phase(&mut rx, Phase::Decoding).await;

        assert_eq!(wf.classify().await.unwrap_err().kind, ErrorKind::NotReady);

        gate.open();
        select.await.unwrap().unwrap();
        assert!(wf.classify().await.is_ok());
    }

    #[tokio::test]
    async fn decode_failure_keeps_previous_image() {
        let wf = ready_workflow(FakeLoader::default(), FakeDecoder::default()).await;
        wf.select_image(Some(PathBuf::from("cat.png"))).await.unwrap();
        wf.classify().await.unwrap();

        let err = wf
            .select_image(Some(PathBuf::from("broken.png")))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Decode);

        let snapshot = wf.snapshot().await;
        assert_eq!(snapshot.phase, Phase::ImageSelected);
        assert_eq!(snapshot.image_name.as_deref(), Some("cat.png"));
        assert!(snapshot.predictions.is_none());
        assert_eq!(snapshot.error.unwrap().kind, ErrorKind::Decode);
    }

    #[tokio::test]
    async fn classify_failure_is_surfaced_and_recoverable() {
        let loader = FakeLoader {
            classify_fails: true,
            ..FakeLoader::default()
        };
        let wf = ready_workflow(loader, FakeDecoder::default()).await;
        wf.select_image(Some(PathBuf::from("cat.png"))).await.unwrap();

        let err = wf.classify().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Classify);

        let snapshot = wf.snapshot().await;
        assert_eq!(snapshot.phase, Phase::ImageSelected);
        assert_eq!(snapshot.error.unwrap().kind, ErrorKind::Classify);

        // A new selection clears the banner.
        let reselected = wf.select_image(Some(PathBuf::from("dog.png"))).await.unwrap();
        assert!(reselected.error.is_none());
    }

    #[tokio::test]
    async fn subscribers_see_each_transition() {
        let wf = workflow(FakeLoader::default(), FakeDecoder::default());
        let rx = wf.subscribe();

        wf.initialize().await.unwrap();
        assert_eq!(rx.borrow().phase, Phase::Ready);

        wf.select_image(Some(PathBuf::from("cat.png"))).await.unwrap();
        assert_eq!(rx.borrow().phase, Phase::ImageSelected);
        assert_eq!(rx.borrow().image_name.as_deref(), Some("cat.png"));
    }
}
