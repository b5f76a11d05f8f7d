use crate::artifacts::ModelStore;
use crate::config::EngineSettings;
use crate::dataset::load_training_records;
use crate::estimator::MlPriceEstimator;
use crate::features::FeatureExtractor;
use crate::models::TrainingRecord;
use crate::monitor::{JsonlPredictionLogger, PredictionLogger, DEFAULT_LOG_CAPACITY};
use crate::regressor::Learner;
use crate::router::{ModelSet, PredictionRouter};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Composition root: owns settings, the artifact store and the lazily built inference services.
pub struct AppContext {
    settings: EngineSettings,
    store: ModelStore,
    extractor: FeatureExtractor,
    prediction_log: Option<Arc<JsonlPredictionLogger>>,
    estimator: OnceCell<Arc<MlPriceEstimator>>,
}

impl AppContext {
    pub async fn initialize(settings: EngineSettings) -> Result<Self> {
        let store = ModelStore::new(settings.model_dir.clone());
        let prediction_log = match settings.prediction_log_file.as_deref() {
            Some(path) => {
                info!("Logging served predictions to {}", path.display());
                Some(Arc::new(JsonlPredictionLogger::open(
                    path,
                    DEFAULT_LOG_CAPACITY,
                )?))
            }
            None => None,
        };
        Ok(Self {
            settings,
            store,
            extractor: FeatureExtractor::new(),
            prediction_log,
            estimator: OnceCell::new(),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn learner(&self) -> Result<Arc<dyn Learner>> {
        self.settings.trainer_backend.tree_learner()
    }

    /// Training records from `override_path`, else from `TRAINING_DATA_FILE`.
    pub async fn load_records(&self, override_path: Option<&Path>) -> Result<Vec<TrainingRecord>> {
        let path = override_path
            .map(Path::to_path_buf)
            .or_else(|| self.settings.training_data_file.clone())
            .ok_or_else(|| {
                anyhow!("TRAINING_DATA_FILE must be set (or --data passed) to train models.")
            })?;
        tokio::task::spawn_blocking(move || load_training_records(&path)).await?
    }

    /// The deployed models behind one estimator, loaded on first use.
    pub async fn estimator(&self) -> Result<Arc<MlPriceEstimator>> {
        self.estimator
            .get_or_try_init(|| async {
                let store = self.store.clone();
                let models = tokio::task::spawn_blocking(move || ModelSet::load(&store)).await??;
                let mut router =
                    PredictionRouter::new(models, self.settings.router_config(), self.extractor);
                if let Some(logger) = &self.prediction_log {
                    router = router.with_logger(Arc::clone(logger) as Arc<dyn PredictionLogger>);
                }
                Ok::<_, anyhow::Error>(Arc::new(MlPriceEstimator::new(Arc::new(router))))
            })
            .await
            .map(Arc::clone)
    }

    /// Reloads artifacts into an already built estimator after a training run.
    pub async fn refresh_models(&self) -> Result<()> {
        let Some(estimator) = self.estimator.get() else {
            return Ok(());
        };
        let store = self.store.clone();
        let models = tokio::task::spawn_blocking(move || ModelSet::load(&store)).await??;
        estimator.router().install(models);
        Ok(())
    }

    /// Drops the inference services and flushes the prediction log.
    pub fn shutdown(self) {
        let Self {
            estimator,
            prediction_log,
            ..
        } = self;
        drop(estimator);
        if let Some(logger) = prediction_log {
            match Arc::try_unwrap(logger) {
                Ok(logger) => {
                    let dropped = logger.dropped();
                    if dropped > 0 {
                        warn!("Prediction log dropped {} record(s)", dropped);
                    }
                    logger.close();
                }
                Err(_) => warn!("Prediction log still shared at shutdown; not flushed"),
            }
        }
    }
}
