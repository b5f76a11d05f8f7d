use thiserror::Error;

/// Named failures callers branch on. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("{model}: insufficient training data ({found} valid rows, {required} required)")]
    DataInsufficient {
        model: String,
        found: usize,
        required: usize,
    },
    #[error("{model}: feature schema mismatch (expected {expected:?}, artifact has {found:?})")]
    FeatureSchemaMismatch {
        model: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("invalid dataset: {0}")]
    InvalidDataset(String),
    #[error("model artifact missing at {0}")]
    ArtifactMissing(String),
}

impl EstimatorError {
    pub fn is_data_insufficient(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<EstimatorError>(),
            Some(EstimatorError::DataInsufficient { .. })
        )
    }

    pub fn is_schema_mismatch(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<EstimatorError>(),
            Some(EstimatorError::FeatureSchemaMismatch { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn data_insufficient_survives_context_wrapping() {
        let err: anyhow::Result<()> = Err(EstimatorError::DataInsufficient {
            model: "amazon".to_string(),
            found: 10,
            required: 50,
        }
        .into());
        let wrapped = err.context("training amazon specialist").unwrap_err();
        assert!(EstimatorError::is_data_insufficient(&wrapped));
        assert!(!EstimatorError::is_schema_mismatch(&wrapped));
    }
}
