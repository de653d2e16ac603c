//! Client for the external calibrated probability model.
//!
//! The model is treated as a pure function over the 15-field feature
//! vector. It never contributes to the security report directly — the
//! verdict assembler is its only consumer, and it degrades to `None`
//! whenever the oracle is unreachable or talks nonsense.

use crate::errors::ClassifierError;
use crate::features::FeatureVector;
use crate::types::MlVerdict;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Port to the probability oracle.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn score(&self, features: &FeatureVector) -> Result<MlVerdict, ClassifierError>;
}

/// HTTP classifier: POSTs the feature vector by field name, expects the
/// calibrated verdict body back within a short budget.
pub struct HttpClassifier {
    endpoint: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        HttpClassifier { endpoint, client: reqwest::Client::new(), timeout }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.classifier_url.clone(), Duration::from_millis(config.classifier_timeout_ms))
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn score(&self, features: &FeatureVector) -> Result<MlVerdict, ClassifierError> {
        let endpoint = self.endpoint.as_deref().ok_or(ClassifierError::Unavailable)?;

        let response = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .json(features)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "classifier oracle unreachable");
                ClassifierError::Unavailable
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "classifier oracle returned an error status");
            return Err(ClassifierError::Unavailable);
        }

        let verdict: MlVerdict = response
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;

        if !verdict.scam_probability.is_finite() || !(0.0..=1.0).contains(&verdict.scam_probability) {
            return Err(ClassifierError::Malformed(format!(
                "scam_probability out of range: {}",
                verdict.scam_probability
            )));
        }
        Ok(verdict)
    }
}

// ── Tests ───────────────────────────────────────────────────────
