use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Model file not found: {0}")]
    ModelNotFound(String),
    #[error("Failed to create session: {0}")]
    SessionCreation(String),
}

/// ONNX Runtime wrapper
pub struct OnnxRuntime;

impl OnnxRuntime {
    /// Create a new ONNX Runtime instance
    pub fn new() -> Result<Self, RuntimeError> {
        Ok(Self)
    }

    /// Create a new CPU session from a model file
    pub fn create_session<P: AsRef<Path>>(&self, model_path: P) -> Result<Session, RuntimeError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(RuntimeError::ModelNotFound(model_path.display().to_string()));
        }

        let builder = Session::builder()
            .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?;

        let session = builder.commit_from_file(model_path).map_err(|e| {
            RuntimeError::SessionCreation(format!(
                "Failed to load model from {:?}: {}",
                model_path, e
            ))
        })?;

        log::debug!("Loaded ONNX model: {:?}", model_path);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_creation() {
        assert!(OnnxRuntime::new().is_ok());
    }

    #[test]
    fn test_missing_model_file() {
        let runtime = OnnxRuntime::new().unwrap();
        let path = std::env::temp_dir().join("pamface-test-missing-model.onnx");
        assert!(matches!(
            runtime.create_session(&path),
            Err(RuntimeError::ModelNotFound(_))
        ));
    }
}
