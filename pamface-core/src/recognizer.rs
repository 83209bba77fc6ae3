use crate::capture::{Camera, CaptureSource};
use crate::config::{Config, ModuleSettings};
use crate::detect::{DetectionParams, FaceDetector, FaceRegion, ScrfdDetector};
use crate::model::{LbphRecognizer, Prediction, Recognizer};
use crate::runtime::OnnxRuntime;
use crate::Error;
use image::GrayImage;
use std::path::{Path, PathBuf};

/// Camera, face detector and identity model bound together for one attempt.
///
/// The capture device is held from construction until the recognizer is
/// dropped, which releases it on every exit path.
pub struct FaceRecognizer {
    capture: Box<dyn CaptureSource>,
    detector: Box<dyn FaceDetector>,
    model: Box<dyn Recognizer>,
    model_path: PathBuf,
    params: DetectionParams,
}

impl FaceRecognizer {
    /// Open the configured camera and load the detector and identity model
    pub fn open(config: &Config, settings: &ModuleSettings) -> Result<Self, Error> {
        // Load the model first so an unreadable model never touches the camera
        let model = LbphRecognizer::load(&settings.model_path)?;

        let runtime = OnnxRuntime::new()?;
        let detector = ScrfdDetector::new(&settings.detector_model_path, &runtime)?;

        let camera = Camera::open(
            &config.global.camera,
            config.global.width,
            config.global.height,
        )?;

        Ok(Self::from_parts(
            Box::new(camera),
            Box::new(detector),
            Box::new(model),
            &settings.model_path,
        ))
    }

    /// Assemble a recognizer from already constructed parts
    pub fn from_parts<P: AsRef<Path>>(
        capture: Box<dyn CaptureSource>,
        detector: Box<dyn FaceDetector>,
        model: Box<dyn Recognizer>,
        model_path: P,
    ) -> Self {
        Self {
            capture,
            detector,
            model,
            model_path: model_path.as_ref().to_path_buf(),
            params: DetectionParams::default(),
        }
    }

    /// Read one frame and detect all faces in it
    pub fn detect_faces(&mut self) -> Result<(Vec<FaceRegion>, GrayImage), Error> {
        let frame = self.capture.read_frame()?;
        let faces = self.detector.detect(&frame, &self.params)?;
        Ok((faces, frame))
    }

    /// Nearest enrolled label for a face image
    pub fn predict(&self, face: &GrayImage) -> Result<Prediction, Error> {
        Ok(self.model.predict(face)?)
    }

    /// Add labelled faces to the identity model and persist it
    pub fn update_model(&mut self, faces: &[GrayImage], labels: &[i32]) -> Result<(), Error> {
        self.model.update(faces, labels)?;
        self.model.save(&self.model_path)?;
        log::info!(
            "Model updated with {} face(s), saved to {:?}",
            faces.len(),
            self.model_path
        );
        Ok(())
    }

    pub fn model_is_empty(&self) -> bool {
        self.model.is_empty()
    }

    pub fn labels(&self) -> Vec<i32> {
        self.model.labels()
    }

    pub fn device(&self) -> String {
        self.capture.describe()
    }
}
