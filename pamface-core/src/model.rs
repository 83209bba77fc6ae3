//! Identity model: labelled face samples and nearest-label prediction.
//!
//! The engine is Local Binary Patterns Histograms. Each face is reduced to a
//! grid of per-cell LBP histograms (radius 1, 8 neighbours, 256 bins), and a
//! query is assigned the label of the closest stored sample under the
//! chi-square distance. Lower distances mean more similar faces.

use chrono::{DateTime, Utc};
use image::GrayImage;
use imageproc::local_binary_patterns::local_binary_pattern;
use ndarray::{s, Array1};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

const BINS: usize = 256;
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unsupported model format version {0}")]
    UnsupportedVersion(u32),
    #[error("No user trained yet")]
    Empty,
    #[error("Invalid training input: {0}")]
    InvalidInput(String),
    #[error("Image too small: {0}x{1}")]
    ImageTooSmall(u32, u32),
}

/// Nearest label for a face and its distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: i32,
    pub distance: f64,
}

/// Capabilities the authentication path needs from a face recognition engine.
pub trait Recognizer {
    /// Load persisted state. A zero-byte file is an empty model.
    fn load(path: &Path) -> Result<Self, ModelError>
    where
        Self: Sized;

    /// Persist the current state to `path`
    fn save(&self, path: &Path) -> Result<(), ModelError>;

    /// Nearest label and distance for `face`; never mutates the model
    fn predict(&self, face: &GrayImage) -> Result<Prediction, ModelError>;

    /// Add labelled faces to the model
    fn update(&mut self, faces: &[GrayImage], labels: &[i32]) -> Result<(), ModelError>;

    fn is_empty(&self) -> bool;

    /// Distinct labels present in the model, ascending
    fn labels(&self) -> Vec<i32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub grid_x: usize,
    pub grid_y: usize,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            grid_x: 8,
            grid_y: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub label: i32,
    pub histogram: Array1<f32>,
}

/// On-disk representation of a trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityModel {
    pub version: u32,
    pub params: LbphParams,
    pub samples: Vec<Sample>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for IdentityModel {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            params: LbphParams::default(),
            samples: Vec::new(),
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LbphRecognizer {
    model: IdentityModel,
}

impl LbphRecognizer {
    pub fn new(params: LbphParams) -> Self {
        Self {
            model: IdentityModel {
                params,
                ..IdentityModel::default()
            },
        }
    }

    pub fn model(&self) -> &IdentityModel {
        &self.model
    }

    /// Concatenated, per-cell normalised LBP histograms of `image`
    fn spatial_histogram(&self, image: &GrayImage) -> Result<Array1<f32>, ModelError> {
        let LbphParams { grid_x, grid_y } = self.model.params;
        let (width, height) = image.dimensions();

        // Border pixels have no complete neighbourhood
        let cell_w = (width.saturating_sub(2) as usize) / grid_x;
        let cell_h = (height.saturating_sub(2) as usize) / grid_y;
        if cell_w == 0 || cell_h == 0 {
            return Err(ModelError::ImageTooSmall(width, height));
        }

        let mut histogram = Array1::<f32>::zeros(grid_x * grid_y * BINS);
        let cell_pixels = (cell_w * cell_h) as f32;

        for cy in 0..grid_y {
            for cx in 0..grid_x {
                let base = (cy * grid_x + cx) * BINS;

                for y in 0..cell_h {
                    for x in 0..cell_w {
                        let px = (1 + cx * cell_w + x) as u32;
                        let py = (1 + cy * cell_h + y) as u32;
                        if let Some(code) = local_binary_pattern(image, px, py) {
                            histogram[base + code as usize] += 1.0;
                        }
                    }
                }

                histogram
                    .slice_mut(s![base..base + BINS])
                    .mapv_inplace(|count| count / cell_pixels);
            }
        }

        Ok(histogram)
    }
}

/// Chi-square distance between two histograms, symmetric form
pub fn chi_square(a: &Array1<f32>, b: &Array1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let sum = (x + y) as f64;
            if sum > f64::EPSILON {
                let diff = (x - y) as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

impl Recognizer for LbphRecognizer {
    fn load(path: &Path) -> Result<Self, ModelError> {
        let data = fs::read(path)?;

        if data.is_empty() {
            log::debug!("Model file {:?} is empty", path);
            return Ok(Self::default());
        }

        let model: IdentityModel = bincode::deserialize(&data)
            .map_err(|e| ModelError::Serialization(e.to_string()))?;

        if model.version != FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion(model.version));
        }

        log::debug!(
            "Loaded model {:?}: {} samples, labels {:?}",
            path,
            model.samples.len(),
            model.samples.iter().map(|s| s.label).collect::<Vec<_>>()
        );

        Ok(Self { model })
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let data = bincode::serialize(&self.model)
            .map_err(|e| ModelError::Serialization(e.to_string()))?;

        // Readers only ever see a complete model file
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data)?;

        // Set permissions to 600 (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn predict(&self, face: &GrayImage) -> Result<Prediction, ModelError> {
        if self.model.samples.is_empty() {
            return Err(ModelError::Empty);
        }

        let query = self.spatial_histogram(face)?;

        let mut best: Option<Prediction> = None;
        for sample in &self.model.samples {
            let distance = chi_square(&query, &sample.histogram);
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction {
                    label: sample.label,
                    distance,
                });
            }
        }

        best.ok_or(ModelError::Empty)
    }

    fn update(&mut self, faces: &[GrayImage], labels: &[i32]) -> Result<(), ModelError> {
        if faces.is_empty() {
            return Err(ModelError::InvalidInput("no faces given".to_string()));
        }
        if faces.len() != labels.len() {
            return Err(ModelError::InvalidInput(format!(
                "{} faces but {} labels",
                faces.len(),
                labels.len()
            )));
        }

        // Compute everything first so a bad image leaves the model untouched
        let samples = faces
            .iter()
            .zip(labels)
            .map(|(face, &label)| {
                Ok(Sample {
                    label,
                    histogram: self.spatial_histogram(face)?,
                })
            })
            .collect::<Result<Vec<_>, ModelError>>()?;

        self.model.samples.extend(samples);
        self.model.updated_at = Some(Utc::now());
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.model.samples.is_empty()
    }

    fn labels(&self) -> Vec<i32> {
        let mut labels: Vec<i32> = self.model.samples.iter().map(|s| s.label).collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }
}
