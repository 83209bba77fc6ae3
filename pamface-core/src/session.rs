use crate::config::AuthenticationConfig;
use crate::model::Prediction;
use crate::recognizer::FaceRecognizer;
use crate::Error;
use std::time::{Duration, Instant};

/// Limits for one run of the capture-and-predict loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopPolicy {
    pub threshold: f64,
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl From<&AuthenticationConfig> for LoopPolicy {
    fn from(config: &AuthenticationConfig) -> Self {
        Self {
            threshold: config.threshold as f64,
            max_attempts: config.max_attempts,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Prediction the loop stopped on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopResult {
    pub prediction: Prediction,
    pub attempts: u32,
}

/// Capture frames until a prediction is within the threshold, the attempts
/// run out or the deadline passes.
///
/// Each attempt predicts on the first detected face, or on the whole frame
/// when no face was found. Returns the first prediction with
/// `distance <= threshold`, otherwise the last one obtained. The deadline is
/// only checked between attempts, so at least one prediction is always made.
pub fn capture_and_predict(
    recognizer: &mut FaceRecognizer,
    policy: &LoopPolicy,
) -> Result<LoopResult, Error> {
    if policy.max_attempts == 0 {
        return Err(Error::Other("Max attempts must be greater than 0".to_string()));
    }

    let start = Instant::now();
    let mut last = None;

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 && start.elapsed() > policy.timeout {
            log::warn!("Recognition timeout after {} attempts", attempt - 1);
            break;
        }

        let (faces, frame) = recognizer.detect_faces()?;

        let prediction = match faces.first() {
            Some(region) => {
                if faces.len() > 1 {
                    log::debug!(
                        "{} faces in frame {}, using the first one",
                        faces.len(),
                        attempt
                    );
                }
                recognizer.predict(&region.crop(&frame))?
            }
            None => {
                log::debug!("No face detected in frame {}, using full frame", attempt);
                recognizer.predict(&frame)?
            }
        };

        log::debug!(
            "Attempt {}: label {} at distance {:.2}",
            attempt,
            prediction.label,
            prediction.distance
        );

        let result = LoopResult {
            prediction,
            attempts: attempt,
        };

        if prediction.distance <= policy.threshold {
            return Ok(result);
        }

        last = Some(result);
    }

    last.ok_or_else(|| Error::Other("No prediction obtained".to_string()))
}
