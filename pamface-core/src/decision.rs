use crate::model::Prediction;
use std::fmt;

/// Terminal result of one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Granted,
    Denied,
    /// The requesting identity could not be resolved
    UnknownUser,
    /// No biometric decision was made; the host should try other mechanisms
    Ignore,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Outcome::Granted => "granted",
            Outcome::Denied => "denied",
            Outcome::UnknownUser => "unknown user",
            Outcome::Ignore => "ignore",
        };
        f.write_str(text)
    }
}

/// Grant only when the prediction names the user's label within the threshold
pub fn decide(user_label: i32, prediction: &Prediction, threshold: f64) -> Outcome {
    if prediction.label == user_label && prediction.distance <= threshold {
        Outcome::Granted
    } else {
        Outcome::Denied
    }
}
