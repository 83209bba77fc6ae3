//! Face recognition backend for the `pam_face` authentication module.
//!
//! A login attempt flows through [`auth::Authenticator`]: it builds a
//! [`recognizer::FaceRecognizer`] (camera + face detector + identity model),
//! runs [`session::capture_and_predict`] and maps the result through
//! [`decision::decide`] into an [`decision::Outcome`].

pub mod auth;
pub mod capture;
pub mod config;
pub mod decision;
pub mod detect;
pub mod model;
pub mod recognizer;
pub mod runtime;
pub mod session;

pub use auth::{AuthRequest, Authenticator, Conversation};
pub use decision::Outcome;
pub use recognizer::FaceRecognizer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Camera error: {0}")]
    Capture(#[from] capture::CaptureError),
    #[error("Detection error: {0}")]
    Detection(#[from] detect::DetectionError),
    #[error("Model error: {0}")]
    Model(#[from] model::ModelError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] runtime::RuntimeError),
    #[error("The user is not known!")]
    UserUnknown,
    #[error("The user \"{0}\" was not added!")]
    UserNotAdded(String),
    #[error("{0}")]
    Other(String),
}
