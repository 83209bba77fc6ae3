//! One authentication attempt from the host's point of view.
//!
//! [`Authenticator::authenticate`] resolves the requesting user, checks the
//! preconditions (trained model, readable configuration, enrolled user), runs
//! the capture-and-predict loop and turns every possible failure into one of
//! the four [`Outcome`]s. Nothing escapes as an error.

use crate::config::{Config, ModuleSettings};
use crate::decision::{decide, Outcome};
use crate::model::ModelError;
use crate::recognizer::FaceRecognizer;
use crate::session::{capture_and_predict, LoopPolicy};
use crate::Error;
use std::fs;

/// Who is asking, as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    /// Remote (requesting) user, preferred when present
    pub remote_user: Option<String>,
    /// Target user, used as a fallback
    pub user: Option<String>,
    pub service: Option<String>,
}

impl AuthRequest {
    /// The requesting username; empty names do not count
    pub fn username(&self) -> Option<&str> {
        [&self.remote_user, &self.user]
            .into_iter()
            .flatten()
            .map(|name| name.as_str())
            .find(|name| !name.is_empty())
    }
}

/// Text channel to the person authenticating.
pub trait Conversation {
    /// Show `message`, styled as an error when `is_error` is set
    fn send(&self, message: &str, is_error: bool) -> Result<(), String>;
}

/// Builds the recognizer used for one attempt.
pub trait RecognizerFactory {
    fn open(&self, config: &Config, settings: &ModuleSettings) -> Result<FaceRecognizer, Error>;
}

/// Opens the real camera, detector model and identity model.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceRecognizerFactory;

impl RecognizerFactory for DeviceRecognizerFactory {
    fn open(&self, config: &Config, settings: &ModuleSettings) -> Result<FaceRecognizer, Error> {
        FaceRecognizer::open(config, settings)
    }
}

pub struct Authenticator<F: RecognizerFactory = DeviceRecognizerFactory> {
    settings: ModuleSettings,
    factory: F,
}

impl Authenticator<DeviceRecognizerFactory> {
    pub fn new(settings: ModuleSettings) -> Self {
        Self::with_factory(settings, DeviceRecognizerFactory)
    }
}

impl<F: RecognizerFactory> Authenticator<F> {
    pub fn with_factory(settings: ModuleSettings, factory: F) -> Self {
        Self { settings, factory }
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.settings
    }

    /// Run one authentication attempt and report its outcome
    pub fn authenticate(&self, request: &AuthRequest, conversation: &dyn Conversation) -> Outcome {
        match self.run(request, conversation) {
            Ok(outcome) => outcome,
            Err(Error::UserUnknown) => {
                log::error!("The user is not known!");
                Outcome::UnknownUser
            }
            Err(e) => {
                log::error!("{}", e);
                Outcome::Ignore
            }
        }
    }

    fn run(&self, request: &AuthRequest, conversation: &dyn Conversation) -> Result<Outcome, Error> {
        let username = request.username().ok_or(Error::UserUnknown)?;

        let model_path = &self.settings.model_path;
        let model_size = fs::metadata(model_path)
            .map_err(|e| {
                Error::Other(format!(
                    "The models file \"{}\" is not readable: {}",
                    model_path.display(),
                    e
                ))
            })?
            .len();
        if model_size == 0 {
            return Err(Error::Model(ModelError::Empty));
        }

        let config_path = &self.settings.config_path;
        let config = Config::load(config_path).map_err(|e| {
            Error::Other(format!(
                "The configuration file \"{}\" is not usable: {}",
                config_path.display(),
                e
            ))
        })?;

        log::info!(
            "The user \"{}\" is asking for permission for service \"{}\".",
            username,
            request.service.as_deref().unwrap_or("unknown")
        );

        let user_label = config
            .user_label(username)
            .ok_or_else(|| Error::UserNotAdded(username.to_string()))?;
        let policy = LoopPolicy::from(&config.authentication);

        let mut recognizer = self.factory.open(&config, &self.settings)?;
        if recognizer.model_is_empty() {
            return Err(Error::Model(ModelError::Empty));
        }

        self.notify(conversation, "Recognizing face ...", false);

        let result = capture_and_predict(&mut recognizer, &policy)?;
        drop(recognizer);

        log::debug!(
            "Stopped after {} attempt(s) with label {} at distance {:.2}",
            result.attempts,
            result.prediction.label,
            result.prediction.distance
        );

        let outcome = decide(user_label, &result.prediction, policy.threshold);
        match outcome {
            Outcome::Granted => {
                log::info!("Access granted!");
                self.notify(conversation, "Access granted!", false);
            }
            _ => {
                log::warn!("Face not recognized!");
                self.notify(conversation, "Access denied!", true);
            }
        }

        Ok(outcome)
    }

    /// Send a user-facing message; delivery failures are only logged
    fn notify(&self, conversation: &dyn Conversation, message: &str, is_error: bool) {
        let text = format!("PAM Face {}: {}", self.settings.version, message);
        if let Err(e) = conversation.send(&text, is_error) {
            log::error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;
    use crate::model::Prediction;
    use crate::recognizer::tests::{FakeCamera, FakeDetector, ScriptedModel};
    use std::cell::{Cell, RefCell};
    use std::path::PathBuf;
    use std::rc::Rc;
    use std::sync::{Mutex, Once};
    use std::time::Duration;

    const CONFIG: &str = r#"
[Global]
Camera = 0

[Authentication]
Threshold = 50

[Users]
alice = 3
"#;

    #[derive(Default)]
    struct RecordingConversation {
        messages: RefCell<Vec<(String, bool)>>,
        broken: bool,
    }

    impl Conversation for RecordingConversation {
        fn send(&self, message: &str, is_error: bool) -> Result<(), String> {
            if self.broken {
                return Err("conversation unavailable".to_string());
            }
            self.messages.borrow_mut().push((message.to_string(), is_error));
            Ok(())
        }
    }

    impl RecordingConversation {
        fn texts(&self) -> Vec<String> {
            self.messages.borrow().iter().map(|(m, _)| m.clone()).collect()
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        predictions: Vec<Prediction>,
        frames: usize,
        fail_open: bool,
        delay: Option<Duration>,
        opens: Cell<usize>,
        reads: Rc<Cell<usize>>,
        releases: Rc<Cell<usize>>,
    }

    impl FakeFactory {
        fn scripted(predictions: Vec<Prediction>) -> Self {
            Self {
                frames: predictions.len(),
                predictions,
                ..Self::default()
            }
        }
    }

    impl RecognizerFactory for FakeFactory {
        fn open(&self, config: &Config, _settings: &ModuleSettings) -> Result<FaceRecognizer, Error> {
            assert_eq!(config.authentication.threshold, 50);
            self.opens.set(self.opens.get() + 1);
            if self.fail_open {
                return Err(Error::Capture(CaptureError::DeviceOpen("busy".to_string())));
            }

            let mut camera = FakeCamera::new(self.frames);
            camera.delay = self.delay;
            camera.reads = Rc::clone(&self.reads);
            camera.releases = Rc::clone(&self.releases);

            Ok(FaceRecognizer::from_parts(
                Box::new(camera),
                Box::new(FakeDetector {
                    regions: Vec::new(),
                    fail: false,
                }),
                Box::new(ScriptedModel::new(self.predictions.clone())),
                "unused.bin",
            ))
        }
    }

    /// Records every log line so tests can check levels
    struct CapturingLogger;

    static RECORDS: Mutex<Vec<(log::Level, String)>> = Mutex::new(Vec::new());
    static CAPTURE: CapturingLogger = CapturingLogger;

    impl log::Log for CapturingLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            if let Ok(mut records) = RECORDS.lock() {
                records.push((record.level(), record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    fn capture_logs() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = log::set_logger(&CAPTURE);
            log::set_max_level(log::LevelFilter::Trace);
        });
    }

    fn logged(fragment: &str) -> Vec<(log::Level, String)> {
        RECORDS
            .lock()
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, message)| message.contains(fragment))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Scratch directory holding a config file and a model file
    struct Fixture {
        dir: PathBuf,
        settings: ModuleSettings,
    }

    impl Fixture {
        fn new(name: &str, config: Option<&str>, model: &[u8]) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "pamface-test-auth-{}-{}",
                name,
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();

            let config_path = dir.join("config.toml");
            if let Some(text) = config {
                fs::write(&config_path, text).unwrap();
            }

            let model_path = dir.join("models.bin");
            fs::write(&model_path, model).unwrap();

            let settings = ModuleSettings {
                version: "1.0".to_string(),
                config_path,
                model_path,
                detector_model_path: dir.join("detector.onnx"),
            };

            Self { dir, settings }
        }

        fn trained(name: &str) -> Self {
            Self::new(name, Some(CONFIG), b"trained")
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn alice() -> AuthRequest {
        AuthRequest {
            remote_user: None,
            user: Some("alice".to_string()),
            service: Some("login".to_string()),
        }
    }

    fn prediction(label: i32, distance: f64) -> Prediction {
        Prediction { label, distance }
    }

    #[test]
    fn test_username_resolution() {
        let request = AuthRequest {
            remote_user: Some("bob".to_string()),
            user: Some("alice".to_string()),
            service: None,
        };
        assert_eq!(request.username(), Some("bob"));

        let request = AuthRequest {
            remote_user: Some(String::new()),
            user: Some("alice".to_string()),
            service: None,
        };
        assert_eq!(request.username(), Some("alice"));

        let request = AuthRequest {
            remote_user: None,
            user: Some(String::new()),
            service: None,
        };
        assert_eq!(request.username(), None);
        assert_eq!(AuthRequest::default().username(), None);
    }

    #[test]
    fn test_granted_on_first_attempt() {
        let fixture = Fixture::trained("granted");
        let factory = FakeFactory::scripted(vec![prediction(3, 40.0); 30]);
        let reads = Rc::clone(&factory.reads);
        let releases = Rc::clone(&factory.releases);
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);
        let conversation = RecordingConversation::default();

        let outcome = authenticator.authenticate(&alice(), &conversation);

        assert_eq!(outcome, Outcome::Granted);
        assert_eq!(reads.get(), 1);
        assert_eq!(releases.get(), 1);
        assert_eq!(
            *conversation.messages.borrow(),
            vec![
                ("PAM Face 1.0: Recognizing face ...".to_string(), false),
                ("PAM Face 1.0: Access granted!".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_denied_after_all_attempts() {
        let fixture = Fixture::trained("denied");
        let factory = FakeFactory::scripted(vec![prediction(7, 80.0); 30]);
        let reads = Rc::clone(&factory.reads);
        let releases = Rc::clone(&factory.releases);
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);
        let conversation = RecordingConversation::default();

        let outcome = authenticator.authenticate(&alice(), &conversation);

        assert_eq!(outcome, Outcome::Denied);
        assert_eq!(reads.get(), 30);
        assert_eq!(releases.get(), 1);
        assert_eq!(
            conversation.messages.borrow().last(),
            Some(&("PAM Face 1.0: Access denied!".to_string(), true))
        );
    }

    #[test]
    fn test_denied_when_deadline_passes_on_slow_camera() {
        let config = CONFIG.replace("Threshold = 50", "Threshold = 50\nTimeout = 1");
        let fixture = Fixture::new("slow-camera", Some(&config), b"trained");
        let factory = FakeFactory {
            delay: Some(Duration::from_millis(100)),
            ..FakeFactory::scripted(vec![prediction(7, 80.0); 30])
        };
        let reads = Rc::clone(&factory.reads);
        let releases = Rc::clone(&factory.releases);
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);
        let conversation = RecordingConversation::default();

        let outcome = authenticator.authenticate(&alice(), &conversation);

        assert_eq!(outcome, Outcome::Denied);
        assert!(reads.get() < 30);
        assert_eq!(releases.get(), 1);
        assert_eq!(
            conversation.messages.borrow().last(),
            Some(&("PAM Face 1.0: Access denied!".to_string(), true))
        );
    }

    #[test]
    fn test_attempt_start_logged_at_info() {
        capture_logs();
        let fixture = Fixture::trained("audit-start");
        let factory = FakeFactory::scripted(vec![prediction(3, 10.0)]);
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);

        let request = AuthRequest {
            service: Some("audit-start-service".to_string()),
            ..alice()
        };
        assert_eq!(
            authenticator.authenticate(&request, &RecordingConversation::default()),
            Outcome::Granted
        );

        let start = logged("audit-start-service");
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].0, log::Level::Info);
        assert_eq!(
            start[0].1,
            "The user \"alice\" is asking for permission for service \"audit-start-service\"."
        );
    }

    #[test]
    fn test_denied_when_close_match_is_someone_else() {
        let fixture = Fixture::trained("other-label");
        let factory = FakeFactory::scripted(vec![prediction(7, 10.0)]);
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);

        let outcome = authenticator.authenticate(&alice(), &RecordingConversation::default());
        assert_eq!(outcome, Outcome::Denied);
    }

    #[test]
    fn test_unknown_user_without_capture() {
        let fixture = Fixture::trained("unknown");
        let factory = FakeFactory::scripted(vec![prediction(3, 1.0)]);
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);
        let conversation = RecordingConversation::default();

        let request = AuthRequest {
            remote_user: Some(String::new()),
            user: None,
            service: None,
        };
        let outcome = authenticator.authenticate(&request, &conversation);

        assert_eq!(outcome, Outcome::UnknownUser);
        assert_eq!(authenticator.factory.opens.get(), 0);
        assert!(conversation.messages.borrow().is_empty());
    }

    #[test]
    fn test_ignore_when_config_unreadable() {
        let fixture = Fixture::new("no-config", None, b"trained");
        let authenticator =
            Authenticator::with_factory(fixture.settings.clone(), FakeFactory::default());
        let conversation = RecordingConversation::default();

        assert_eq!(
            authenticator.authenticate(&alice(), &conversation),
            Outcome::Ignore
        );
        assert_eq!(authenticator.factory.opens.get(), 0);
        assert!(conversation.messages.borrow().is_empty());
    }

    #[test]
    fn test_ignore_when_config_invalid() {
        let fixture = Fixture::new("bad-config", Some("[Global]\nCamera = 0\n"), b"trained");
        let authenticator =
            Authenticator::with_factory(fixture.settings.clone(), FakeFactory::default());

        assert_eq!(
            authenticator.authenticate(&alice(), &RecordingConversation::default()),
            Outcome::Ignore
        );
        assert_eq!(authenticator.factory.opens.get(), 0);
    }

    #[test]
    fn test_ignore_when_no_user_trained() {
        let fixture = Fixture::new("untrained", Some(CONFIG), b"");
        let authenticator =
            Authenticator::with_factory(fixture.settings.clone(), FakeFactory::default());
        let conversation = RecordingConversation::default();

        assert_eq!(
            authenticator.authenticate(&alice(), &conversation),
            Outcome::Ignore
        );
        assert_eq!(authenticator.factory.opens.get(), 0);
        assert!(conversation.messages.borrow().is_empty());
    }

    #[test]
    fn test_ignore_when_model_missing() {
        let fixture = Fixture::trained("model-missing");
        fs::remove_file(&fixture.settings.model_path).unwrap();
        let authenticator =
            Authenticator::with_factory(fixture.settings.clone(), FakeFactory::default());

        assert_eq!(
            authenticator.authenticate(&alice(), &RecordingConversation::default()),
            Outcome::Ignore
        );
        assert_eq!(authenticator.factory.opens.get(), 0);
    }

    #[test]
    fn test_ignore_when_user_not_added() {
        let fixture = Fixture::trained("not-added");
        let authenticator =
            Authenticator::with_factory(fixture.settings.clone(), FakeFactory::default());
        let conversation = RecordingConversation::default();

        let request = AuthRequest {
            remote_user: Some("mallory".to_string()),
            user: Some("alice".to_string()),
            service: None,
        };
        assert_eq!(
            authenticator.authenticate(&request, &conversation),
            Outcome::Ignore
        );
        assert_eq!(authenticator.factory.opens.get(), 0);
        assert!(conversation.messages.borrow().is_empty());
    }

    #[test]
    fn test_ignore_when_loaded_model_empty() {
        let fixture = Fixture::trained("loaded-empty");
        let factory = FakeFactory::default();
        let reads = Rc::clone(&factory.reads);
        let releases = Rc::clone(&factory.releases);
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);

        assert_eq!(
            authenticator.authenticate(&alice(), &RecordingConversation::default()),
            Outcome::Ignore
        );
        assert_eq!(reads.get(), 0);
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn test_ignore_when_device_unavailable() {
        let fixture = Fixture::trained("open-fails");
        let factory = FakeFactory {
            fail_open: true,
            ..FakeFactory::default()
        };
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);
        let conversation = RecordingConversation::default();

        assert_eq!(
            authenticator.authenticate(&alice(), &conversation),
            Outcome::Ignore
        );
        assert!(conversation.messages.borrow().is_empty());
    }

    #[test]
    fn test_ignore_on_capture_failure() {
        let fixture = Fixture::trained("capture-fails");
        // Two frames, then the device stops answering
        let factory = FakeFactory {
            frames: 2,
            ..FakeFactory::scripted(vec![prediction(7, 80.0); 30])
        };
        let reads = Rc::clone(&factory.reads);
        let releases = Rc::clone(&factory.releases);
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);
        let conversation = RecordingConversation::default();

        assert_eq!(
            authenticator.authenticate(&alice(), &conversation),
            Outcome::Ignore
        );
        assert_eq!(reads.get(), 3);
        assert_eq!(releases.get(), 1);
        assert_eq!(
            conversation.texts(),
            vec!["PAM Face 1.0: Recognizing face ...".to_string()]
        );
    }

    #[test]
    fn test_conversation_failure_keeps_outcome() {
        let fixture = Fixture::trained("conv-fails");
        let factory = FakeFactory::scripted(vec![prediction(3, 10.0)]);
        let authenticator = Authenticator::with_factory(fixture.settings.clone(), factory);
        let conversation = RecordingConversation {
            broken: true,
            ..RecordingConversation::default()
        };

        assert_eq!(
            authenticator.authenticate(&alice(), &conversation),
            Outcome::Granted
        );
    }
}
