use pamface_core::config::ModuleSettings;
use pamface_core::{AuthRequest, Authenticator, Conversation, Outcome};
use pamsm::{Pam, PamError, PamFlag, PamLibExt, PamMsgStyle, PamServiceModule};
use std::ffi::CStr;
use std::panic;
use std::sync::Once;
use syslog::{BasicLogger, Facility, Formatter3164};

static LOGGER: Once = Once::new();

/// Forwards records to syslog with the module prefix.
struct AuditLogger(BasicLogger);

impl log::Log for AuditLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        self.0.log(
            &log::Record::builder()
                .args(format_args!("PAM Face: {}", record.args()))
                .level(record.level())
                .target(record.target())
                .build(),
        );
    }

    fn flush(&self) {
        self.0.flush();
    }
}

/// Route `log` output to the authentication facility (ignore errors)
fn init_logging() {
    LOGGER.call_once(|| {
        #[cfg(debug_assertions)]
        let log_level = log::LevelFilter::Debug;
        #[cfg(not(debug_assertions))]
        let log_level = log::LevelFilter::Info;

        let formatter = Formatter3164 {
            facility: Facility::LOG_AUTH,
            hostname: None,
            process: "pam_face".to_string(),
            pid: std::process::id(),
        };

        if let Ok(logger) = syslog::unix(formatter) {
            let audit = AuditLogger(BasicLogger::new(logger));
            if log::set_boxed_logger(Box::new(audit)).is_ok() {
                log::set_max_level(log_level);
            }
        }
    });
}

/// Host result code for an outcome
fn pam_code(outcome: Outcome) -> PamError {
    match outcome {
        Outcome::Granted => PamError::SUCCESS,
        Outcome::Denied => PamError::AUTH_ERR,
        Outcome::UnknownUser => PamError::USER_UNKNOWN,
        Outcome::Ignore => PamError::IGNORE,
    }
}

/// PAM conversation used for status messages
struct PamConversation<'a> {
    pamh: &'a Pam,
}

impl Conversation for PamConversation<'_> {
    fn send(&self, message: &str, is_error: bool) -> Result<(), String> {
        let style = if is_error {
            PamMsgStyle::ERROR_MSG
        } else {
            PamMsgStyle::TEXT_INFO
        };

        self.pamh
            .conv(Some(message), style)
            .map(|_| ())
            .map_err(|e| format!("Failed to show message: {:?}", e))
    }
}

fn item_string(item: Result<Option<&CStr>, PamError>) -> Option<String> {
    item.ok()
        .flatten()
        .map(|cstr| cstr.to_string_lossy().into_owned())
}

struct PamFace;

impl PamServiceModule for PamFace {
    fn authenticate(pamh: Pam, _flags: PamFlag, args: Vec<String>) -> PamError {
        init_logging();

        // Panics must not cross the FFI boundary
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            authenticate_impl(&pamh, &args)
        }));

        match result {
            Ok(outcome) => pam_code(outcome),
            Err(_) => {
                log::error!("Panic caught during authentication!");
                PamError::IGNORE
            }
        }
    }

    fn setcred(_pamh: Pam, _flags: PamFlag, _args: Vec<String>) -> PamError {
        PamError::SUCCESS
    }

    fn acct_mgmt(_pamh: Pam, _flags: PamFlag, _args: Vec<String>) -> PamError {
        PamError::SUCCESS
    }

    fn open_session(_pamh: Pam, _flags: PamFlag, _args: Vec<String>) -> PamError {
        PamError::SUCCESS
    }

    fn close_session(_pamh: Pam, _flags: PamFlag, _args: Vec<String>) -> PamError {
        PamError::SUCCESS
    }

    fn chauthtok(_pamh: Pam, _flags: PamFlag, _args: Vec<String>) -> PamError {
        PamError::SUCCESS
    }
}

fn authenticate_impl(pamh: &Pam, args: &[String]) -> Outcome {
    let settings = match ModuleSettings::from_args(args) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{}", e);
            return Outcome::Ignore;
        }
    };

    // The requesting user wins; only ask for the target user when it is unset
    let remote_user = item_string(pamh.get_ruser()).filter(|name| !name.is_empty());
    let user = match remote_user {
        Some(_) => None,
        None => item_string(pamh.get_user(None)),
    };

    let request = AuthRequest {
        remote_user,
        user,
        service: item_string(pamh.get_service()),
    };

    Authenticator::new(settings).authenticate(&request, &PamConversation { pamh })
}

pamsm::pam_module!(PamFace);
