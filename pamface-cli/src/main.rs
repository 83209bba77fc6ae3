use clap::{Parser, Subcommand};
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use pamface_core::capture::{Camera, CameraSource};
use pamface_core::config::{Config, ModuleSettings};
use pamface_core::detect::{DetectionParams, FaceDetector, ScrfdDetector};
use pamface_core::model::{LbphRecognizer, Recognizer};
use pamface_core::runtime::OnnxRuntime;
use pamface_core::{AuthRequest, Authenticator, Conversation, Outcome};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "pamface")]
#[command(about = "Face authentication for Linux-PAM", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity model file
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Face detector ONNX model
    #[arg(long, global = true)]
    detector: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full authentication attempt for a user
    Test {
        /// Username to authenticate
        username: String,
    },
    /// Capture a frame and mark detected faces
    Snapshot {
        /// Output file path
        output: PathBuf,
    },
    /// Show configuration
    Config {
        /// Validate configuration
        #[arg(long)]
        validate: bool,
    },
    /// Show what the identity model contains
    Model,
    /// List video devices
    Devices,
}

impl Cli {
    fn settings(&self) -> ModuleSettings {
        let mut settings = ModuleSettings::default();
        if let Some(path) = &self.config {
            settings.config_path = path.clone();
        }
        if let Some(path) = &self.model {
            settings.model_path = path.clone();
        }
        if let Some(path) = &self.detector {
            settings.detector_model_path = path.clone();
        }
        settings
    }
}

/// Prints status messages to the terminal
struct TerminalConversation;

impl Conversation for TerminalConversation {
    fn send(&self, message: &str, is_error: bool) -> Result<(), String> {
        if is_error {
            eprintln!("{}", message);
        } else {
            println!("{}", message);
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let settings = cli.settings();

    match cli.command {
        Commands::Test { username } => cmd_test(settings, username),
        Commands::Snapshot { output } => cmd_snapshot(&settings, output),
        Commands::Config { validate } => cmd_config(&settings, validate),
        Commands::Model => cmd_model(&settings),
        Commands::Devices => cmd_devices(),
    }
}

fn cmd_test(settings: ModuleSettings, username: String) -> anyhow::Result<()> {
    println!("Testing face recognition for user: {}", username);
    println!("\nLook at the camera...");

    let request = AuthRequest {
        remote_user: None,
        user: Some(username),
        service: Some("pamface-cli".to_string()),
    };

    let authenticator = Authenticator::new(settings);
    let start = Instant::now();
    let outcome = authenticator.authenticate(&request, &TerminalConversation);
    let duration = start.elapsed();

    println!();
    match outcome {
        Outcome::Granted => println!("✅ Access granted"),
        Outcome::Denied => println!("❌ Access denied: face not recognized"),
        Outcome::UnknownUser => println!("❌ Unknown user"),
        Outcome::Ignore => println!("⚠️  Ignored: no decision was made (see log output)"),
    }
    println!("Total time: {:.2}ms", duration.as_secs_f64() * 1000.0);

    Ok(())
}

fn cmd_snapshot(settings: &ModuleSettings, output: PathBuf) -> anyhow::Result<()> {
    println!("Capturing snapshot to: {}", output.display());

    let config = Config::load(&settings.config_path)?;
    let mut camera = Camera::open(
        &config.global.camera,
        config.global.width,
        config.global.height,
    )?;
    let mut frame = camera.capture_rgb()?;
    drop(camera);

    let runtime = OnnxRuntime::new()?;
    let mut detector = ScrfdDetector::new(&settings.detector_model_path, &runtime)?;
    let gray = image::imageops::grayscale(&frame);
    let faces = detector.detect(&gray, &DetectionParams::default())?;

    // First region in green (the one used for recognition), others in red
    for (idx, face) in faces.iter().enumerate() {
        let color = if idx == 0 {
            Rgb([0, 255, 0])
        } else {
            Rgb([255, 0, 0])
        };
        let rect = Rect::at(face.x as i32, face.y as i32).of_size(face.width, face.height);
        draw_hollow_rect_mut(&mut frame, rect, color);
    }

    frame.save(&output)?;

    println!("✓ Snapshot saved: {}", output.display());
    println!("Resolution: {}x{}", frame.width(), frame.height());
    println!("Faces detected: {}", faces.len());

    Ok(())
}

fn cmd_config(settings: &ModuleSettings, validate: bool) -> anyhow::Result<()> {
    let config = Config::load(&settings.config_path)?;

    if validate {
        println!("✓ Configuration is valid");
        return Ok(());
    }

    println!("Configuration: {}", settings.config_path.display());
    println!();

    println!("[Global]");
    match &config.global.camera {
        CameraSource::Index(index) => println!("  Camera = {}", index),
        CameraSource::Path(path) => println!("  Camera = {:?}", path),
    }
    println!("  Resolution = {}x{}", config.global.width, config.global.height);
    println!();

    println!("[Authentication]");
    println!("  Threshold = {}", config.authentication.threshold);
    println!("  MaxAttempts = {}", config.authentication.max_attempts);
    println!("  Timeout = {}s", config.authentication.timeout_secs);
    println!();

    println!("[Users]");
    if config.users.is_empty() {
        println!("  (none)");
    }
    for (user, label) in &config.users {
        println!("  {} = {}", user, label);
    }
    println!();

    println!("Model file: {}", settings.model_path.display());
    println!("Detector model: {}", settings.detector_model_path.display());

    Ok(())
}

fn cmd_model(settings: &ModuleSettings) -> anyhow::Result<()> {
    let recognizer = LbphRecognizer::load(&settings.model_path)?;

    println!("Model file: {}", settings.model_path.display());

    if recognizer.is_empty() {
        println!("No user trained yet");
        return Ok(());
    }

    let model = recognizer.model();
    println!("Samples: {}", model.samples.len());
    println!("Grid: {}x{}", model.params.grid_x, model.params.grid_y);
    if let Some(updated_at) = model.updated_at {
        println!("Updated: {}", updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    // Usernames are optional here; the model may be inspected without a config
    let config = Config::load(&settings.config_path).ok();

    println!();
    println!("{:<8} {:<10} {}", "Label", "Samples", "User");
    println!("{}", "-".repeat(40));
    for label in recognizer.labels() {
        let samples = model.samples.iter().filter(|s| s.label == label).count();
        let user = config
            .as_ref()
            .and_then(|c| c.users.iter().find(|(_, l)| **l == label))
            .map(|(name, _)| name.as_str())
            .unwrap_or("-");
        println!("{:<8} {:<10} {}", label, samples, user);
    }

    Ok(())
}

fn cmd_devices() -> anyhow::Result<()> {
    let devices = Camera::list_devices()?;

    if devices.is_empty() {
        println!("No video devices found");
    }
    for device in devices {
        println!("{}", device);
    }

    Ok(())
}
