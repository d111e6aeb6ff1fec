//! SoundVault CLI - Command line interface for the encrypted music vault.
//!
//! Accounts, key profiles and track records live in a local SQLite file;
//! encrypted blobs go to the configured storage backend.

mod config;
mod local_store;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use soundvault_common::{TrackId, UserId};
use soundvault_crypto::CONTENT_OVERHEAD;
use soundvault_storage::{create_default_registry, CloudStorage};
use soundvault_vault::{
    Library, PasswordChangeRequest, RetrievalPipeline, TrackStore, UploadJournal, UploadProgress,
    VaultOperations, VaultReencryptor, VaultSession,
};

use crate::config::CliConfig;
use crate::local_store::LocalStore;

const DATABASE_FILE: &str = "soundvault.db";

#[derive(Parser)]
#[command(name = "soundvault")]
#[command(about = "SoundVault - Client-side encrypted music storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding settings, the database and pending uploads.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account and its key profile.
    Signup {
        #[arg(short, long)]
        user: String,
    },

    /// Encrypt and upload audio files.
    Upload {
        #[arg(short, long)]
        user: String,

        /// Artist recorded for every uploaded file.
        #[arg(short, long)]
        artist: Option<String>,

        /// Audio files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List stored tracks, newest first.
    List {
        #[arg(short, long)]
        user: String,
    },

    /// Download and decrypt a track.
    Fetch {
        #[arg(short, long)]
        user: String,

        /// Track id as shown by `list`.
        #[arg(short, long)]
        track: String,

        /// Output file.
        #[arg(short, long)]
        out: PathBuf,

        /// Record the track length in seconds if it is not known yet.
        #[arg(long)]
        duration: Option<u32>,
    },

    /// Finish uploads interrupted by a crash or network failure.
    Resume {
        #[arg(short, long)]
        user: String,
    },

    /// Change the account password and re-encrypt every track.
    ChangePassword {
        #[arg(short, long)]
        user: String,
    },

    /// Show settings and backend information.
    Info,
}

/// Everything a command needs, opened from the data directory.
struct App {
    data_dir: PathBuf,
    config: CliConfig,
    store: Arc<LocalStore>,
    storage: Arc<dyn CloudStorage>,
    session: Arc<VaultSession>,
}

impl App {
    fn open(data_dir: PathBuf) -> Result<Self> {
        let config = CliConfig::load_or_init(&data_dir)?;
        let store = LocalStore::open(data_dir.join(DATABASE_FILE))
            .context("Failed to open the local database")?;
        let registry = create_default_registry()?;
        let storage = registry
            .resolve(&config.backend, config.backend_config.clone())
            .with_context(|| format!("Failed to open backend '{}'", config.backend))?;

        Ok(Self {
            data_dir,
            config,
            store: Arc::new(store),
            storage,
            session: Arc::new(VaultSession::new()),
        })
    }

    /// Check the account password and unlock the session.
    async fn sign_in(&self, user: &UserId) -> Result<()> {
        let password = prompt_password("Password: ")?;
        self.store
            .sign_in(user, &password)
            .context("Sign-in failed")?;
        self.session
            .sign_in(user, &password, self.store.as_ref(), &self.config.vault.kdf_params)
            .await
            .context("Failed to unlock the vault")?;
        Ok(())
    }

    async fn operations(&self) -> Result<VaultOperations> {
        let journal = UploadJournal::open(self.data_dir.join("pending"))
            .await
            .context("Failed to open the upload journal")?;
        Ok(VaultOperations::new(
            self.session.clone(),
            self.storage.clone(),
            self.store.clone(),
            Arc::new(journal),
            self.config.vault.clone(),
        )?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let app = App::open(data_dir)?;

    match cli.command {
        Commands::Signup { user } => cmd_signup(&app, &user).await,
        Commands::Upload {
            user,
            artist,
            files,
        } => cmd_upload(&app, &user, artist, &files).await,
        Commands::List { user } => cmd_list(&app, &user).await,
        Commands::Fetch {
            user,
            track,
            out,
            duration,
        } => cmd_fetch(&app, &user, &track, &out, duration).await,
        Commands::Resume { user } => cmd_resume(&app, &user).await,
        Commands::ChangePassword { user } => cmd_change_password(&app, &user).await,
        Commands::Info => cmd_info(&app),
    }
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("soundvault"))
        .context("No data directory on this platform; pass --data-dir")
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password))
}

fn parse_user(user: &str) -> Result<UserId> {
    UserId::new(user).context("Invalid user id")
}

/// Read a file into a buffer sized for sealing without reallocation.
async fn read_track_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len() as usize;
    let mut content = Vec::with_capacity(len + CONTENT_OVERHEAD);
    file.read_to_end(&mut content).await?;
    Ok(content)
}

fn print_upload_progress(progress: UploadProgress) {
    eprint!(
        "\r  {:>5.1}% ({}/{} chunks)",
        progress.percent(),
        progress.completed_chunks,
        progress.total_chunks
    );
    let _ = std::io::stderr().flush();
}

/// Create an account.
async fn cmd_signup(app: &App, user: &str) -> Result<()> {
    let user = parse_user(user)?;
    let password = prompt_password("New password: ")?;
    let confirm = prompt_password("Confirm password: ")?;

    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }
    if password.chars().count() < app.config.vault.min_password_length {
        anyhow::bail!(
            "Password must be at least {} characters",
            app.config.vault.min_password_length
        );
    }

    app.store
        .register(&user, &password)
        .context("Failed to create account")?;
    app.session
        .sign_up(&user, &password, app.store.as_ref(), &app.config.vault.kdf_params)
        .await
        .context("Failed to create key profile")?;

    println!("Account created: {}", user);
    Ok(())
}

/// Upload audio files.
async fn cmd_upload(
    app: &App,
    user: &str,
    artist: Option<String>,
    files: &[PathBuf],
) -> Result<()> {
    let user = parse_user(user)?;
    app.sign_in(&user).await?;
    let ops = app.operations().await?;

    let mut failed = 0;
    for path in files {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Bad file name: {}", path.display()))?;
        let content = read_track_file(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        println!("Uploading {}", name);
        match ops
            .upload_track(name, content, artist.clone(), print_upload_progress)
            .await
        {
            Ok(track) => {
                eprintln!();
                println!("  Stored as {} ({})", track.id, track.mime_type);
            }
            Err(e) => {
                eprintln!();
                warn!("Upload of {} failed: {}", name, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!(
            "{} of {} uploads failed; run `soundvault resume` to retry",
            failed,
            files.len()
        );
    }
    Ok(())
}

/// List tracks.
async fn cmd_list(app: &App, user: &str) -> Result<()> {
    let user = parse_user(user)?;
    app.sign_in(&user).await?;

    let library = Library::new(
        app.store.clone(),
        app.store.clone(),
        app.config.vault.library_timeout(),
    );
    let tracks = library.load().await.context("Failed to load the library")?;

    if tracks.is_empty() {
        println!("No tracks yet.");
        return Ok(());
    }

    for track in tracks {
        let duration = track
            .duration_secs
            .map(|s| format!("{}:{:02}", s / 60, s % 60))
            .unwrap_or_else(|| "--:--".to_string());
        println!(
            "{}  {:>6}  {}{}  [{}]  {}",
            track.id,
            duration,
            track.title,
            track
                .artist
                .as_deref()
                .map(|a| format!(" - {}", a))
                .unwrap_or_default(),
            track.mime_type,
            track.created_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

/// Download and decrypt a track.
async fn cmd_fetch(
    app: &App,
    user: &str,
    track: &str,
    out: &Path,
    duration: Option<u32>,
) -> Result<()> {
    let user = parse_user(user)?;
    let track_id = TrackId::new(track).context("Invalid track id")?;
    app.sign_in(&user).await?;

    let track = app
        .store
        .get_track(&track_id)
        .await?
        .with_context(|| format!("Track {} not found", track_id))?;

    let retrieval = RetrievalPipeline::new(app.session.clone(), app.storage.clone());
    let source = retrieval
        .load_track(&track)
        .await
        .context("Failed to load track")?;

    tokio::fs::write(out, source.data())
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!("Wrote {} bytes of {} to {}", source.len(), source.mime_type, out.display());

    if let Some(secs) = duration {
        let library = Library::new(
            app.store.clone(),
            app.store.clone(),
            app.config.vault.library_timeout(),
        );
        if library.backfill_duration(&track.id, secs).await? {
            info!("Recorded duration of {} seconds", secs);
        }
    }
    Ok(())
}

/// Retry staged uploads.
async fn cmd_resume(app: &App, user: &str) -> Result<()> {
    let user = parse_user(user)?;
    app.sign_in(&user).await?;
    let ops = app.operations().await?;

    let pending = ops.pending().await?;
    if pending.is_empty() {
        println!("Nothing to resume.");
        return Ok(());
    }
    println!("Resuming {} upload(s)", pending.len());

    let recorded = ops.resume_pending().await.context("Resume failed")?;
    for track in &recorded {
        println!("  Stored {} as {}", track.title, track.id);
    }
    let left = pending.len() - recorded.len();
    if left > 0 {
        println!("{} upload(s) were dropped; see the log for details", left);
    }
    Ok(())
}

/// Change the account password.
async fn cmd_change_password(app: &App, user: &str) -> Result<()> {
    let user = parse_user(user)?;
    app.sign_in(&user).await?;

    let old = prompt_password("Current password: ")?;
    let new = prompt_password("New password: ")?;
    let confirm = prompt_password("Confirm new password: ")?;
    let request = PasswordChangeRequest::new(old.as_str(), new.as_str(), confirm.as_str());

    let reencryptor = VaultReencryptor::new(
        app.session.clone(),
        app.store.clone(),
        app.store.clone(),
        app.store.clone(),
        app.storage.clone(),
        app.config.vault.clone(),
    );

    let mut phases = reencryptor.subscribe();
    let watcher = tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow();
            info!("Password change: {}", phase);
        }
    });

    let result = reencryptor
        .change_password(request, |p| {
            println!("  [{}/{}] {}", p.current, p.total, p.label);
        })
        .await;
    drop(reencryptor);
    let _ = watcher.await;

    let report = result?;
    println!(
        "Password changed. {} track(s) re-encrypted, {} already current.",
        report.migrated, report.skipped
    );
    println!("You have been signed out; sign in with the new password.");
    Ok(())
}

/// Show settings.
fn cmd_info(app: &App) -> Result<()> {
    let registry = create_default_registry()?;

    println!("SoundVault");
    println!("  Data directory: {}", app.data_dir.display());
    println!("  Settings: {}", CliConfig::path(&app.data_dir).display());
    println!("  Backend: {} ({})", app.config.backend, app.storage.name());
    println!("  Available backends: {}", registry.backends().join(", "));
    println!("  Chunk size: {} bytes", app.config.vault.chunk_size);
    println!(
        "  KDF: PBKDF2-SHA256, {} iterations",
        app.config.vault.kdf_params.iterations
    );
    println!(
        "  Accepted formats: {}",
        app.config.vault.audio_extensions.join(", ")
    );
    Ok(())
}
