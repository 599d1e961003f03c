use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    AttendanceDb, AttendanceSession, AttendanceStatus, DetectionResult, Embedding, EnrolledUser,
    EuclideanMatcher, GeoOptions, GeolocationProvider, MarkOutcome, Matcher, NewUser, Scanner,
    ScannerConfig, SessionError, SharedDb, SqliteStore, SystemClock,
};
use rollcall_hw::{read_descriptor, FixedLocation, ImageDirSource, NoLocation, SidecarExtractor};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-matched attendance register")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new user (becomes the active user)
    Register {
        #[arg(short, long)]
        username: String,
        /// Full name shown in listings
        #[arg(short, long)]
        name: String,
        /// Contact email
        #[arg(short, long, default_value = "")]
        contact: String,
        /// Course the user attends (catalog id or code)
        #[arg(long)]
        course: Option<String>,
        /// Face descriptor to enroll right away
        #[arg(short, long)]
        descriptor: Option<PathBuf>,
    },
    /// Store or replace a user's face descriptor
    Enroll {
        /// User id or username
        user: String,
        #[arg(short, long)]
        descriptor: PathBuf,
    },
    /// List registered users
    Users,
    /// Show or change the active user
    Use {
        /// User id or username
        user: Option<String>,
        /// Clear the active user
        #[arg(long, conflicts_with = "user")]
        clear: bool,
    },
    /// Match a face descriptor against the roster
    Identify {
        #[arg(short, long)]
        descriptor: PathBuf,
    },
    /// Record attendance from a face descriptor
    Mark {
        #[arg(short, long)]
        descriptor: PathBuf,
        /// present, absent, late or excused
        #[arg(short, long, default_value = "present")]
        status: AttendanceStatus,
        /// Record even if the user is already marked present today
        #[arg(long)]
        force: bool,
    },
    /// Show a user's attendance, newest first
    History {
        /// User id or username (default: active user)
        user: Option<String>,
    },
    /// Export a user's attendance as CSV
    Export {
        /// User id or username (default: active user)
        user: Option<String>,
        /// Output file (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Scan replayed frames until a face matches, then record attendance
    Scan {
        /// Directory of captured frames
        #[arg(short, long)]
        frames: PathBuf,
        /// Directory of descriptor sidecars (default: next to the frames)
        #[arg(long)]
        descriptors: Option<PathBuf>,
        /// Seconds to wait for a match
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Show database and configuration status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let db = open_db(&config)?;

    match cli.command {
        Commands::Register {
            username,
            name,
            contact,
            course,
            descriptor,
        } => {
            let embedding = descriptor.as_deref().map(load_embedding).transpose()?;
            let mut db = lock(&db);
            let course_id = course.as_deref().map(|key| resolve_course(&db, key)).transpose()?;
            let user = db.register(NewUser {
                username,
                display_name: name,
                contact,
                course_id,
                embedding,
            })?;
            println!("Registered {} ({})", user.display_name, user.id);
            if user.embedding.is_none() {
                println!("No face enrolled yet; run `rollcall enroll {}`", user.username);
            }
        }
        Commands::Enroll { user, descriptor } => {
            let embedding = load_embedding(&descriptor)?;
            let dims = embedding.len();
            let mut db = lock(&db);
            let user = resolve(&db, Some(user.as_str()))?;
            db.update_embedding(&user.id, embedding)?;
            println!("Enrolled {dims}-dimensional descriptor for {}", user.display_name);
        }
        Commands::Users => {
            let db = lock(&db);
            if db.roster().is_empty() {
                println!("No users registered");
            }
            let active = db.roster().active_id();
            for user in db.roster().users() {
                let marker = if Some(user.id.as_str()) == active { "*" } else { " " };
                let face = user
                    .embedding
                    .as_ref()
                    .map_or_else(|| "no face".to_string(), |e| format!("{} dims", e.len()));
                println!(
                    "{marker} {}  {:<16} {:<24} {:<10} {}",
                    user.id,
                    user.username,
                    user.display_name,
                    user.course_id.as_deref().unwrap_or("-"),
                    face
                );
            }
        }
        Commands::Use { user, clear } => {
            let mut db = lock(&db);
            if clear {
                db.set_active(None)?;
                println!("Active user cleared");
            } else if let Some(key) = user {
                let user = resolve(&db, Some(key.as_str()))?;
                db.set_active(Some(&user.id))?;
                println!("Active user: {} ({})", user.display_name, user.id);
            } else {
                match db.roster().active() {
                    Some(user) => println!("Active user: {} ({})", user.display_name, user.id),
                    None => println!("No active user"),
                }
            }
        }
        Commands::Identify { descriptor } => {
            let probe = load_embedding(&descriptor)?;
            let db = lock(&db);
            let result = EuclideanMatcher.compare(&probe, db.roster().users(), config.similarity_threshold);
            match (result.matched, result.display_name, result.user_id) {
                (true, Some(name), Some(id)) => {
                    println!("Matched {name} ({id}), similarity {:.3}", result.similarity)
                }
                _ => println!(
                    "No match (best similarity {:.3}, threshold {:.2})",
                    result.similarity, config.similarity_threshold
                ),
            }
        }
        Commands::Mark {
            descriptor,
            status,
            force,
        } => {
            let detection = load_detection(&descriptor)?;
            let mut session = new_session(&db, &config);
            session.locate(geolocation(&config), geo_options(&config)).await;

            let matched = session.handle_detection(detection);
            if matched.is_none() {
                tracing::info!("descriptor matched no one; falling back to the active user");
            }
            if status == AttendanceStatus::Present && !force {
                let user = session
                    .recognized()
                    .cloned()
                    .or_else(|| lock(&db).roster().active().cloned())
                    .ok_or(SessionError::NoIdentity)?;
                if lock(&db).has_marked_today(&user.id) {
                    bail!(
                        "{} is already marked present today; use --force to record again",
                        user.display_name
                    );
                }
            }
            let outcome = session.mark_as(status)?;
            print_mark(&session, &outcome);
        }
        Commands::History { user } => {
            let db = lock(&db);
            let user = resolve(&db, user.as_deref())?;
            let history = db.history_for(&user.id);
            let summary = db.summary_for(&user.id);
            println!(
                "{}: {} record(s), {} present, {}% attendance",
                user.display_name,
                summary.total,
                summary.present,
                summary.rate_percent()
            );
            for event in history {
                let place = event
                    .location
                    .map(|p| format!("{:.5},{:.5}", p.latitude, p.longitude))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {}  {:<8} {:>4.0}%  {:<10} {}",
                    event.date,
                    event.time,
                    event.status,
                    event.confidence * 100.0,
                    event.course_id.as_deref().unwrap_or("-"),
                    place
                );
            }
        }
        Commands::Export { user, out } => {
            let db = lock(&db);
            let user = resolve(&db, user.as_deref())?;
            let csv = db.export_csv(&user.id);
            match out {
                Some(path) => {
                    std::fs::write(&path, &csv)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!(
                        "Exported {} record(s) for {} to {}",
                        db.history_for(&user.id).len(),
                        user.display_name,
                        path.display()
                    );
                }
                None => print!("{csv}"),
            }
        }
        Commands::Scan {
            frames,
            descriptors,
            timeout,
        } => {
            let source = Arc::new(ImageDirSource::new(&frames));
            let extractor = Arc::new(SidecarExtractor::new());
            let mut scanner = Scanner::new(
                source,
                extractor,
                ScannerConfig {
                    interval: config.scan_interval(),
                },
            );
            let location = descriptors
                .as_deref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            scanner.load(&location).await?;

            let mut session = new_session(&db, &config);
            session.locate(geolocation(&config), geo_options(&config)).await;

            let limit = timeout.map_or_else(|| config.scan_timeout(), Duration::from_secs);
            println!("Scanning {} (up to {}s)...", frames.display(), limit.as_secs());
            match session.scan_until_marked(&mut scanner, limit).await {
                Ok(outcome) => print_mark(&session, &outcome),
                Err(SessionError::TimedOut(_)) => bail!("no enrolled face recognized"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Status => {
            let db = lock(&db);
            println!("Database:   {}", config.db_path.display());
            println!("Users:      {}", db.roster().len());
            match db.roster().active() {
                Some(user) => {
                    let marked = if db.has_marked_today(&user.id) { "marked" } else { "not marked" };
                    let summary = db.summary_for(&user.id);
                    println!("Active:     {} ({marked} today)", user.display_name);
                    println!(
                        "Attendance: {} present of {} ({}%)",
                        summary.present,
                        summary.total,
                        summary.rate_percent()
                    );
                }
                None => println!("Active:     none"),
            }
            println!("Records:    {}", db.ledger().len());
            println!("Courses:    {}", db.courses().len());
            println!("Threshold:  {:.2}", config.similarity_threshold);
            println!("Duplicates: {:?}", db.ledger().policy());
            match config.location {
                Some(l) => println!("Location:   {:.5},{:.5} (±{}m)", l.latitude, l.longitude, l.accuracy),
                None => println!("Location:   unavailable"),
            }
        }
    }

    let mut db = lock(&db);
    if db.is_dirty() {
        db.flush().context("saving attendance database")?;
    }
    Ok(())
}

fn open_db(config: &Config) -> Result<SharedDb> {
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let mut db = AttendanceDb::open(Box::new(store), Arc::new(SystemClock), config.dedupe)?;
    if !config.courses.is_empty() && db.courses() != config.courses.as_slice() {
        db.set_courses(config.courses.clone());
    }
    tracing::debug!(
        path = %config.db_path.display(),
        users = db.roster().len(),
        records = db.ledger().len(),
        "attendance database opened"
    );
    Ok(Arc::new(Mutex::new(db)))
}

fn lock(db: &SharedDb) -> MutexGuard<'_, AttendanceDb> {
    db.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve a catalog id or code to the course id.
fn resolve_course(db: &AttendanceDb, key: &str) -> Result<String> {
    match db.course(key) {
        Some(course) => Ok(course.id.clone()),
        None => {
            let known: Vec<&str> = db.courses().iter().map(|c| c.code.as_str()).collect();
            bail!("unknown course '{key}' (known: {})", known.join(", "))
        }
    }
}

/// Look up a user by id or username, defaulting to the active user.
fn resolve(db: &AttendanceDb, key: Option<&str>) -> Result<EnrolledUser> {
    let user = match key {
        Some(key) => db.roster().resolve(key),
        None => db.roster().active(),
    };
    match (user, key) {
        (Some(user), _) => Ok(user.clone()),
        (None, Some(key)) => bail!("no such user: {key}"),
        (None, None) => bail!("no active user; pass a user or run `rollcall use <user>`"),
    }
}

fn load_embedding(path: &Path) -> Result<Embedding> {
    let record = read_descriptor(path)?;
    Ok(Embedding::new(record.descriptor))
}

fn load_detection(path: &Path) -> Result<DetectionResult> {
    let record = read_descriptor(path)?;
    Ok(DetectionResult {
        detected: true,
        confidence: record.score.clamp(0.0, 1.0),
        embedding: Some(Embedding::new(record.descriptor)),
        bounding_box: record.bounding_box,
    })
}

fn new_session(db: &SharedDb, config: &Config) -> AttendanceSession {
    let session = AttendanceSession::new(db.clone(), config.similarity_threshold);
    match &config.device {
        Some(device) => session.with_device(device.clone()),
        None => session,
    }
}

fn geolocation(config: &Config) -> Arc<dyn GeolocationProvider> {
    match config.location {
        Some(l) => Arc::new(FixedLocation::new(l.latitude, l.longitude, l.accuracy)),
        None => Arc::new(NoLocation::default()),
    }
}

fn geo_options(config: &Config) -> GeoOptions {
    GeoOptions {
        timeout: config.geo_timeout(),
        ..GeoOptions::default()
    }
}

fn print_mark(session: &AttendanceSession, outcome: &MarkOutcome) {
    let event = &outcome.event;
    println!(
        "{} marked {} at {} {} (confidence {:.0}%)",
        outcome.user.display_name,
        event.status,
        event.date,
        event.time,
        event.confidence * 100.0
    );
    if outcome.already_marked_today {
        println!("Note: already marked present earlier today");
    }
    if let Some(e) = session.geo_error() {
        println!("Recorded without location: {e}");
    }
    if !outcome.persisted {
        println!("Warning: record kept in memory only; the database could not be written");
    }
}
