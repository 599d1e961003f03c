//! Attendance session: resolves scanner detections to a roster identity and
//! records attendance for it.

use crate::db::{AttendanceDb, DbError};
use crate::ledger::LedgerError;
use crate::scanner::{DetectionResult, ScanStatus, Scanner, ScannerError};
use crate::source::{GeoError, GeoOptions, GeolocationProvider};
use crate::types::{AttendanceEvent, AttendanceStatus, EnrolledUser, GeoPosition, NewAttendance};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Provenance tag stamped on scanner-recorded attendance.
pub const BIOMETRIC_METHOD: &str = "Biometric Face Recognition";
const AUTOMATED_NOTE: &str = "Automated face verification";

pub type SharedDb = Arc<Mutex<AttendanceDb>>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no user identified: a face must be recognized before marking attendance")]
    NoIdentity,
    #[error("no face detected in the latest frame")]
    NoFace,
    #[error("no face matched within {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Scanner(#[from] ScannerError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// A recorded mark, with the advisory and persistence context around it.
#[derive(Debug, Clone)]
pub struct MarkOutcome {
    pub event: AttendanceEvent,
    pub user: EnrolledUser,
    /// The user already had a Present event today before this one.
    pub already_marked_today: bool,
    /// The snapshot reached the store.
    pub persisted: bool,
}

pub struct AttendanceSession {
    db: SharedDb,
    threshold: f32,
    device: Option<String>,
    last_detection: Option<DetectionResult>,
    recognized: Option<EnrolledUser>,
    position: Option<GeoPosition>,
    geo_error: Option<GeoError>,
}

impl AttendanceSession {
    pub fn new(db: SharedDb, threshold: f32) -> Self {
        Self {
            db,
            threshold,
            device: None,
            last_detection: None,
            recognized: None,
            position: None,
            geo_error: None,
        }
    }

    /// Device/context string stamped on recorded events.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    pub fn recognized(&self) -> Option<&EnrolledUser> {
        self.recognized.as_ref()
    }

    /// Most recent detection that found a face.
    pub fn last_detection(&self) -> Option<&DetectionResult> {
        self.last_detection.as_ref()
    }

    pub fn position(&self) -> Option<GeoPosition> {
        self.position
    }

    pub fn geo_error(&self) -> Option<GeoError> {
        self.geo_error
    }

    /// Forget the recognized user and last detection.
    pub fn clear(&mut self) {
        self.recognized = None;
        self.last_detection = None;
    }

    /// Take in one scanner result. Returns the user it matched, if any.
    pub fn handle_detection(&mut self, result: DetectionResult) -> Option<EnrolledUser> {
        let matched = match (&result.embedding, result.detected) {
            (Some(embedding), true) => self.lock_db().best_match(embedding, self.threshold).cloned(),
            _ => None,
        };
        // an empty tick does not erase the last face seen
        if result.detected {
            self.last_detection = Some(result);
        }

        if let Some(user) = &matched {
            tracing::info!(user_id = %user.id, name = %user.display_name, "user recognized");
            self.recognized = Some(user.clone());
        }
        matched
    }

    /// Request a geolocation fix bounded by `options.timeout`.
    ///
    /// Failures are kept in `geo_error` and never propagated: attendance is
    /// recorded without location. A timed-out request is left to finish on
    /// its own.
    pub async fn locate(
        &mut self,
        provider: Arc<dyn GeolocationProvider>,
        options: GeoOptions,
    ) -> Option<GeoPosition> {
        let request = tokio::task::spawn_blocking(move || provider.current_position(&options));

        let outcome = match tokio::time::timeout(options.timeout, request).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "geolocation task failed");
                Err(GeoError::Unknown)
            }
            Err(_) => Err(GeoError::Timeout),
        };

        match outcome {
            Ok(position) => {
                tracing::debug!(
                    latitude = position.latitude,
                    longitude = position.longitude,
                    accuracy = position.accuracy,
                    "location fix"
                );
                self.position = Some(position);
                self.geo_error = None;
                Some(position)
            }
            Err(e) => {
                tracing::warn!(error = %e, "no location; attendance will be recorded without it");
                self.geo_error = Some(e);
                None
            }
        }
    }

    /// Record Present for the recognized user, or the active user if no face
    /// has been matched yet.
    pub fn mark_attendance(&mut self) -> Result<MarkOutcome, SessionError> {
        self.mark_as(AttendanceStatus::Present)
    }

    /// Like [`mark_attendance`](Self::mark_attendance) with an explicit status.
    pub fn mark_as(&mut self, status: AttendanceStatus) -> Result<MarkOutcome, SessionError> {
        let detection = self
            .last_detection
            .as_ref()
            .filter(|d| d.detected)
            .ok_or(SessionError::NoFace)?;
        let confidence = detection.confidence.clamp(0.0, 1.0);

        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let user = match &self.recognized {
            Some(user) => user.clone(),
            None => db.roster().active().cloned().ok_or(SessionError::NoIdentity)?,
        };

        let already_marked_today = db.has_marked_today(&user.id);
        if already_marked_today {
            tracing::warn!(user_id = %user.id, "attendance already marked today");
        }

        let now = db.now();
        let event = db.record(NewAttendance {
            user_id: user.id.clone(),
            course_id: user.course_id.clone(),
            date: now.date(),
            time: now.time(),
            location: self.position,
            confidence,
            status,
            method: BIOMETRIC_METHOD.to_string(),
            notes: Some(AUTOMATED_NOTE.to_string()),
            verified: true,
            device: self.device.clone(),
        })?;

        Ok(MarkOutcome {
            event,
            user,
            already_marked_today,
            persisted: !db.is_dirty(),
        })
    }

    /// Run `scanner` until a detection matches the roster, then record it.
    ///
    /// The scanner must be `Ready`. It ends `Verified` and closed on success;
    /// on a refused record it is marked `Failed` and closed.
    pub async fn scan_until_marked(
        &mut self,
        scanner: &mut Scanner,
        limit: Duration,
    ) -> Result<MarkOutcome, SessionError> {
        self.clear();
        let (tx, mut rx) = mpsc::unbounded_channel();
        scanner.start(move |result| {
            let _ = tx.send(result);
        })?;

        let outcome = tokio::time::timeout(limit, async {
            while let Some(result) = rx.recv().await {
                if self.handle_detection(result).is_none() {
                    continue;
                }
                return Some(self.mark_attendance());
            }
            None
        })
        .await;

        let result = match outcome {
            Ok(Some(Ok(mark))) => {
                settle(scanner, ScanStatus::Verified);
                Ok(mark)
            }
            Ok(Some(Err(e))) => {
                settle(scanner, ScanStatus::Failed);
                Err(e)
            }
            Ok(None) | Err(_) => Err(SessionError::TimedOut(limit)),
        };
        scanner.close();
        result
    }

    fn lock_db(&self) -> MutexGuard<'_, AttendanceDb> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn settle(scanner: &Scanner, status: ScanStatus) {
    let marked = match status {
        ScanStatus::Verified => scanner.mark_verified(),
        _ => scanner.mark_failed(),
    };
    if let Err(e) = marked {
        tracing::debug!(error = %e, "scanner status not updated");
    }
}

impl SessionError {
    /// The record was refused by the dedupe policy.
    pub fn is_already_marked(&self) -> bool {
        matches!(self, SessionError::Db(DbError::Ledger(LedgerError::AlreadyMarked { .. })))
    }
}
