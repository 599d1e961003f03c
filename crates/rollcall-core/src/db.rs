//! Attendance database: roster, ledger and course catalog behind one
//! persisted snapshot.
//!
//! Loaded once from a [`BlobStore`]; every mutating command is applied in
//! memory and then flushed as a whole-state rewrite. A failed flush keeps the
//! in-memory change, logs the error and leaves the database dirty until a
//! later flush succeeds.

use crate::clock::Clock;
use crate::ledger::{AttendanceSummary, DedupePolicy, Ledger, LedgerError};
use crate::matcher;
use crate::roster::{Roster, RosterError};
use crate::store::{BlobStore, StoreError};
use crate::types::{
    AttendanceEvent, Course, Embedding, EnrolledUser, NewAttendance, NewUser,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("stored snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("unknown course: {0}")]
    UnknownCourse(String),
    #[error("change kept in memory but not persisted: {0}")]
    Persist(#[source] StoreError),
}

/// On-disk shape of the whole database.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    users: Vec<EnrolledUser>,
    #[serde(default)]
    attendance: Vec<AttendanceEvent>,
    #[serde(default)]
    courses: Vec<Course>,
    #[serde(default)]
    current_user_id: Option<String>,
}

pub struct AttendanceDb {
    store: Box<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    roster: Roster,
    ledger: Ledger,
    courses: Vec<Course>,
    persist_error: Option<StoreError>,
}

impl AttendanceDb {
    /// Load the database from `store`. An empty store yields an empty
    /// roster and ledger with the default course catalog.
    pub fn open(
        store: Box<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        policy: DedupePolicy,
    ) -> Result<Self, DbError> {
        let snapshot = match store.load()? {
            Some(blob) => serde_json::from_slice::<Snapshot>(&blob)?,
            None => Snapshot::default(),
        };
        let courses = if snapshot.courses.is_empty() {
            Course::default_catalog()
        } else {
            snapshot.courses
        };

        tracing::info!(
            users = snapshot.users.len(),
            events = snapshot.attendance.len(),
            courses = courses.len(),
            ?policy,
            "attendance database loaded"
        );

        Ok(Self {
            store,
            clock,
            roster: Roster::from_parts(snapshot.users, snapshot.current_user_id),
            ledger: Ledger::from_events(snapshot.attendance, policy),
            courses,
            persist_error: None,
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn courses(&self) -> &[Course] {
        &self.courses
    }

    /// Find a course by id or code.
    pub fn course(&self, key: &str) -> Option<&Course> {
        self.courses.iter().find(|c| c.matches(key))
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Register a user; the new user becomes active.
    ///
    /// A course, if given, must be a catalog id.
    pub fn register(&mut self, new: NewUser) -> Result<EnrolledUser, DbError> {
        if let Some(course_id) = new.course_id.as_deref() {
            if !self.courses.iter().any(|c| c.id == course_id) {
                return Err(DbError::UnknownCourse(course_id.to_string()));
            }
        }
        let user = self.roster.register(new)?;
        self.flush_after_change();
        Ok(user)
    }

    pub fn update_embedding(&mut self, user_id: &str, embedding: Embedding) -> Result<(), DbError> {
        self.roster.update_embedding(user_id, embedding)?;
        self.flush_after_change();
        Ok(())
    }

    pub fn set_active(&mut self, user_id: Option<&str>) -> Result<(), DbError> {
        self.roster.set_active(user_id)?;
        self.flush_after_change();
        Ok(())
    }

    /// Append an attendance event to the ledger.
    pub fn record(&mut self, new: NewAttendance) -> Result<AttendanceEvent, DbError> {
        let event = self.ledger.append(new)?;
        self.flush_after_change();
        Ok(event)
    }

    /// Replace the course catalog.
    pub fn set_courses(&mut self, courses: Vec<Course>) {
        self.courses = courses;
        self.flush_after_change();
    }

    pub fn best_match(&self, probe: &Embedding, threshold: f32) -> Option<&EnrolledUser> {
        matcher::best_match(probe, self.roster.users(), threshold)
    }

    pub fn history_for(&self, user_id: &str) -> Vec<&AttendanceEvent> {
        self.ledger.history_for(user_id)
    }

    /// Whether the user is marked Present on the clock's current date.
    /// Advisory: recording is not blocked unless the dedupe policy rejects.
    pub fn has_marked_today(&self, user_id: &str) -> bool {
        self.ledger.has_marked_on(user_id, self.clock.today())
    }

    pub fn summary_for(&self, user_id: &str) -> AttendanceSummary {
        self.ledger.summary_for(user_id)
    }

    pub fn export_csv(&self, user_id: &str) -> String {
        self.ledger.export_csv(user_id, &self.courses)
    }

    /// True when the latest change has not reached the store.
    pub fn is_dirty(&self) -> bool {
        self.persist_error.is_some()
    }

    /// The error from the last failed flush, if still unresolved.
    pub fn persist_error(&self) -> Option<&StoreError> {
        self.persist_error.as_ref()
    }

    /// Write the full snapshot to the store.
    pub fn flush(&mut self) -> Result<(), DbError> {
        let snapshot = Snapshot {
            users: self.roster.users().to_vec(),
            attendance: self.ledger.events().to_vec(),
            courses: self.courses.clone(),
            current_user_id: self.roster.active_id().map(str::to_string),
        };
        let blob = serde_json::to_vec(&snapshot).map_err(DbError::Serialize)?;

        match self.store.save(&blob) {
            Ok(()) => {
                self.persist_error = None;
                Ok(())
            }
            Err(e) => Err(DbError::Persist(e)),
        }
    }

    fn flush_after_change(&mut self) {
        match self.flush() {
            Ok(()) => {}
            Err(DbError::Persist(e)) => {
                tracing::error!(error = %e, "failed to persist attendance data; keeping change in memory");
                self.persist_error = Some(e);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize attendance data");
                self.persist_error = Some(StoreError::Unavailable(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;
    use crate::types::AttendanceStatus;
    use chrono::NaiveTime;

    struct FailingStore;

    impl BlobStore for FailingStore {
        fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }

        fn save(&mut self, _blob: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
    }

    fn clock() -> Arc<dyn Clock> {
        let now = NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        Arc::new(FixedClock(now))
    }

    fn alice() -> NewUser {
        NewUser {
            username: "alice".into(),
            display_name: "Alice Liddell".into(),
            contact: "alice@example.org".into(),
            course_id: Some("1".into()),
            embedding: Some(Embedding::new(vec![0.1, 0.2, 0.3])),
        }
    }

    fn present(db: &AttendanceDb, user_id: &str) -> NewAttendance {
        NewAttendance {
            user_id: user_id.into(),
            course_id: None,
            date: db.today(),
            time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            location: None,
            confidence: 0.9,
            status: AttendanceStatus::Present,
            method: "Biometric Face Recognition".into(),
            notes: None,
            verified: true,
            device: None,
        }
    }

    #[test]
    fn test_open_empty_store() {
        let db = AttendanceDb::open(Box::new(MemoryStore::new()), clock(), DedupePolicy::Warn).unwrap();
        assert!(db.roster().is_empty());
        assert!(db.ledger().is_empty());
        assert!(!db.is_dirty());
    }

    #[test]
    fn test_empty_store_gets_default_catalog() {
        let db = AttendanceDb::open(Box::new(MemoryStore::new()), clock(), DedupePolicy::Warn).unwrap();
        assert_eq!(db.courses(), Course::default_catalog().as_slice());
        assert_eq!(db.course("MATH201").map(|c| c.id.as_str()), Some("2"));
        assert!(db.course("BIO100").is_none());
    }

    #[test]
    fn test_register_rejects_unknown_course() {
        let mut db = AttendanceDb::open(Box::new(MemoryStore::new()), clock(), DedupePolicy::Warn).unwrap();
        let mut new = alice();
        new.course_id = Some("42".into());
        let err = db.register(new).unwrap_err();
        assert!(matches!(err, DbError::UnknownCourse(ref id) if id == "42"));
        assert!(db.roster().is_empty());

        let mut none = alice();
        none.course_id = None;
        db.register(none).unwrap();
    }

    #[test]
    fn test_open_corrupt_store() {
        let mut store = MemoryStore::new();
        store.save(b"{not json").unwrap();
        let err = AttendanceDb::open(Box::new(store), clock(), DedupePolicy::Warn).err().unwrap();
        assert!(matches!(err, DbError::Corrupt(_)));
    }

    #[test]
    fn test_changes_survive_reopen() {
        let store = MemoryStore::new();
        let user_id;
        {
            let mut db = AttendanceDb::open(Box::new(store.clone()), clock(), DedupePolicy::Warn).unwrap();
            db.set_courses(vec![Course {
                id: "1".into(),
                name: "Physics".into(),
                code: "PHY101".into(),
                instructor: None,
            }]);
            let user = db.register(alice()).unwrap();
            let new = present(&db, &user.id);
            db.record(new).unwrap();
            user_id = user.id;
        }

        let db = AttendanceDb::open(Box::new(store), clock(), DedupePolicy::Warn).unwrap();
        assert_eq!(db.roster().len(), 1);
        assert_eq!(db.roster().active_id(), Some(user_id.as_str()));
        assert_eq!(db.history_for(&user_id).len(), 1);
        assert_eq!(db.courses().len(), 1);
        assert!(db.has_marked_today(&user_id));
    }

    #[test]
    fn test_persist_failure_keeps_change_in_memory() {
        let mut db = AttendanceDb::open(Box::new(FailingStore), clock(), DedupePolicy::Warn).unwrap();
        let user = db.register(alice()).unwrap();
        assert!(db.is_dirty());

        let new = present(&db, &user.id);
        let event = db.record(new).unwrap();
        assert_eq!(db.history_for(&user.id)[0].id, event.id);

        let err = db.flush().unwrap_err();
        assert!(matches!(err, DbError::Persist(_)));
        assert!(db.persist_error().is_some());
    }

    #[test]
    fn test_has_marked_today_uses_clock() {
        let mut db = AttendanceDb::open(Box::new(MemoryStore::new()), clock(), DedupePolicy::Warn).unwrap();
        let user = db.register(alice()).unwrap();
        assert!(!db.has_marked_today(&user.id));

        let mut yesterday = present(&db, &user.id);
        yesterday.date = db.today().pred_opt().unwrap();
        db.record(yesterday).unwrap();
        assert!(!db.has_marked_today(&user.id));

        let today = present(&db, &user.id);
        db.record(today).unwrap();
        assert!(db.has_marked_today(&user.id));
        assert!(db.has_marked_today(&user.id));
    }

    #[test]
    fn test_reject_policy_surfaces_ledger_error() {
        let mut db = AttendanceDb::open(Box::new(MemoryStore::new()), clock(), DedupePolicy::Reject).unwrap();
        let user = db.register(alice()).unwrap();
        let first = present(&db, &user.id);
        db.record(first).unwrap();
        let second = present(&db, &user.id);
        let err = db.record(second).unwrap_err();
        assert!(matches!(err, DbError::Ledger(LedgerError::AlreadyMarked { .. })));
        assert_eq!(db.ledger().len(), 1);
    }

    #[test]
    fn test_serialize_error_is_not_reported_as_corruption() {
        let json_err = serde_json::from_str::<u8>("x").unwrap_err();
        let err = DbError::Serialize(json_err);
        let message = err.to_string();
        assert!(message.starts_with("failed to serialize snapshot"));
        assert!(!message.contains("corrupt"));
    }

    #[test]
    fn test_summary_for_user() {
        let mut db = AttendanceDb::open(Box::new(MemoryStore::new()), clock(), DedupePolicy::Warn).unwrap();
        let user = db.register(alice()).unwrap();
        let first = present(&db, &user.id);
        db.record(first).unwrap();
        let mut absent = present(&db, &user.id);
        absent.date = db.today().succ_opt().unwrap();
        absent.status = AttendanceStatus::Absent;
        db.record(absent).unwrap();

        let summary = db.summary_for(&user.id);
        assert_eq!((summary.present, summary.total), (1, 2));
        assert_eq!(summary.rate_percent(), 50);
    }

    #[test]
    fn test_update_embedding_unknown_user() {
        let mut db = AttendanceDb::open(Box::new(MemoryStore::new()), clock(), DedupePolicy::Warn).unwrap();
        let err = db.update_embedding("ghost", Embedding::new(vec![0.0])).unwrap_err();
        assert!(matches!(err, DbError::Roster(RosterError::NotFound(_))));
    }

    #[test]
    fn test_snapshot_field_names() {
        let store = MemoryStore::new();
        let mut db = AttendanceDb::open(Box::new(store.clone()), clock(), DedupePolicy::Warn).unwrap();
        db.register(alice()).unwrap();

        let blob = store.contents().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        assert!(value["users"].is_array());
        assert!(value["attendance"].is_array());
        assert!(value["courses"].is_array());
        assert!(value["current_user_id"].is_string());
        assert_eq!(value["users"][0]["embedding"].as_array().map(Vec::len), Some(3));
    }
}
