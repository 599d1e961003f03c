//! rollcall-core — Face-matched attendance.
//!
//! Matches face embeddings against an enrolled roster, drives the
//! continuous scan state machine, and keeps the append-only attendance
//! ledger behind a persisted snapshot.

pub mod clock;
pub mod db;
pub mod ledger;
pub mod matcher;
pub mod roster;
pub mod scanner;
pub mod session;
pub mod source;
pub mod store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use db::{AttendanceDb, DbError};
pub use ledger::{AttendanceSummary, DedupePolicy, Ledger, LedgerError};
pub use matcher::{best_match, EuclideanMatcher, MatchResult, Matcher, DEFAULT_SIMILARITY_THRESHOLD};
pub use roster::{Roster, RosterError};
pub use scanner::{DetectionResult, ScanStatus, Scanner, ScannerConfig, ScannerError};
pub use session::{AttendanceSession, MarkOutcome, SessionError, SharedDb};
pub use source::{
    Detection, EmbeddingExtractor, ExtractorError, Frame, FrameSource, FrameSourceError, GeoError,
    GeoOptions, GeolocationProvider,
};
pub use store::{BlobStore, MemoryStore, SqliteStore, StoreError};
pub use types::{
    AttendanceEvent, AttendanceStatus, BoundingBox, Course, Embedding, EnrolledUser, GeoPosition,
    NewAttendance, NewUser,
};
