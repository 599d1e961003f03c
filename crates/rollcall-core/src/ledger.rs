//! Append-only attendance ledger with per-user history and CSV export.

use crate::types::{AttendanceEvent, AttendanceStatus, Course, NewAttendance};
use chrono::{NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

/// Header row of the CSV export. Downstream consumers depend on this layout.
pub const EXPORT_HEADER: &str = "Date,Time,Course,Latitude,Longitude,Method,Confidence,Status";

/// Course label used in exports when an event has no (known) course.
pub const DEFAULT_COURSE_LABEL: &str = "General";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("confidence {0} is outside [0, 1]")]
    InvalidConfidence(f32),
    #[error("user {user_id} is already marked present on {date}")]
    AlreadyMarked { user_id: String, date: NaiveDate },
}

/// What to do with a second Present event for the same user and day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupePolicy {
    /// Store it and log a warning.
    #[default]
    Warn,
    /// Refuse it with [`LedgerError::AlreadyMarked`].
    Reject,
}

impl FromStr for DedupePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(Self::Warn),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown dedupe policy: {other} (expected warn or reject)")),
        }
    }
}

/// Per-user attendance totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttendanceSummary {
    /// Present events (a day marked twice counts twice).
    pub present: usize,
    /// All events regardless of status.
    pub total: usize,
}

impl AttendanceSummary {
    /// Share of Present events as a whole percentage, 0 with no events.
    pub fn rate_percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        (self.present as f64 / self.total as f64 * 100.0).round() as u32
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    events: Vec<AttendanceEvent>,
    policy: DedupePolicy,
}

impl Ledger {
    pub fn new(policy: DedupePolicy) -> Self {
        Self {
            events: Vec::new(),
            policy,
        }
    }

    /// Rebuild a ledger from persisted events, keeping their order.
    pub fn from_events(events: Vec<AttendanceEvent>, policy: DedupePolicy) -> Self {
        Self { events, policy }
    }

    pub fn policy(&self) -> DedupePolicy {
        self.policy
    }

    /// Append a new event and return the stored copy.
    ///
    /// Times are truncated to whole seconds.
    pub fn append(&mut self, new: NewAttendance) -> Result<AttendanceEvent, LedgerError> {
        if !(0.0..=1.0).contains(&new.confidence) {
            return Err(LedgerError::InvalidConfidence(new.confidence));
        }

        if new.status == AttendanceStatus::Present && self.has_marked_on(&new.user_id, new.date) {
            match self.policy {
                DedupePolicy::Warn => {
                    tracing::warn!(
                        user_id = %new.user_id,
                        date = %new.date,
                        "user already marked present today; recording again"
                    );
                }
                DedupePolicy::Reject => {
                    return Err(LedgerError::AlreadyMarked {
                        user_id: new.user_id,
                        date: new.date,
                    });
                }
            }
        }

        let event = AttendanceEvent {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: new.user_id,
            course_id: new.course_id,
            date: new.date,
            time: new.time.with_nanosecond(0).unwrap_or(new.time),
            location: new.location,
            confidence: new.confidence,
            status: new.status,
            method: new.method,
            notes: new.notes,
            verified: new.verified,
            device: new.device,
        };

        tracing::info!(
            event_id = %event.id,
            user_id = %event.user_id,
            date = %event.date,
            status = %event.status,
            confidence = event.confidence,
            "attendance recorded"
        );

        self.events.push(event.clone());
        Ok(event)
    }

    /// All events in append order.
    pub fn events(&self) -> &[AttendanceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events for one user, most recent first. Events with identical date
    /// and time keep their append order.
    pub fn history_for(&self, user_id: &str) -> Vec<&AttendanceEvent> {
        let mut history: Vec<&AttendanceEvent> =
            self.events.iter().filter(|e| e.user_id == user_id).collect();
        // sort_by is stable
        history.sort_by(|a, b| (b.date, b.time).cmp(&(a.date, a.time)));
        history
    }

    /// True iff the user has a Present event on `date`.
    pub fn has_marked_on(&self, user_id: &str, date: NaiveDate) -> bool {
        self.events.iter().any(|e| {
            e.user_id == user_id && e.date == date && e.status == AttendanceStatus::Present
        })
    }

    pub fn summary_for(&self, user_id: &str) -> AttendanceSummary {
        self.events
            .iter()
            .filter(|e| e.user_id == user_id)
            .fold(AttendanceSummary::default(), |mut acc, e| {
                acc.total += 1;
                if e.status == AttendanceStatus::Present {
                    acc.present += 1;
                }
                acc
            })
    }

    /// Render a user's history as CSV, in `history_for` order.
    pub fn export_csv(&self, user_id: &str, courses: &[Course]) -> String {
        let mut csv = String::with_capacity(64 * (self.events.len() + 1));
        csv.push_str(EXPORT_HEADER);
        csv.push('\n');

        for event in self.history_for(user_id) {
            let course = event
                .course_id
                .as_deref()
                .and_then(|id| courses.iter().find(|c| c.id == id))
                .map_or(DEFAULT_COURSE_LABEL, |c| c.name.as_str());
            let latitude = event.location.map(|l| l.latitude.to_string()).unwrap_or_default();
            let longitude = event.location.map(|l| l.longitude.to_string()).unwrap_or_default();
            let percent = (f64::from(event.confidence) * 100.0).round() as i64;

            // fmt::Write into a String cannot fail
            let _ = writeln!(
                csv,
                "{},{},{},{},{},{},{}%,{}",
                quote(&event.date.format("%Y-%m-%d").to_string()),
                quote(&event.time.format("%H:%M:%S").to_string()),
                quote(course),
                latitude,
                longitude,
                quote(&event.method),
                percent,
                quote(event.status.as_str()),
            );
        }

        csv
    }
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoPosition;
    use chrono::NaiveTime;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn time(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap()
    }

    fn present(user_id: &str, d: &str, t: &str) -> NewAttendance {
        NewAttendance {
            user_id: user_id.into(),
            course_id: None,
            date: date(d),
            time: time(t),
            location: None,
            confidence: 0.93,
            status: AttendanceStatus::Present,
            method: "Biometric Face Recognition".into(),
            notes: None,
            verified: true,
            device: None,
        }
    }

    #[test]
    fn test_append_assigns_unique_ids() {
        let mut ledger = Ledger::default();
        let a = ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();
        let b = ledger.append(present("u1", "2024-01-11", "09:00:00")).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_append_truncates_subseconds() {
        let mut ledger = Ledger::default();
        let mut new = present("u1", "2024-01-10", "09:00:00");
        new.time = NaiveTime::from_hms_milli_opt(9, 0, 0, 750).unwrap();
        let event = ledger.append(new).unwrap();
        assert_eq!(event.time, time("09:00:00"));
    }

    #[test]
    fn test_append_rejects_bad_confidence() {
        let mut ledger = Ledger::default();
        let mut new = present("u1", "2024-01-10", "09:00:00");
        new.confidence = 1.5;
        assert_eq!(ledger.append(new), Err(LedgerError::InvalidConfidence(1.5)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_duplicate_present_stored_under_warn() {
        let mut ledger = Ledger::new(DedupePolicy::Warn);
        ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();
        ledger.append(present("u1", "2024-01-10", "09:05:00")).unwrap();
        assert_eq!(ledger.history_for("u1").len(), 2);
    }

    #[test]
    fn test_duplicate_present_refused_under_reject() {
        let mut ledger = Ledger::new(DedupePolicy::Reject);
        ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();
        let err = ledger.append(present("u1", "2024-01-10", "09:05:00")).unwrap_err();
        assert_eq!(
            err,
            LedgerError::AlreadyMarked {
                user_id: "u1".into(),
                date: date("2024-01-10")
            }
        );
        assert_eq!(ledger.len(), 1);

        // other statuses and other days are unaffected
        let mut late = present("u1", "2024-01-10", "10:00:00");
        late.status = AttendanceStatus::Late;
        ledger.append(late).unwrap();
        ledger.append(present("u1", "2024-01-11", "09:00:00")).unwrap();
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_has_marked_on() {
        let mut ledger = Ledger::default();
        assert!(!ledger.has_marked_on("u1", date("2024-01-10")));

        ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();
        assert!(ledger.has_marked_on("u1", date("2024-01-10")));
        assert!(ledger.has_marked_on("u1", date("2024-01-10")));
        assert!(!ledger.has_marked_on("u1", date("2024-01-11")));
        assert!(!ledger.has_marked_on("u2", date("2024-01-10")));
    }

    #[test]
    fn test_has_marked_on_ignores_non_present() {
        let mut ledger = Ledger::default();
        let mut absent = present("u1", "2024-01-10", "09:00:00");
        absent.status = AttendanceStatus::Absent;
        ledger.append(absent).unwrap();
        assert!(!ledger.has_marked_on("u1", date("2024-01-10")));
    }

    #[test]
    fn test_history_most_recent_first() {
        let mut ledger = Ledger::default();
        ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();
        ledger.append(present("u2", "2024-01-12", "09:00:00")).unwrap();
        ledger.append(present("u1", "2024-01-12", "08:00:00")).unwrap();
        ledger.append(present("u1", "2024-01-11", "17:30:00")).unwrap();

        let history: Vec<String> = ledger
            .history_for("u1")
            .iter()
            .map(|e| format!("{} {}", e.date, e.time))
            .collect();
        assert_eq!(
            history,
            vec!["2024-01-12 08:00:00", "2024-01-11 17:30:00", "2024-01-10 09:00:00"]
        );
    }

    #[test]
    fn test_history_ties_keep_append_order() {
        let mut ledger = Ledger::default();
        let first = ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();
        let second = ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();
        let ids: Vec<&str> = ledger.history_for("u1").iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
    }

    #[test]
    fn test_export_single_event() {
        let mut ledger = Ledger::default();
        ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();

        let csv = ledger.export_csv("u1", &[]);
        assert_eq!(
            csv,
            "Date,Time,Course,Latitude,Longitude,Method,Confidence,Status\n\
             \"2024-01-10\",\"09:00:00\",\"General\",,,\"Biometric Face Recognition\",93%,\"Present\"\n"
        );
    }

    #[test]
    fn test_export_course_and_location() {
        let courses = vec![Course {
            id: "1".into(),
            name: "Computer Science 101".into(),
            code: "CS101".into(),
            instructor: None,
        }];
        let mut ledger = Ledger::default();
        let mut new = present("u1", "2024-01-10", "09:00:00");
        new.course_id = Some("1".into());
        new.location = Some(GeoPosition {
            latitude: 37.7749,
            longitude: -122.4194,
            accuracy: 12.0,
        });
        new.confidence = 0.875;
        ledger.append(new).unwrap();

        let mut unknown = present("u1", "2024-01-09", "09:00:00");
        unknown.course_id = Some("99".into());
        ledger.append(unknown).unwrap();

        let csv = ledger.export_csv("u1", &courses);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[1],
            "\"2024-01-10\",\"09:00:00\",\"Computer Science 101\",37.7749,-122.4194,\"Biometric Face Recognition\",88%,\"Present\""
        );
        assert!(lines[2].contains("\"General\""));
    }

    #[test]
    fn test_export_row_count_matches_history() {
        let mut ledger = Ledger::default();
        for day in 10..15 {
            ledger.append(present("u1", &format!("2024-01-{day}"), "09:00:00")).unwrap();
        }
        ledger.append(present("u2", "2024-01-10", "09:00:00")).unwrap();

        let csv = ledger.export_csv("u1", &[]);
        let history = ledger.history_for("u1");
        let rows: Vec<&str> = csv.lines().skip(1).collect();
        assert_eq!(rows.len(), history.len());
        for (row, event) in rows.iter().zip(history) {
            assert!(row.starts_with(&format!("\"{}\"", event.date)));
        }
    }

    #[test]
    fn test_export_escapes_quotes() {
        let mut ledger = Ledger::default();
        let mut new = present("u1", "2024-01-10", "09:00:00");
        new.method = "Manual \"override\"".into();
        ledger.append(new).unwrap();
        let csv = ledger.export_csv("u1", &[]);
        assert!(csv.contains("\"Manual \"\"override\"\"\""));
    }

    #[test]
    fn test_export_unknown_user_is_header_only() {
        let ledger = Ledger::default();
        assert_eq!(ledger.export_csv("nobody", &[]), format!("{EXPORT_HEADER}\n"));
    }

    #[test]
    fn test_summary_counts_present_and_rate() {
        let mut ledger = Ledger::default();
        ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();
        ledger.append(present("u1", "2024-01-11", "09:00:00")).unwrap();
        let mut late = present("u1", "2024-01-12", "09:20:00");
        late.status = AttendanceStatus::Late;
        ledger.append(late).unwrap();
        ledger.append(present("u2", "2024-01-10", "09:00:00")).unwrap();

        let summary = ledger.summary_for("u1");
        assert_eq!(summary, AttendanceSummary { present: 2, total: 3 });
        assert_eq!(summary.rate_percent(), 67);
        assert_eq!(ledger.summary_for("u2").rate_percent(), 100);
    }

    #[test]
    fn test_summary_without_events() {
        let ledger = Ledger::default();
        let summary = ledger.summary_for("nobody");
        assert_eq!(summary.total, 0);
        assert_eq!(summary.rate_percent(), 0);
    }

    #[test]
    fn test_summary_rate_rounds_half_up() {
        let mut ledger = Ledger::default();
        ledger.append(present("u1", "2024-01-10", "09:00:00")).unwrap();
        let mut absent = present("u1", "2024-01-11", "09:00:00");
        absent.status = AttendanceStatus::Absent;
        ledger.append(absent).unwrap();
        for day in 12..14 {
            let mut excused = present("u1", &format!("2024-01-{day}"), "09:00:00");
            excused.status = AttendanceStatus::Excused;
            ledger.append(excused).unwrap();
        }
        for day in 14..18 {
            ledger.append(present("u1", &format!("2024-01-{day}"), "09:00:00")).unwrap();
        }
        // 5 of 8
        assert_eq!(ledger.summary_for("u1").rate_percent(), 63);
    }

    #[test]
    fn test_dedupe_policy_parse() {
        assert_eq!("warn".parse::<DedupePolicy>(), Ok(DedupePolicy::Warn));
        assert_eq!("REJECT".parse::<DedupePolicy>(), Ok(DedupePolicy::Reject));
        assert!("block".parse::<DedupePolicy>().is_err());
    }
}
