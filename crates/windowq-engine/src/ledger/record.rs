//! Implementation of persisted ledger records.
//!
//! Every record is a single line of `|`-delimited fields:
//!
//! * queue entries: `location|group|category|subtype|sequence`
//! * active records: the queue fields followed by `device|pid|start`
//! * terminal records: the active fields followed by `duration|status`
//!
//! Start times are RFC 3339 UTC timestamps and durations are whole seconds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;

use crate::DeviceId;
use crate::WindowDescriptor;
use crate::WindowId;

/// The delimiter between record fields.
pub const FIELD_DELIMITER: char = '|';

/// The number of fields in a queue entry.
const QUEUE_FIELDS: usize = 5;

/// The number of fields in an active record.
const ACTIVE_FIELDS: usize = QUEUE_FIELDS + 3;

/// The number of fields in a terminal record.
const TERMINAL_FIELDS: usize = ACTIVE_FIELDS + 2;

/// The terminal status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalStatus {
    /// The output artifact contains the success marker.
    Success,
    /// The output artifact exists but lacks the success marker.
    Incomplete,
    /// The output artifact does not exist.
    Failed,
}

impl TerminalStatus {
    /// Gets the persisted tag of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Incomplete => "INCOMPLETE",
            Self::Failed => "FAILED",
        }
    }

    /// Determines if the status is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "INCOMPLETE" => Ok(Self::Incomplete),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("unknown terminal status `{s}`")),
        }
    }
}

/// The persisted projection of an active job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRecord {
    /// The window being executed.
    pub window: WindowDescriptor,
    /// The device bound to the job.
    pub device: DeviceId,
    /// The process id of the job.
    pub pid: u32,
    /// When the job was launched.
    pub started: DateTime<Utc>,
}

impl ActiveRecord {
    /// Constructs a new active record.
    pub fn new(window: WindowDescriptor, device: DeviceId, pid: u32, started: DateTime<Utc>) -> Self {
        Self {
            window,
            device,
            pid,
            started,
        }
    }

    /// Encodes the record as a line.
    pub(crate) fn encode(&self) -> String {
        format!(
            "{window}|{device}|{pid}|{started}",
            window = encode_window(&self.window),
            device = self.device,
            pid = self.pid,
            started = self.started.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    /// Decodes a record from a line.
    pub(crate) fn decode(line: &str) -> Result<Self, String> {
        let fields = split(line, ACTIVE_FIELDS)?;
        Self::from_fields(&fields)
    }

    /// Decodes a record from its fields.
    fn from_fields(fields: &[&str]) -> Result<Self, String> {
        Ok(Self {
            window: window_from_fields(fields)?,
            device: parse_number(fields[5], "device")?,
            pid: parse_number(fields[6], "pid")?,
            started: DateTime::parse_from_rfc3339(fields[7])
                .map_err(|e| format!("invalid start time `{start}`: {e}", start = fields[7]))?
                .with_timezone(&Utc),
        })
    }
}

/// An immutable completed or failed job outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRecord {
    /// The window that was executed.
    pub window: WindowDescriptor,
    /// The device the job was bound to.
    pub device: DeviceId,
    /// The process id of the job.
    ///
    /// This is zero if no process was ever spawned.
    pub pid: u32,
    /// When the job was launched.
    pub started: DateTime<Utc>,
    /// How long the job ran, truncated to whole seconds.
    pub duration: Duration,
    /// The terminal status of the job.
    pub status: TerminalStatus,
}

impl TerminalRecord {
    /// Constructs a terminal record from an active record.
    ///
    /// The duration is measured from the record's start time to `finished`.
    pub fn from_active(
        active: ActiveRecord,
        finished: DateTime<Utc>,
        status: TerminalStatus,
    ) -> Self {
        let duration = (finished - active.started)
            .to_std()
            .map(|d| Duration::from_secs(d.as_secs()))
            .unwrap_or_default();

        Self {
            window: active.window,
            device: active.device,
            pid: active.pid,
            started: active.started,
            duration,
            status,
        }
    }

    /// Determines if this record terminates the given active record.
    pub(crate) fn terminates(&self, active: &ActiveRecord) -> bool {
        self.window.id() == active.window.id()
            && self.pid == active.pid
            && self.started == active.started
    }

    /// Encodes the record as a line.
    pub(crate) fn encode(&self) -> String {
        format!(
            "{window}|{device}|{pid}|{started}|{duration}|{status}",
            window = encode_window(&self.window),
            device = self.device,
            pid = self.pid,
            started = self.started.to_rfc3339_opts(SecondsFormat::Secs, true),
            duration = self.duration.as_secs(),
            status = self.status
        )
    }

    /// Decodes a record from a line.
    pub(crate) fn decode(line: &str) -> Result<Self, String> {
        let fields = split(line, TERMINAL_FIELDS)?;
        let active = ActiveRecord::from_fields(&fields)?;
        Ok(Self {
            window: active.window,
            device: active.device,
            pid: active.pid,
            started: active.started,
            duration: Duration::from_secs(parse_number(fields[8], "duration")?),
            status: fields[9].parse()?,
        })
    }
}

/// Determines if a window can be persisted.
///
/// Returns the name of the first field that cannot be persisted.
pub(crate) fn unpersistable_field(window: &WindowDescriptor) -> Option<&'static str> {
    /// Determines if a field value would corrupt a record.
    fn invalid(s: &str) -> bool {
        s.contains([FIELD_DELIMITER, '\n', '\r'])
    }

    let id = window.id();
    match window.location().to_str() {
        None => Some("location"),
        Some(location) if invalid(location) => Some("location"),
        Some(_) if invalid(&id.group) => Some("group"),
        Some(_) if invalid(&id.category) => Some("category"),
        Some(_) if invalid(&id.subtype) => Some("subtype"),
        Some(_) => None,
    }
}

/// Encodes a window as a queue entry line.
pub(crate) fn encode_window(window: &WindowDescriptor) -> String {
    let id = window.id();
    format!(
        "{location}|{group}|{category}|{subtype}|{sequence}",
        location = window.location().display(),
        group = id.group,
        category = id.category,
        subtype = id.subtype,
        sequence = id.sequence
    )
}

/// Decodes a window from a queue entry line.
pub(crate) fn decode_window(line: &str) -> Result<WindowDescriptor, String> {
    let fields = split(line, QUEUE_FIELDS)?;
    window_from_fields(&fields)
}

/// Decodes a window from the leading record fields.
fn window_from_fields(fields: &[&str]) -> Result<WindowDescriptor, String> {
    if fields[0].is_empty() {
        return Err("window location is empty".to_string());
    }

    Ok(WindowDescriptor::new(
        WindowId::new(
            fields[1],
            fields[2],
            fields[3],
            parse_number(fields[4], "sequence")?,
        ),
        fields[0],
    ))
}

/// Splits a line into exactly the expected number of fields.
fn split(line: &str, expected: usize) -> Result<Vec<&str>, String> {
    let fields: Vec<_> = line.split(FIELD_DELIMITER).collect();
    if fields.len() != expected {
        return Err(format!(
            "expected {expected} fields but found {found}",
            found = fields.len()
        ));
    }

    Ok(fields)
}

/// Parses a numeric field.
fn parse_number<T: FromStr>(s: &str, name: &str) -> Result<T, String> {
    s.parse()
        .map_err(|_| format!("invalid {name} `{s}`"))
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn window() -> WindowDescriptor {
        WindowDescriptor::new(
            WindowId::new("lig42", "bound", "vdw", 12),
            "/data/lig42/bound/vdw.12",
        )
    }

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn persisted_layout() {
        assert_eq!(
            encode_window(&window()),
            "/data/lig42/bound/vdw.12|lig42|bound|vdw|12"
        );

        let active = ActiveRecord::new(window(), 3, 4242, started());
        assert_eq!(
            active.encode(),
            "/data/lig42/bound/vdw.12|lig42|bound|vdw|12|3|4242|2026-03-01T12:00:00Z"
        );

        let terminal = TerminalRecord::from_active(
            active.clone(),
            started() + chrono::Duration::milliseconds(90_500),
            TerminalStatus::Incomplete,
        );
        assert_eq!(terminal.duration, Duration::from_secs(90));
        assert!(terminal.terminates(&active));
        assert_eq!(
            terminal.encode(),
            "/data/lig42/bound/vdw.12|lig42|bound|vdw|12|3|4242|2026-03-01T12:00:00Z|90|INCOMPLETE"
        );
        assert_eq!(TerminalRecord::decode(&terminal.encode()).unwrap(), terminal);
    }

    #[test]
    fn finish_before_start_has_zero_duration() {
        let active = ActiveRecord::new(window(), 0, 1, started());
        let terminal = TerminalRecord::from_active(
            active,
            started() - chrono::Duration::seconds(5),
            TerminalStatus::Failed,
        );
        assert_eq!(terminal.duration, Duration::ZERO);
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(
            decode_window("/a|g|bound|vdw").unwrap_err(),
            "expected 5 fields but found 4"
        );
        assert_eq!(
            decode_window("/a|g|bound|vdw|x").unwrap_err(),
            "invalid sequence `x`"
        );
        assert!(decode_window("|g|bound|vdw|1").is_err());
        assert!(ActiveRecord::decode("/a|g|bound|vdw|1|0|12|yesterday").is_err());
        assert_eq!(
            TerminalRecord::decode("/a|g|bound|vdw|1|0|12|2026-03-01T12:00:00Z|5|DONE")
                .unwrap_err(),
            "unknown terminal status `DONE`"
        );
    }

    #[test]
    fn unpersistable_fields() {
        assert_eq!(unpersistable_field(&window()), None);

        let bad = WindowDescriptor::new(WindowId::new("g", "bound", "vdw", 1), "/data/a|b");
        assert_eq!(unpersistable_field(&bad), Some("location"));

        let bad = WindowDescriptor::new(WindowId::new("g|h", "bound", "vdw", 1), "/data/a");
        assert_eq!(unpersistable_field(&bad), Some("group"));
    }
}
