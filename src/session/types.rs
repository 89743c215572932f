use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic session identifiers.
const SESSION_NAMESPACE: Uuid = Uuid::from_u128(0x6e65_7572_6f70_6970_6573_6573_7369_6f6e);

/// Experimental procedure recorded for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Procedure {
    BehaviorTraining,
    AcuteRecording,
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::BehaviorTraining => write!(f, "Behavior training/tasks"),
            Procedure::AcuteRecording => write!(f, "Ephys recording with acute probe(s)"),
        }
    }
}

/// Protocol family a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    Training,
    Habituation,
    Ephys,
    /// Protocol not known to the pipeline; only raw registration runs.
    Custom(String),
}

impl ProtocolFamily {
    /// Maps a rig protocol string to a family.
    ///
    /// Matching is case-insensitive on substrings, habituation first since
    /// habituation protocols also mention the task name.
    pub fn from_protocol(protocol: &str) -> Self {
        let lower = protocol.to_lowercase();
        if lower.contains("habituation") {
            ProtocolFamily::Habituation
        } else if lower.contains("ephys") {
            ProtocolFamily::Ephys
        } else if lower.contains("training") || lower.contains("biased") {
            ProtocolFamily::Training
        } else {
            ProtocolFamily::Custom(protocol.to_string())
        }
    }

    /// Short label used in logs and task names.
    pub fn label(&self) -> &str {
        match self {
            ProtocolFamily::Training => "training",
            ProtocolFamily::Habituation => "habituation",
            ProtocolFamily::Ephys => "ephys",
            ProtocolFamily::Custom(_) => "custom",
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFamily::Custom(name) => write!(f, "custom({})", name),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// One experimental recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub subject: String,
    pub date: NaiveDate,
    pub number: u32,
    pub lab: Option<String>,
    pub root: PathBuf,
    pub protocol: String,
    pub procedure: Procedure,
}

impl Session {
    /// Creates a session whose identifier is derived from subject, date and number.
    pub fn new(
        subject: impl Into<String>,
        date: NaiveDate,
        number: u32,
        root: impl Into<PathBuf>,
        protocol: impl Into<String>,
        procedure: Procedure,
    ) -> Self {
        let subject = subject.into();
        let id = Self::derive_id(&subject, date, number);
        Self {
            id,
            subject,
            date,
            number,
            lab: None,
            root: root.into(),
            protocol: protocol.into(),
            procedure,
        }
    }

    /// Sets the lab.
    pub fn with_lab(mut self, lab: impl Into<String>) -> Self {
        self.lab = Some(lab.into());
        self
    }

    /// Deterministic identifier: the same recording always gets the same id.
    pub fn derive_id(subject: &str, date: NaiveDate, number: u32) -> Uuid {
        let key = format!("{}/{}/{:03}", subject, date, number);
        Uuid::new_v5(&SESSION_NAMESPACE, key.as_bytes())
    }

    /// Human-readable `subject/date/number` key.
    pub fn key(&self) -> String {
        format!("{}/{}/{:03}", self.subject, self.date, self.number)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Result of classifying a raw session directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClassification {
    pub session: Session,
    pub family: ProtocolFamily,
    /// Probe labels, sorted (e.g. `probe00`, `probe01`).
    pub probes: Vec<String>,
    /// Camera labels with a sync file, sorted (e.g. `body`, `left`).
    pub cameras: Vec<String>,
    pub has_behavior: bool,
    pub has_passive: bool,
    pub has_opto: bool,
}

impl SessionClassification {
    /// Returns true when at least one probe was found.
    pub fn has_ephys(&self) -> bool {
        !self.probes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_protocol() {
        assert_eq!(
            ProtocolFamily::from_protocol("_iblrig_tasks_trainingChoiceWorld6.4.0"),
            ProtocolFamily::Training
        );
        assert_eq!(
            ProtocolFamily::from_protocol("_iblrig_tasks_biasedChoiceWorld6.4.0"),
            ProtocolFamily::Training
        );
        assert_eq!(
            ProtocolFamily::from_protocol("_iblrig_tasks_habituationChoiceWorld"),
            ProtocolFamily::Habituation
        );
        assert_eq!(
            ProtocolFamily::from_protocol("_iblrig_tasks_ephysChoiceWorld6.4.0"),
            ProtocolFamily::Ephys
        );
        assert_eq!(
            ProtocolFamily::from_protocol("my_custom_task"),
            ProtocolFamily::Custom("my_custom_task".to_string())
        );
    }

    #[test]
    fn test_session_id_is_deterministic() {
        let date = NaiveDate::from_ymd_opt(2020, 2, 3).unwrap();
        let a = Session::new("KS022", date, 1, "/a", "x", Procedure::BehaviorTraining);
        let b = Session::new("KS022", date, 1, "/b", "y", Procedure::AcuteRecording);
        let c = Session::new("KS022", date, 2, "/a", "x", Procedure::BehaviorTraining);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.key(), "KS022/2020-02-03/001");
    }

    #[test]
    fn test_family_display() {
        assert_eq!(ProtocolFamily::Ephys.to_string(), "ephys");
        assert_eq!(
            ProtocolFamily::Custom("x".to_string()).to_string(),
            "custom(x)"
        );
    }
}
