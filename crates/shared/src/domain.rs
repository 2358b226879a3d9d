use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(ProgramId);
id_newtype!(StudentId);
id_newtype!(EnrollmentId);
id_newtype!(MessageId);

/// Opaque, pre-validated identity handed over by the session provider (an email address).
pub type Identity = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramType {
    Internal,
    External,
}

impl ProgramType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ProgramType::Internal => "internal",
            ProgramType::External => "external",
        }
    }
}

impl FromStr for ProgramType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" => Ok(ProgramType::Internal),
            "external" => Ok(ProgramType::External),
            _ => Err(UnknownVariant::new("program type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Processing,
    Approved,
    Rejected,
}

impl EnrollmentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::Processing => "processing",
            EnrollmentStatus::Approved => "approved",
            EnrollmentStatus::Rejected => "rejected",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, EnrollmentStatus::Approved | EnrollmentStatus::Rejected)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrollmentStatus::Pending),
            "processing" => Ok(EnrollmentStatus::Processing),
            "approved" => Ok(EnrollmentStatus::Approved),
            "rejected" => Ok(EnrollmentStatus::Rejected),
            _ => Err(UnknownVariant::new("enrollment status", s)),
        }
    }
}

/// Categories a reviewer can file a notice under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSubject {
    ApplicationUpdate,
    DocumentRequest,
    InterviewSchedule,
    ApprovalNotice,
    RejectionNotice,
    General,
}

impl MessageSubject {
    pub const ALL: [MessageSubject; 6] = [
        MessageSubject::ApplicationUpdate,
        MessageSubject::DocumentRequest,
        MessageSubject::InterviewSchedule,
        MessageSubject::ApprovalNotice,
        MessageSubject::RejectionNotice,
        MessageSubject::General,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            MessageSubject::ApplicationUpdate => "application_update",
            MessageSubject::DocumentRequest => "document_request",
            MessageSubject::InterviewSchedule => "interview_schedule",
            MessageSubject::ApprovalNotice => "approval_notice",
            MessageSubject::RejectionNotice => "rejection_notice",
            MessageSubject::General => "general",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            MessageSubject::ApplicationUpdate => "Application Update",
            MessageSubject::DocumentRequest => "Document Request",
            MessageSubject::InterviewSchedule => "Interview Schedule",
            MessageSubject::ApprovalNotice => "Approval Notice",
            MessageSubject::RejectionNotice => "Rejection Notice",
            MessageSubject::General => "General",
        }
    }
}

impl FromStr for MessageSubject {
    type Err = UnknownVariant;

    /// Accepts either the wire form (`document_request`) or the display label (`Document Request`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        MessageSubject::ALL
            .into_iter()
            .find(|subject| {
                subject.as_str() == trimmed || subject.label().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| UnknownVariant::new("message subject", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Eligibility metadata attached to a program. Lists are free-form picklist values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    #[serde(default)]
    pub year_levels: Vec<String>,
    #[serde(default)]
    pub strands: Vec<String>,
    #[serde(default)]
    pub courses: Vec<String>,
    #[serde(default)]
    pub schools: Vec<String>,
}
