//! Reference nodes. External systems are injected at construction.

pub mod compliance_check;
pub mod error_handler;
pub mod evidence;
pub mod notification;
pub mod reporting;

pub use compliance_check::{Assessment, Assessor, ComplianceCheckNode, RuleAssessor};
pub use error_handler::ErrorHandlerNode;
pub use evidence::{EvidenceCollectionNode, EvidenceSource, HttpEvidenceSource, RawEvidence};
pub use notification::NotificationNode;
pub use reporting::{ComplianceReport, FileReportSink, ReportSink, ReportingNode};
