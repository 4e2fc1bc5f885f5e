//! Report and template DTOs as the service returns them

use crate::error::{HarnessError, Result};
use crate::models::filter::Filters;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a report. `Finished` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReportStatus {
    Processing,
    Finished,
    Error,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Processing => "Processing",
            ReportStatus::Finished => "Finished",
            ReportStatus::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReportStatus::Processing)
    }

    /// Whether a later observation of `next` is legal after `self`
    pub fn can_transition_to(&self, next: ReportStatus) -> bool {
        !self.is_terminal() || *self == next
    }

    /// `ProtocolViolation` when a terminal state was left
    pub fn check_transition(&self, next: ReportStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(HarnessError::ProtocolViolation(format!(
                "Report left terminal state {} for {}",
                self, next
            )))
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Processing" => Ok(ReportStatus::Processing),
            "Finished" => Ok(ReportStatus::Finished),
            "Error" => Ok(ReportStatus::Error),
            other => Err(HarnessError::ProtocolViolation(format!("Unknown report status: {}", other))),
        }
    }
}

impl TryFrom<String> for ReportStatus {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ReportStatus> for String {
    fn from(status: ReportStatus) -> Self {
        status.as_str().to_string()
    }
}

/// `POST /v1/reports` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateReportRequest {
    #[serde(rename = "templateId")]
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Filters::is_empty")]
    pub filters: Filters,
}

impl CreateReportRequest {
    pub fn new(template_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            filters: Filters::new(),
        }
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }
}

/// What the harness tracks about one report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportProbe {
    pub id: String,
    pub status: ReportStatus,
    #[serde(rename = "templateId", default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

/// Listing responses come either paged or as a bare array
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReportList {
    Paged { items: Vec<ReportProbe> },
    Bare(Vec<ReportProbe>),
}

impl ReportList {
    pub fn into_items(self) -> Vec<ReportProbe> {
        match self {
            ReportList::Paged { items } | ReportList::Bare(items) => items,
        }
    }
}

/// Template output formats accepted on upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Txt,
    Html,
    Csv,
    Xml,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [OutputFormat::Txt, OutputFormat::Html, OutputFormat::Csv, OutputFormat::Xml];

    /// Form value sent on upload
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Txt => "TXT",
            OutputFormat::Html => "HTML",
            OutputFormat::Csv => "CSV",
            OutputFormat::Xml => "XML",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TXT" => Ok(OutputFormat::Txt),
            "HTML" => Ok(OutputFormat::Html),
            "CSV" => Ok(OutputFormat::Csv),
            "XML" => Ok(OutputFormat::Xml),
            other => Err(HarnessError::ProtocolViolation(format!("Unknown output format: {}", other))),
        }
    }
}

/// Template as echoed by `POST /v1/templates`; the format comes back lowercase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateResponse {
    pub id: String,
    pub output_format: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl TemplateResponse {
    pub fn format(&self) -> Result<OutputFormat> {
        self.output_format.parse()
    }
}
