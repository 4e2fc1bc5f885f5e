//! Value types exchanged with the report service, plus identifier predicates

pub mod filter;
pub mod identifiers;
pub mod report;

pub use filter::{single_filter, FilterCondition, FilterValue, Filters};
pub use identifiers::{all_unique, generate_v7, is_canonical, is_monotonic, is_uuid_v7};
pub use report::{CreateReportRequest, OutputFormat, ReportList, ReportProbe, ReportStatus, TemplateResponse};
