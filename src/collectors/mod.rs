pub mod mdstat;

#[derive(Debug, Clone, Default)]
pub struct ReportSnapshot {
    pub text: String,
    pub source_available: bool,
}
