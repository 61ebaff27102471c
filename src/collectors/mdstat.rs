use crate::collectors::ReportSnapshot;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::warn;

pub fn collect_report(path: impl AsRef<Path>) -> ReportSnapshot {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(text) => ReportSnapshot {
            text,
            source_available: true,
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "файл состояния RAID не найден");
            ReportSnapshot::default()
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "не удалось открыть файл состояния RAID");
            ReportSnapshot::default()
        }
    }
}
