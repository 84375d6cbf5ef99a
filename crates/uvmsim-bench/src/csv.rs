//! Results CSV emitter
//!
//! The header layout is a stability guarantee for downstream tooling; do
//! not reorder fields.

use std::io::Write;
use std::path::Path;

/// One row of the benchmark results CSV.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResultRow {
    pub benchmark: String,
    pub working_set_mb: u64,
    pub gpu_memory_mb: u64,
    pub page_faults: u64,
    pub migrations: u64,
    pub migrated_mb: f64,
    pub total_time_us: u64,
    pub throughput_pages_sec: f64,
    pub fault_rate_per_sec: f64,
}

/// Write benchmark results to a CSV file.
pub fn write_results_csv(path: &Path, rows: &[ResultRow]) -> std::io::Result<()> {
    let mut f = std::fs::File::create(path)?;
    writeln!(
        f,
        "Benchmark,Working_Set_MB,GPU_Memory_MB,Page_Faults,Migrations,Migrated_MB,Total_Time_us,Throughput_pages_sec,Fault_Rate_per_sec"
    )?;
    for r in rows {
        writeln!(
            f,
            "{},{},{},{},{},{:.2},{},{:.2},{:.2}",
            escape_csv(&r.benchmark),
            r.working_set_mb,
            r.gpu_memory_mb,
            r.page_faults,
            r.migrations,
            r.migrated_mb,
            r.total_time_us,
            r.throughput_pages_sec,
            r.fault_rate_per_sec,
        )?;
    }
    Ok(())
}

/// Minimal CSV escaping: wrap in quotes if the value contains a comma or quote.
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_plain() {
        assert_eq!(escape_csv("Random Page Access"), "Random Page Access");
    }

    #[test]
    fn escape_comma() {
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
    }

    #[test]
    fn write_results_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let rows = vec![ResultRow {
            benchmark: "Random Page Access".into(),
            working_set_mb: 256,
            gpu_memory_mb: 64,
            page_faults: 123,
            migrations: 456,
            migrated_mb: 28.5,
            total_time_us: 1_000_000,
            throughput_pages_sec: 4096.0,
            fault_rate_per_sec: 123.0,
        }];
        write_results_csv(&path, &rows).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "Benchmark,Working_Set_MB,GPU_Memory_MB,Page_Faults,Migrations,Migrated_MB,Total_Time_us,Throughput_pages_sec,Fault_Rate_per_sec"
        );
        assert!(lines[1].starts_with("Random Page Access,256,64,123,456,28.50,"));
    }
}
