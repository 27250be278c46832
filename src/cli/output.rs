use std::fmt::{self, Write as FmtWrite};

use serde::Serialize;

use crate::models::{ExtractionRun, IndexStats, OutputFormat, SearchResults};
use crate::server::protocol::HealthReport;

pub trait Formatter {
    fn format_search_results(&self, results: &SearchResults) -> String;
    fn format_run(&self, run: &ExtractionRun) -> String;
    fn format_stats(&self, stats: &IndexStats) -> String;
    fn format_health(&self, health: &HealthReport) -> String;
    fn format_status(&self, status: &StatusInfo) -> String;
    fn format_message(&self, message: &str) -> String;
    fn format_error(&self, error: &str) -> String;
}

/// What `dbvec status` gathers: daemon state plus whatever it can report.
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub daemon_running: bool,
    pub socket_path: String,
    pub health: Option<HealthReport>,
    pub stats: Option<IndexStats>,
    pub latest_run: Option<ExtractionRun>,
}

fn render(f: impl FnOnce(&mut String) -> fmt::Result) -> String {
    let mut output = String::new();
    // writing into a String cannot fail
    let _ = f(&mut output);
    output
}

fn mark(ok: bool) -> &'static str {
    if ok { "✓" } else { "✗" }
}

pub struct TextFormatter;

impl TextFormatter {
    fn write_run(output: &mut String, run: &ExtractionRun) -> fmt::Result {
        writeln!(output, "Run:        {}", run.run_id)?;
        writeln!(output, "  Project:  {}", run.project_id)?;
        writeln!(output, "  Status:   {}", run.status)?;
        if run.force_refresh {
            writeln!(output, "  Mode:     force refresh")?;
        }
        writeln!(output, "  Started:  {}", run.started_at.to_rfc3339())?;
        if let Some(finished) = run.finished_at {
            writeln!(output, "  Finished: {}", finished.to_rfc3339())?;
        }
        if let Some(ms) = run.duration_ms() {
            writeln!(output, "  Duration: {}ms", ms)?;
        }
        writeln!(
            output,
            "  Progress: {} datasets, {} tables, {} records",
            run.datasets_processed, run.tables_processed, run.records_processed
        )?;
        if run.records_reused > 0 || run.records_skipped > 0 || run.records_stale > 0 {
            writeln!(
                output,
                "            {} reused, {} stale, {} skipped",
                run.records_reused, run.records_stale, run.records_skipped
            )?;
        }
        if let Some(ref error) = run.error {
            writeln!(output, "  Error:    {}", error)?;
        }
        Ok(())
    }

    fn write_stats(output: &mut String, stats: &IndexStats) -> fmt::Result {
        writeln!(output, "Collection: {}", stats.collection)?;
        writeln!(output, "  Records:     {}", stats.total_records)?;
        writeln!(output, "  Dimension:   {}", stats.dimension)?;
        writeln!(output, "  Generations: {} active", stats.active_generations)?;
        match stats.last_updated {
            Some(ts) => writeln!(output, "  Updated:     {}", ts.to_rfc3339()),
            None => writeln!(output, "  Updated:     never"),
        }
    }

    fn write_health(output: &mut String, health: &HealthReport) -> fmt::Result {
        writeln!(
            output,
            "Daemon:     {} (up {}s, {} requests)",
            health.status, health.uptime_secs, health.requests_served
        )?;
        for component in &health.components {
            write!(output, "  {} {}", mark(component.healthy), component.name)?;
            match component.error {
                Some(ref error) => writeln!(output, ": {}", error)?,
                None => writeln!(output)?,
            }
        }
        Ok(())
    }
}

impl Formatter for TextFormatter {
    fn format_search_results(&self, results: &SearchResults) -> String {
        if results.is_empty() {
            return format!("No results found for: {}\n", results.query);
        }

        render(|output| {
            writeln!(output, "Search results for: \"{}\"", results.query)?;
            writeln!(
                output,
                "Found {} results in {}ms\n",
                results.total, results.duration_ms
            )?;

            for (i, hit) in results.results.iter().enumerate() {
                let record = &hit.record;
                writeln!(output, "{}. [Score: {:.3}] {}", i + 1, hit.score, hit.identity)?;
                writeln!(
                    output,
                    "   Type: {} ({}{})",
                    record.data_type,
                    record.mode,
                    if record.is_nullable { ", nullable" } else { "" }
                )?;
                if let Some(ref description) = record.description {
                    writeln!(output, "   {}", description)?;
                }
                writeln!(output)?;
            }
            Ok(())
        })
    }

    fn format_run(&self, run: &ExtractionRun) -> String {
        render(|output| Self::write_run(output, run))
    }

    fn format_stats(&self, stats: &IndexStats) -> String {
        render(|output| Self::write_stats(output, stats))
    }

    fn format_health(&self, health: &HealthReport) -> String {
        render(|output| Self::write_health(output, health))
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        render(|output| {
            writeln!(output, "Status")?;
            writeln!(output, "------")?;
            if !status.daemon_running {
                writeln!(output, "Daemon:     [STOPPED]")?;
                writeln!(output, "  Socket:   {}", status.socket_path)?;
                return Ok(());
            }

            match status.health {
                Some(ref health) => Self::write_health(output, health)?,
                None => writeln!(output, "Daemon:     [RUNNING]")?,
            }
            writeln!(output)?;
            if let Some(ref stats) = status.stats {
                Self::write_stats(output, stats)?;
                writeln!(output)?;
            }
            match status.latest_run {
                Some(ref run) => Self::write_run(output, run)?,
                None => writeln!(output, "No extraction runs yet")?,
            }
            Ok(())
        })
    }

    fn format_message(&self, message: &str) -> String {
        format!("{}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}\n", error)
    }
}

pub struct JsonFormatter {
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn to_json(&self, value: &impl Serialize) -> String {
        let encoded = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        let mut json = encoded
            .unwrap_or_else(|e| serde_json::json!({"error": e.to_string()}).to_string());
        json.push('\n');
        json
    }
}

impl Formatter for JsonFormatter {
    fn format_search_results(&self, results: &SearchResults) -> String {
        self.to_json(results)
    }

    fn format_run(&self, run: &ExtractionRun) -> String {
        self.to_json(run)
    }

    fn format_stats(&self, stats: &IndexStats) -> String {
        self.to_json(stats)
    }

    fn format_health(&self, health: &HealthReport) -> String {
        self.to_json(health)
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        self.to_json(status)
    }

    fn format_message(&self, message: &str) -> String {
        self.to_json(&serde_json::json!({"message": message}))
    }

    fn format_error(&self, error: &str) -> String {
        self.to_json(&serde_json::json!({"error": error}))
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Text => Box::new(TextFormatter),
        OutputFormat::Json => Box::new(JsonFormatter::new(true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnMode, ColumnRecord, DatasetRef, SearchHit};
    use crate::server::protocol::ComponentHealth;

    fn results() -> SearchResults {
        let table = DatasetRef::new("acme", "crm").table("customers");
        let record = ColumnRecord::new(&table, "email", "STRING", ColumnMode::Nullable)
            .with_description(Some("Primary contact email".to_string()));
        let hit = SearchHit {
            identity: record.identity.clone(),
            score: 0.912,
            record,
        };
        SearchResults::new("email".to_string(), vec![hit], 12)
    }

    #[test]
    fn test_text_search_results() {
        let output = TextFormatter.format_search_results(&results());
        assert!(output.contains("acme.crm.customers.email"));
        assert!(output.contains("[Score: 0.912]"));
        assert!(output.contains("Primary contact email"));
    }

    #[test]
    fn test_text_empty_results() {
        let empty = SearchResults::new("nothing".to_string(), Vec::new(), 1);
        assert_eq!(
            TextFormatter.format_search_results(&empty),
            "No results found for: nothing\n"
        );
    }

    #[test]
    fn test_json_search_results() {
        let output = JsonFormatter::new(false).format_search_results(&results());
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["total"], 1);
        assert_eq!(value["results"][0]["identity"]["column_name"], "email");
    }

    #[test]
    fn test_text_run_shows_failure() {
        let mut run = ExtractionRun::new("acme", true);
        run.mark_failed("cancelled");
        let output = TextFormatter.format_run(&run);
        assert!(output.contains("failed"));
        assert!(output.contains("force refresh"));
        assert!(output.contains("Error:    cancelled"));
    }

    #[test]
    fn test_text_health_marks_components() {
        let health = HealthReport {
            status: "ok".to_string(),
            uptime_secs: 3,
            requests_served: 7,
            components: vec![
                ComponentHealth::from_check::<String>("index (meta)", Ok(true)),
                ComponentHealth::from_check("catalog (bigquery)", Err("no token")),
            ],
        };
        let output = TextFormatter.format_health(&health);
        assert!(output.contains("✓ index (meta)"));
        assert!(output.contains("✗ catalog (bigquery): no token"));
    }

    #[test]
    fn test_stopped_status() {
        let status = StatusInfo {
            daemon_running: false,
            socket_path: "/tmp/dbvec.sock".to_string(),
            health: None,
            stats: None,
            latest_run: None,
        };
        assert!(TextFormatter.format_status(&status).contains("[STOPPED]"));
    }
}
