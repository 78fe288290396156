use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::types::{EntryStatus, LedgerEntry};

#[derive(Debug, Clone, PartialEq)]
pub struct StyleCount {
    pub style: String,
    pub count: usize,
    pub percentage: f64,
}

/// Distribution of primary styles across successful classifications.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleSummary {
    pub classified: usize,
    pub failed: usize,
    /// Sorted by descending count, then by style name.
    pub styles: Vec<StyleCount>,
}

impl StyleSummary {
    /// Builds the summary from ledger rows; the last row per identity wins.
    pub fn from_entries(entries: &[LedgerEntry]) -> Self {
        let latest: HashMap<&str, &LedgerEntry> = entries
            .iter()
            .map(|entry| (entry.identity.as_str(), entry))
            .collect();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut classified = 0;
        let mut failed = 0;
        for entry in latest.into_values() {
            match entry.status {
                EntryStatus::Succeeded => {
                    classified += 1;
                    *counts.entry(entry.primary_style.as_str()).or_default() += 1;
                }
                EntryStatus::Failed => failed += 1,
            }
        }

        let mut styles: Vec<_> = counts
            .into_iter()
            .map(|(style, count)| StyleCount {
                style: style.to_string(),
                count,
                percentage: (count as f64 / classified as f64 * 1000.0).round() / 10.0,
            })
            .collect();
        styles.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.style.cmp(&b.style)));

        Self {
            classified,
            failed,
            styles,
        }
    }

    pub fn top(&self, n: usize) -> &[StyleCount] {
        &self.styles[..n.min(self.styles.len())]
    }

    pub fn display_top(&self, n: usize) -> TopStyles<'_> {
        TopStyles { summary: self, n }
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["style", "count", "percentage"])?;
        for style in &self.styles {
            let count = style.count.to_string();
            let percentage = format!("{:.1}", style.percentage);
            writer.write_record([style.style.as_str(), count.as_str(), percentage.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub struct TopStyles<'a> {
    summary: &'a StyleSummary,
    n: usize,
}

impl fmt::Display for TopStyles<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Classified images: {} ({} recorded failures)",
            self.summary.classified, self.summary.failed
        )?;
        if self.summary.styles.is_empty() {
            return Ok(());
        }
        writeln!(f, "Top primary styles:")?;
        for style in self.summary.top(self.n) {
            writeln!(
                f,
                "  {}: {} ({:.1}%)",
                style.style, style.count, style.percentage
            )?;
        }
        Ok(())
    }
}
