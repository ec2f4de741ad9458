//! CLI surface: the flags the core consumes, parsed with `clap::Parser`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bookwright", about = "Resumable multi-phase book illustration pipeline")]
pub struct Cli {
    /// Path to the parsed book directory/descriptor (external collaborator's output).
    pub book_path: PathBuf,

    /// Run the Analyze phase (default when no phase flag is given).
    #[arg(long)]
    pub text: bool,
    /// Run the Extract phase.
    #[arg(long)]
    pub elements: bool,
    /// Run the Enrich phase.
    #[arg(long)]
    pub enrich: bool,
    /// Run the Illustrate phase.
    #[arg(long)]
    pub images: bool,

    /// Comma-separated list of integers or inclusive `a-b` ranges, by reading-order index.
    #[arg(long)]
    pub chapters: Option<String>,
    /// `type:name`, `*:name`, `type:*`, wildcard `*` in names.
    #[arg(long, name = "elements-filter")]
    pub elements_filter: Option<String>,
    /// Caps items processed.
    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long)]
    pub r#continue: bool,
    #[arg(long)]
    pub force: bool,
    #[arg(long, name = "skip-failed")]
    pub skip_failed: bool,
    #[arg(long, name = "retry-failed")]
    pub retry_failed: bool,
    #[arg(long, name = "clear-errors")]
    pub clear_errors: bool,

    #[arg(long)]
    pub model: Option<String>,
    #[arg(long, name = "api-key")]
    pub api_key: Option<String>,
    #[arg(long, name = "image-key")]
    pub image_key: Option<String>,
    #[arg(long)]
    pub provider: Option<String>,
    #[arg(long, name = "output-dir")]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub dashboard: bool,
    #[arg(long, name = "dashboard-port", default_value_t = 3000)]
    pub dashboard_port: u16,
    #[arg(long, name = "dashboard-host", default_value = "localhost")]
    pub dashboard_host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSelection {
    Analyze,
    Extract,
    Enrich,
    Illustrate,
}

impl Cli {
    /// Phase selection: when none of `--text/--elements/--enrich/--images` is
    /// given, analyze is the default.
    pub fn selected_phases(&self) -> Vec<PhaseSelection> {
        let mut phases = Vec::new();
        if self.text {
            phases.push(PhaseSelection::Analyze);
        }
        if self.elements {
            phases.push(PhaseSelection::Extract);
        }
        if self.enrich {
            phases.push(PhaseSelection::Enrich);
        }
        if self.images {
            phases.push(PhaseSelection::Illustrate);
        }
        if phases.is_empty() {
            phases.push(PhaseSelection::Analyze);
        }
        phases
    }
}

/// Parses `--chapters`'s comma-separated list of integers / inclusive ranges
/// into dense 1-based reading-order positions.
pub fn parse_chapter_filter(spec: &str) -> anyhow::Result<Vec<usize>> {
    let mut positions = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((a, b)) = part.split_once('-') {
            let start: usize = a.trim().parse().map_err(|_| anyhow::anyhow!("invalid range start in '{part}'"))?;
            let end: usize = b.trim().parse().map_err(|_| anyhow::anyhow!("invalid range end in '{part}'"))?;
            if start == 0 || end < start {
                anyhow::bail!("invalid chapter range '{part}'");
            }
            positions.extend(start..=end);
        } else {
            let n: usize = part.parse().map_err(|_| anyhow::anyhow!("invalid chapter index '{part}'"))?;
            if n == 0 {
                anyhow::bail!("chapter index must be >= 1, got '{part}'");
            }
            positions.push(n);
        }
    }
    positions.sort_unstable();
    positions.dedup();
    Ok(positions)
}

/// Maps 1-based reading-order positions onto the book's dense chapter
/// numbers, i.e. `S[i]`-th position -> the i-th chapter in reading order
/// ("Chapter mapping").
pub fn map_positions_to_chapter_numbers(positions: &[usize], chapter_numbers_in_reading_order: &[u32]) -> anyhow::Result<Vec<u32>> {
    positions
        .iter()
        .map(|&pos| {
            chapter_numbers_in_reading_order
                .get(pos - 1)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("chapter position {pos} is out of range"))
        })
        .collect()
}

/// `type:name`, `*:name`, `type:*`, wildcard `*` in names.
#[derive(Debug, Clone)]
pub struct ElementsFilter {
    pub type_pattern: String,
    pub name_pattern: String,
}

impl ElementsFilter {
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let (type_part, name_part) = spec
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("elements filter must be 'type:name', got '{spec}'"))?;
        Ok(ElementsFilter {
            type_pattern: type_part.trim().to_string(),
            name_pattern: name_part.trim().to_string(),
        })
    }

    pub fn matches(&self, entity_type_str: &str, name: &str) -> bool {
        wildcard_match(&self.type_pattern, entity_type_str) && wildcard_match(&self.name_pattern, name)
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let pattern = pattern.to_lowercase();
    let value = value.to_lowercase();
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern == value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phase_is_analyze() {
        let cli = Cli::parse_from(["bookwright", "book/"]);
        assert_eq!(cli.selected_phases(), vec![PhaseSelection::Analyze]);
    }

    #[test]
    fn explicit_phase_flags_override_default() {
        let cli = Cli::parse_from(["bookwright", "book/", "--images"]);
        assert_eq!(cli.selected_phases(), vec![PhaseSelection::Illustrate]);
    }

    #[test]
    fn scenario_chapter_filter_mapping() {
        // Book has 5 chapters numbered 3,7,9,12,14 due to front-matter.
        let chapter_numbers = vec![3, 7, 9, 12, 14];
        let positions = parse_chapter_filter("1-2,5").unwrap();
        assert_eq!(positions, vec![1, 2, 5]);
        let mapped = map_positions_to_chapter_numbers(&positions, &chapter_numbers).unwrap();
        assert_eq!(mapped, vec![3, 7, 14]);
    }

    #[test]
    fn chapter_filter_rejects_zero_and_backwards_ranges() {
        assert!(parse_chapter_filter("0").is_err());
        assert!(parse_chapter_filter("5-2").is_err());
    }

    #[test]
    fn elements_filter_wildcards() {
        let f = ElementsFilter::parse("*:Drag*").unwrap();
        assert!(f.matches("creature", "Dragon"));
        assert!(f.matches("character", "Dragonfly"));
        assert!(!f.matches("character", "Wyrm"));

        let f2 = ElementsFilter::parse("creature:*").unwrap();
        assert!(f2.matches("creature", "anything"));
        assert!(!f2.matches("place", "anything"));
    }
}
