use chrono::Datelike;
use clap::{Parser, Subcommand};
use colored::Colorize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const DEFAULT_DATA_PATH: &str = "hmv_data.csv";
const BOILERPLATE_MARKER: &str = "(FOR REFERENCE ONLY)";

// Token-set score required for two combined keys to share a cluster
const CLUSTER_THRESHOLD: f64 = 90.0;
// Minimum averaged overlap for an approximate match
const APPROX_FLOOR: f64 = 55.0;
// Approximate tier keeps at most this many candidates
const APPROX_LIMIT: usize = 2;
// Quotes within this percent of the historic mean are "expected range"
const TOLERANCE_PCT: f64 = 5.0;

/// fairquote - Fair-quote validation of maintenance repair hours against historical records
#[derive(Parser)]
#[command(name = "fairquote")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true, default_value = ".fairquote.toml")]
    config: PathBuf,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a supplier quote against the historical dataset
    Analyze {
        /// Description of the non-routine discrepancy
        #[arg(short = 'd', long)]
        discrepancy: String,

        /// Corrective action taken
        #[arg(short = 'c', long)]
        corrective: String,

        /// Supplier quoted hours
        #[arg(long)]
        hours: f64,

        /// Dataset CSV path (overrides config)
        #[arg(long)]
        data: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Append a quote to the historical dataset as a new instance
    Add {
        /// Description of the non-routine discrepancy
        #[arg(short = 'd', long)]
        discrepancy: String,

        /// Corrective action taken
        #[arg(short = 'c', long)]
        corrective: String,

        /// Supplier quoted hours
        #[arg(long)]
        hours: f64,

        /// Year recorded for the new instance (defaults to the current year)
        #[arg(long)]
        year: Option<i32>,

        /// Dataset CSV path (overrides config)
        #[arg(long)]
        data: Option<PathBuf>,
    },

    /// List canonical clusters with fair-quote statistics
    Clusters {
        /// Maximum clusters to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Dataset CSV path (overrides config)
        #[arg(long)]
        data: Option<PathBuf>,
    },

    /// Show dataset statistics
    Stats {
        /// Dataset CSV path (overrides config)
        #[arg(long)]
        data: Option<PathBuf>,
    },

    /// Interactive quote analysis
    Repl {
        /// Dataset CSV path (overrides config)
        #[arg(long)]
        data: Option<PathBuf>,
    },
}

// Data structures

#[derive(Serialize, Deserialize, Debug, Clone)]
struct HistoricalRecord {
    description: String,
    corrective_action: String,
    total_hours: f64,
    year: i32,
}

#[derive(Serialize, Debug, Clone)]
struct ReferenceRecord {
    description: String,
    corrective_action: String,
    total_hours: f64,
    year: i32,
    norm_discrepancy: String,
    norm_corrective: String,
    combined_key: String,
    cluster_key: String,
    historic_hours: f64,
    occurrences: usize,
    fair_quote: f64,
}

#[derive(Serialize, Debug, Clone)]
struct ClusterSummary {
    representative: String,
    members: Vec<String>,
    occurrences: usize,
    mean_hours: f64,
    fair_quote: f64,
}

#[derive(Serialize, Debug)]
struct ReferenceTable {
    records: Vec<ReferenceRecord>,
    clusters: Vec<ClusterSummary>,
}

#[derive(Debug, Clone)]
struct QueryInput {
    norm_discrepancy: String,
    norm_corrective: String,
    combined_key: String,
}

#[derive(Serialize, Debug, Clone)]
struct ScoredRecord {
    #[serde(flatten)]
    record: ReferenceRecord,
    overlap: f64,
}

#[derive(Serialize, Debug)]
#[serde(tag = "tier")]
enum MatchOutcome {
    #[serde(rename = "EXACT")]
    Exact { records: Vec<ReferenceRecord> },
    #[serde(rename = "APPROXIMATE")]
    Approximate { candidates: Vec<ScoredRecord> },
    #[serde(rename = "WEAK")]
    Weak { nearest: ScoredRecord },
    #[serde(rename = "NONE")]
    None,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Severity {
    Approve,
    Neutral,
    Alert,
}

#[derive(Serialize, Debug)]
struct Decision {
    recommendation: String,
    severity: Severity,
    percent_display: String,
    diff_class: String,
}

// Config

#[derive(Deserialize, Debug, Default)]
struct Config {
    #[serde(default)]
    dataset: DatasetConfig,
}

#[derive(Deserialize, Debug, Default)]
struct DatasetConfig {
    path: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(&cli.config);

    let result = match cli.command {
        Commands::Analyze { discrepancy, corrective, hours, data, json } => {
            let data = resolve_data_path(&data, &config);
            cmd_analyze(&discrepancy, &corrective, hours, &data, json, cli.quiet)
        }
        Commands::Add { discrepancy, corrective, hours, year, data } => {
            let data = resolve_data_path(&data, &config);
            cmd_add(&discrepancy, &corrective, hours, year, &data, cli.quiet)
        }
        Commands::Clusters { limit, json, data } => {
            let data = resolve_data_path(&data, &config);
            cmd_clusters(limit, json, &data)
        }
        Commands::Stats { data } => {
            let data = resolve_data_path(&data, &config);
            cmd_stats(&data)
        }
        Commands::Repl { data } => {
            let data = resolve_data_path(&data, &config);
            cmd_repl(&data)
        }
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Config {
    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "{}: ignoring malformed config {}: {}",
                    "warning".yellow(),
                    path.display(),
                    e
                );
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

fn resolve_data_path(flag: &Option<PathBuf>, config: &Config) -> PathBuf {
    flag.clone()
        .or_else(|| config.dataset.path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH))
}

// ============================================================================
// Text normalization
// ============================================================================

fn date_pattern() -> &'static Regex {
    static DATE_RE: OnceLock<Regex> = OnceLock::new();
    DATE_RE.get_or_init(|| Regex::new(r"\b\d{1,2}[-/]\d{1,2}[-/]\d{2,4}\b").unwrap())
}

/// Canonical comparable form: uppercase, dates removed, whitespace collapsed.
/// Total over all inputs; empty in, empty out.
fn normalize_text(text: &str) -> String {
    let upper = text.to_uppercase();
    let without_dates = date_pattern().replace_all(&upper, "");
    without_dates.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Discrepancy text additionally loses the reference-only boilerplate marker.
fn normalize_discrepancy(text: &str) -> String {
    normalize_text(&text.replace(BOILERPLATE_MARKER, ""))
}

/// The clustering/matching unit. Empty when both sides normalized to nothing,
/// so records with no usable text never enter the reference table.
fn combined_key(norm_discrepancy: &str, norm_corrective: &str) -> String {
    if norm_discrepancy.is_empty() && norm_corrective.is_empty() {
        return String::new();
    }
    format!("{} | {}", norm_discrepancy, norm_corrective)
}

fn prepare_query(discrepancy: &str, corrective: &str) -> QueryInput {
    let norm_discrepancy = normalize_discrepancy(discrepancy);
    let norm_corrective = normalize_text(corrective);
    let key = combined_key(&norm_discrepancy, &norm_corrective);
    QueryInput {
        norm_discrepancy,
        norm_corrective,
        combined_key: key,
    }
}

// ============================================================================
// Similarity engine
// ============================================================================

/// Token-set ratio (0-100): order-insensitive comparison of two strings as
/// bags of whitespace tokens. Scores the best pairing of the sorted
/// intersection and difference strings, so a token-subset scores 100.
fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens_a: BTreeSet<&str> = a.split_whitespace().collect();
    let tokens_b: BTreeSet<&str> = b.split_whitespace().collect();

    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let common: Vec<&str> = tokens_a.intersection(&tokens_b).cloned().collect();
    let only_a: Vec<&str> = tokens_a.difference(&tokens_b).cloned().collect();
    let only_b: Vec<&str> = tokens_b.difference(&tokens_a).cloned().collect();

    let base = common.join(" ");
    let combined_a = join_token_groups(&base, &only_a);
    let combined_b = join_token_groups(&base, &only_b);

    let ratio = strsim::normalized_levenshtein(&base, &combined_a)
        .max(strsim::normalized_levenshtein(&base, &combined_b))
        .max(strsim::normalized_levenshtein(&combined_a, &combined_b));

    ratio * 100.0
}

fn join_token_groups(base: &str, rest: &[&str]) -> String {
    if rest.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return rest.join(" ");
    }
    format!("{} {}", base, rest.join(" "))
}

/// Sequence overlap (0-100): longest common subsequence over whitespace token
/// sequences, ratio = 2 * matches / (len_a + len_b). Order sensitive, unlike
/// the token-set ratio. Either side empty scores 0.
fn sequence_overlap(a: &str, b: &str) -> f64 {
    let tokens_a: Vec<&str> = a.split_whitespace().collect();
    let tokens_b: Vec<&str> = b.split_whitespace().collect();

    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let matches = lcs_len(&tokens_a, &tokens_b);
    2.0 * matches as f64 / (tokens_a.len() + tokens_b.len()) as f64 * 100.0
}

fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for &word_a in a {
        for (j, &word_b) in b.iter().enumerate() {
            curr[j + 1] = if word_a == word_b {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
        curr[0] = 0;
    }

    prev[b.len()]
}

/// Averaged overlap between a query and one reference record: discrepancy
/// against discrepancy, corrective against corrective, unweighted mean.
fn record_overlap(query: &QueryInput, record: &ReferenceRecord) -> f64 {
    let disc = sequence_overlap(&query.norm_discrepancy, &record.norm_discrepancy);
    let corr = sequence_overlap(&query.norm_corrective, &record.norm_corrective);
    (disc + corr) / 2.0
}

// ============================================================================
// Reference table construction (normalize + cluster + aggregate)
// ============================================================================

/// Pure rebuild of the full reference table from the raw dataset. Clustering
/// is single-pass and greedy: a key joins the first existing cluster whose
/// representative scores at or above the threshold, not the best-matching
/// one. Historic fair-quote values depend on that ordering, so it must stay
/// first-match-wins.
fn build_reference_table(history: &[HistoricalRecord]) -> ReferenceTable {
    struct Normalized {
        disc: String,
        corr: String,
        key: String,
    }

    let normalized: Vec<Normalized> = history
        .iter()
        .map(|r| {
            let disc = normalize_discrepancy(&r.description);
            let corr = normalize_text(&r.corrective_action);
            let key = combined_key(&disc, &corr);
            Normalized { disc, corr, key }
        })
        .collect();

    // Distinct non-empty keys in first-occurrence order
    let mut seen: HashSet<&str> = HashSet::new();
    let mut distinct: Vec<&str> = Vec::new();
    for n in &normalized {
        if n.key.is_empty() {
            continue;
        }
        if seen.insert(&n.key) {
            distinct.push(&n.key);
        }
    }

    // Greedy first-match clustering against representatives in creation order
    let mut cluster_members: Vec<(String, Vec<String>)> = Vec::new();
    for key in distinct {
        let mut placed = false;
        for (rep, members) in cluster_members.iter_mut() {
            if token_set_ratio(key, rep) >= CLUSTER_THRESHOLD {
                members.push(key.to_string());
                placed = true;
                break;
            }
        }
        if !placed {
            cluster_members.push((key.to_string(), vec![key.to_string()]));
        }
    }

    let key_to_rep: HashMap<&str, &str> = cluster_members
        .iter()
        .flat_map(|(rep, members)| members.iter().map(move |k| (k.as_str(), rep.as_str())))
        .collect();

    // Aggregate hours per cluster across every record mapping into it
    let mut totals: HashMap<&str, (f64, usize)> = HashMap::new();
    for (record, n) in history.iter().zip(&normalized) {
        if n.key.is_empty() {
            continue;
        }
        let rep = key_to_rep[n.key.as_str()];
        let entry = totals.entry(rep).or_insert((0.0, 0));
        entry.0 += record.total_hours;
        entry.1 += 1;
    }

    let clusters: Vec<ClusterSummary> = cluster_members
        .iter()
        .map(|(rep, members)| {
            let (sum, count) = totals[rep.as_str()];
            let mean = sum / count as f64;
            ClusterSummary {
                representative: rep.clone(),
                members: members.clone(),
                occurrences: count,
                mean_hours: mean,
                fair_quote: round_two(mean),
            }
        })
        .collect();

    let records: Vec<ReferenceRecord> = history
        .iter()
        .zip(&normalized)
        .filter(|(_, n)| !n.key.is_empty())
        .map(|(record, n)| {
            let rep = key_to_rep[n.key.as_str()];
            let (sum, count) = totals[rep];
            let mean = sum / count as f64;
            ReferenceRecord {
                description: record.description.clone(),
                corrective_action: record.corrective_action.clone(),
                total_hours: record.total_hours,
                year: record.year,
                norm_discrepancy: n.disc.clone(),
                norm_corrective: n.corr.clone(),
                combined_key: n.key.clone(),
                cluster_key: rep.to_string(),
                historic_hours: mean,
                occurrences: count,
                fair_quote: round_two(mean),
            }
        })
        .collect();

    ReferenceTable { records, clusters }
}

fn round_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// Query matching
// ============================================================================

/// Tiered match against the reference table, evaluated in strict priority
/// order: byte-equal combined key, then averaged overlap at or above the
/// floor (top 2, stable sort keeps table order on ties), then the single
/// nearest record below the floor. Empty table is the explicit NONE case.
fn match_query(query: &QueryInput, table: &ReferenceTable) -> MatchOutcome {
    if table.records.is_empty() {
        return MatchOutcome::None;
    }

    let exact: Vec<ReferenceRecord> = table
        .records
        .iter()
        .filter(|r| r.combined_key == query.combined_key)
        .cloned()
        .collect();
    if !exact.is_empty() {
        return MatchOutcome::Exact { records: exact };
    }

    let scored: Vec<ScoredRecord> = table
        .records
        .iter()
        .map(|r| ScoredRecord {
            record: r.clone(),
            overlap: record_overlap(query, r),
        })
        .collect();

    let mut above: Vec<ScoredRecord> = scored
        .iter()
        .filter(|s| s.overlap >= APPROX_FLOOR && s.record.combined_key != query.combined_key)
        .cloned()
        .collect();
    if !above.is_empty() {
        above.sort_by(|a, b| {
            b.overlap
                .partial_cmp(&a.overlap)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        above.truncate(APPROX_LIMIT);
        return MatchOutcome::Approximate { candidates: above };
    }

    // Weak tier: single highest overlap, first-seen wins ties
    let mut nearest: Option<ScoredRecord> = None;
    for s in scored {
        let better = nearest.as_ref().map_or(true, |n| s.overlap > n.overlap);
        if better {
            nearest = Some(s);
        }
    }
    match nearest {
        Some(n) => MatchOutcome::Weak { nearest: n },
        Option::None => MatchOutcome::None,
    }
}

/// Fair-quote value the decision is made against: the single chosen record
/// from whichever tier fired.
fn fair_hours_for(outcome: &MatchOutcome) -> Option<f64> {
    match outcome {
        MatchOutcome::Exact { records } => records.first().map(|r| r.fair_quote),
        MatchOutcome::Approximate { candidates } => candidates.first().map(|s| s.record.fair_quote),
        MatchOutcome::Weak { nearest } => Some(nearest.record.fair_quote),
        MatchOutcome::None => Option::None,
    }
}

// ============================================================================
// Decision classification
// ============================================================================

fn classify(supplier_hours: f64, fair_hours: Option<f64>) -> Decision {
    let fair = match fair_hours {
        Some(f) if f != 0.0 && f.is_finite() => f,
        _ => {
            return Decision {
                recommendation: "No historical data available; manual review recommended."
                    .to_string(),
                severity: Severity::Alert,
                percent_display: "N/A (no historical data)".to_string(),
                diff_class: "diff-neutral".to_string(),
            }
        }
    };

    let percent_diff = (supplier_hours - fair) / fair * 100.0;
    let sign = if percent_diff >= 0.0 { "+" } else { "" };
    let percent_display = format!("{}{:.1}%", sign, percent_diff);

    let diff_class = if percent_diff < 0.0 {
        "diff-negative"
    } else if percent_diff.abs() <= TOLERANCE_PCT {
        "diff-neutral"
    } else {
        "diff-positive"
    };

    let (recommendation, severity) = if supplier_hours < fair {
        (
            "FAIR QUOTE: supplier below historic average. Consider approving.".to_string(),
            Severity::Approve,
        )
    } else if percent_diff.abs() <= TOLERANCE_PCT {
        (
            format!(
                "IN EXPECTED RANGE (within {:.0}%). Consider approving.",
                TOLERANCE_PCT
            ),
            Severity::Neutral,
        )
    } else {
        (
            "HIGHER THAN HISTORIC: needs review.".to_string(),
            Severity::Alert,
        )
    };

    Decision {
        recommendation,
        severity,
        percent_display,
        diff_class: diff_class.to_string(),
    }
}

// ============================================================================
// Dataset I/O
// ============================================================================

fn load_history(path: &Path) -> Result<(Vec<HistoricalRecord>, usize), Box<dyn std::error::Error>> {
    let file = fs::File::open(path).map_err(|_| {
        format!(
            "historical data not found: {}. Point --data (or .fairquote.toml) at the dataset CSV.",
            path.display()
        )
    })?;
    parse_history(file)
}

/// Parses the tabular dataset. Rows with non-numeric hours or with no usable
/// text in either field are skipped and counted rather than aborting the
/// load. A missing required column is fatal.
fn parse_history<R: io::Read>(
    input: R,
) -> Result<(Vec<HistoricalRecord>, usize), Box<dyn std::error::Error>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = rdr.headers()?.clone();
    let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));

    let desc_idx = find("Description").ok_or("dataset is missing a 'Description' column")?;
    let corr_idx =
        find("Corrective Action").ok_or("dataset is missing a 'Corrective Action' column")?;
    let hours_idx = find("Total Hours").ok_or("dataset is missing a 'Total Hours' column")?;
    let year_idx = find("Year");

    let mut records = Vec::new();
    let mut skipped = 0usize;

    for row in rdr.records() {
        let row = match row {
            Ok(r) => r,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        let description = row.get(desc_idx).unwrap_or("").to_string();
        let corrective_action = row.get(corr_idx).unwrap_or("").to_string();
        let hours = row.get(hours_idx).and_then(|s| s.parse::<f64>().ok());
        let year = year_idx
            .and_then(|i| row.get(i))
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(0);

        let has_text = !(description.trim().is_empty() && corrective_action.trim().is_empty());
        match hours {
            Some(h) if h.is_finite() && has_text => records.push(HistoricalRecord {
                description,
                corrective_action,
                total_hours: h,
                year,
            }),
            _ => skipped += 1,
        }
    }

    Ok((records, skipped))
}

/// Appends one raw record to the dataset as a single write, laid out to match
/// the file's own header order. The in-memory reference table is not touched;
/// callers rebuild before the new instance affects matching.
fn append_record(path: &Path, record: &HistoricalRecord) -> Result<(), Box<dyn std::error::Error>> {
    let existing =
        fs::read(path).map_err(|_| format!("historical data not found: {}", path.display()))?;

    let mut rdr = csv::ReaderBuilder::new().from_reader(existing.as_slice());
    let headers = rdr.headers()?.clone();

    let hours_text = format!("{}", record.total_hours);
    let year_text = record.year.to_string();

    let mut fields: Vec<&str> = vec![""; headers.len()];
    let mut matched = 0;
    for (i, header) in headers.iter().enumerate() {
        if header.eq_ignore_ascii_case("Description") {
            fields[i] = &record.description;
            matched += 1;
        } else if header.eq_ignore_ascii_case("Corrective Action") {
            fields[i] = &record.corrective_action;
            matched += 1;
        } else if header.eq_ignore_ascii_case("Total Hours") {
            fields[i] = &hours_text;
            matched += 1;
        } else if header.eq_ignore_ascii_case("Year") {
            fields[i] = &year_text;
            matched += 1;
        }
    }
    if matched < 3 {
        return Err(format!(
            "dataset {} lacks the expected columns; refusing to append",
            path.display()
        )
        .into());
    }

    let mut buf = Vec::new();
    {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&mut buf);
        wtr.write_record(&fields)?;
        wtr.flush()?;
    }

    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| format!("failed to open dataset for append: {}", e))?;
    if !existing.is_empty() && !existing.ends_with(b"\n") {
        file.write_all(b"\n")?;
    }
    file.write_all(&buf)?;

    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_analyze(
    discrepancy: &str,
    corrective: &str,
    supplier_hours: f64,
    data_path: &Path,
    json: bool,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    validate_hours(supplier_hours)?;

    let (history, skipped) = load_history(data_path)?;
    let table = build_reference_table(&history);
    let query = prepare_query(discrepancy, corrective);
    let outcome = match_query(&query, &table);
    let decision = classify(supplier_hours, fair_hours_for(&outcome));

    if json {
        let output = serde_json::json!({
            "match": outcome,
            "decision": decision,
            "supplier_hours": supplier_hours,
            "rows_loaded": history.len(),
            "rows_skipped": skipped,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if !quiet && skipped > 0 {
        eprintln!(
            "{}: {} malformed rows skipped during load",
            "note".dimmed(),
            skipped
        );
    }
    print_analysis(&query, &outcome, &decision, supplier_hours, data_path, quiet);

    Ok(())
}

fn cmd_add(
    discrepancy: &str,
    corrective: &str,
    hours: f64,
    year: Option<i32>,
    data_path: &Path,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    validate_hours(hours)?;

    if discrepancy.trim().is_empty() && corrective.trim().is_empty() {
        return Err("refusing to add a record with no discrepancy and no corrective action".into());
    }

    let record = HistoricalRecord {
        description: discrepancy.to_string(),
        corrective_action: corrective.to_string(),
        total_hours: hours,
        year: year.unwrap_or_else(|| chrono::Local::now().year()),
    };

    append_record(data_path, &record).map_err(|e| {
        format!(
            "failed to save new instance ({}); existing data left untouched",
            e
        )
    })?;

    if !quiet {
        println!(
            "{} New instance appended to {}",
            "Added.".green().bold(),
            data_path.display()
        );
        println!(
            "{}",
            "It will be used the next time the reference table is built.".dimmed()
        );
    }

    Ok(())
}

fn cmd_clusters(
    limit: usize,
    json: bool,
    data_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let (history, _) = load_history(data_path)?;
    let table = build_reference_table(&history);

    let mut clusters = table.clusters.clone();
    clusters.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));

    if json {
        println!("{}", serde_json::to_string_pretty(&clusters)?);
        return Ok(());
    }

    if clusters.is_empty() {
        println!("{}", "No reference data available.".yellow());
        return Ok(());
    }

    println!(
        "{} clusters from {} records (cluster threshold: {}%)\n",
        clusters.len().to_string().green().bold(),
        history.len(),
        CLUSTER_THRESHOLD as u32
    );
    println!(
        "{:>5} {:>10} {:>10}  {}",
        "Occ", "Mean", "Fair", "Representative key"
    );
    println!("{}", "-".repeat(70));

    for cluster in clusters.iter().take(limit) {
        println!(
            "{:>5} {:>10.2} {:>10.2}  {}",
            cluster.occurrences.to_string().cyan(),
            cluster.mean_hours,
            cluster.fair_quote,
            cluster.representative
        );
        for member in cluster
            .members
            .iter()
            .filter(|m| **m != cluster.representative)
        {
            println!("{:>29} {}", "~".dimmed(), member.dimmed());
        }
    }

    if clusters.len() > limit {
        println!(
            "\n{}",
            format!("... and {} more clusters", clusters.len() - limit).dimmed()
        );
    }

    Ok(())
}

fn cmd_stats(data_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (history, skipped) = load_history(data_path)?;
    let table = build_reference_table(&history);

    let distinct_keys: usize = table.clusters.iter().map(|c| c.members.len()).sum();
    let singletons = table.clusters.iter().filter(|c| c.occurrences == 1).count();
    let largest = table
        .clusters
        .iter()
        .map(|c| c.occurrences)
        .max()
        .unwrap_or(0);
    let total_hours: f64 = history.iter().map(|r| r.total_hours).sum();
    let mean_hours = if history.is_empty() {
        0.0
    } else {
        total_hours / history.len() as f64
    };

    println!("{}", "Dataset Statistics".green().bold());
    println!();
    println!(
        "  Source:             {}",
        data_path.display().to_string().cyan()
    );
    println!("  Records loaded:     {}", history.len().to_string().cyan());
    println!("  Rows skipped:       {}", skipped.to_string().cyan());
    println!(
        "  Reference records:  {}",
        table.records.len().to_string().cyan()
    );
    println!("  Distinct keys:      {}", distinct_keys.to_string().cyan());
    println!(
        "  Clusters:           {}",
        table.clusters.len().to_string().cyan()
    );
    println!("  Single-occurrence:  {}", singletons.to_string().cyan());
    println!("  Largest cluster:    {}", largest.to_string().cyan());
    println!("  Mean hours:         {:.2}", mean_hours);
    println!();

    let mut by_size = table.clusters.clone();
    by_size.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));

    println!("{}", "Top Clusters".green().bold());
    println!();
    for cluster in by_size.iter().take(10) {
        let bar = "=".repeat(cluster.occurrences.min(40));
        let key = truncate_key(&cluster.representative, 44);
        println!(
            "  {:>44} {:>4} {}",
            key.cyan(),
            cluster.occurrences,
            bar.dimmed()
        );
    }

    Ok(())
}

fn cmd_repl(data_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (mut history, skipped) = load_history(data_path)?;
    let mut table = build_reference_table(&history);

    println!("{}", "fairquote interactive mode".green().bold());
    println!(
        "Loaded {} records ({} skipped) from {}",
        history.len(),
        skipped,
        data_path.display()
    );
    println!("Commands: analyze, clusters, stats, reload, help, quit\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("{} ", ">".cyan().bold());
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        match line.trim() {
            "quit" | "exit" | "q" => break,
            "help" | "?" => {
                println!("  analyze   - Enter a quote and match it against history");
                println!("  clusters  - List canonical clusters");
                println!("  stats     - Show dataset statistics");
                println!("  reload    - Rebuild the reference table from disk");
                println!("  quit      - Exit");
            }
            "analyze" | "a" => {
                let discrepancy = match prompt(&stdin, &mut stdout, "Discrepancy: ")? {
                    Some(text) => text,
                    Option::None => break,
                };
                let corrective = match prompt(&stdin, &mut stdout, "Corrective action: ")? {
                    Some(text) => text,
                    Option::None => break,
                };
                let hours_text = match prompt(&stdin, &mut stdout, "Supplier quoted hours: ")? {
                    Some(text) => text,
                    Option::None => break,
                };
                let supplier_hours = match hours_text.parse::<f64>() {
                    Ok(h) if h.is_finite() && h >= 0.0 => h,
                    _ => {
                        println!("{}", "Hours must be a non-negative number.".yellow());
                        continue;
                    }
                };
                if discrepancy.is_empty() && corrective.is_empty() {
                    println!(
                        "{}",
                        "Enter a discrepancy or a corrective action first.".yellow()
                    );
                    continue;
                }

                let query = prepare_query(&discrepancy, &corrective);
                let outcome = match_query(&query, &table);
                let decision = classify(supplier_hours, fair_hours_for(&outcome));
                print_analysis(&query, &outcome, &decision, supplier_hours, data_path, false);

                // Only a weak (or empty) result is worth persisting as new history
                if matches!(outcome, MatchOutcome::Weak { .. } | MatchOutcome::None) {
                    let answer = prompt(
                        &stdin,
                        &mut stdout,
                        "Save as a new historical instance? [y/N] ",
                    )?;
                    if matches!(answer.as_deref(), Some("y") | Some("Y") | Some("yes")) {
                        let record = HistoricalRecord {
                            description: discrepancy,
                            corrective_action: corrective,
                            total_hours: supplier_hours,
                            year: chrono::Local::now().year(),
                        };
                        match append_record(data_path, &record) {
                            Ok(()) => {
                                let (reloaded, _) = load_history(data_path)?;
                                history = reloaded;
                                table = build_reference_table(&history);
                                println!(
                                    "{} Reference table rebuilt with {} records.",
                                    "Added.".green().bold(),
                                    history.len()
                                );
                            }
                            Err(e) => {
                                println!(
                                    "{}: {}. Existing data left untouched.",
                                    "save failed".red().bold(),
                                    e
                                );
                            }
                        }
                    }
                }
            }
            "clusters" => {
                let _ = cmd_clusters(20, false, data_path);
            }
            "stats" => {
                let _ = cmd_stats(data_path);
            }
            "reload" => {
                let (reloaded, reload_skipped) = load_history(data_path)?;
                history = reloaded;
                table = build_reference_table(&history);
                println!(
                    "Reloaded {} records ({} skipped).",
                    history.len(),
                    reload_skipped
                );
            }
            "" => continue,
            other => {
                println!(
                    "{}",
                    format!("Unknown command: {} (try 'help')", other).yellow()
                );
            }
        }
        println!();
    }

    Ok(())
}

// Helper functions

fn validate_hours(hours: f64) -> Result<(), Box<dyn std::error::Error>> {
    if hours.is_finite() && hours >= 0.0 {
        Ok(())
    } else {
        Err("supplier hours must be a non-negative number".into())
    }
}

fn prompt(
    stdin: &io::Stdin,
    stdout: &mut io::Stdout,
    label: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    print!("{}", label);
    stdout.flush()?;
    let mut line = String::new();
    if stdin.lock().read_line(&mut line)? == 0 {
        return Ok(Option::None);
    }
    Ok(Some(line.trim().to_string()))
}

fn severity_paint(severity: Severity, text: &str) -> colored::ColoredString {
    match severity {
        Severity::Approve => text.green().bold(),
        Severity::Neutral => text.blue().bold(),
        Severity::Alert => text.red().bold(),
    }
}

fn diff_paint(decision: &Decision) -> colored::ColoredString {
    match decision.diff_class.as_str() {
        "diff-negative" => decision.percent_display.green(),
        "diff-positive" => decision.percent_display.red(),
        _ => decision.percent_display.blue(),
    }
}

/// Marks the words of a historical text that do not occur in the query text.
fn highlight_novel_words(text: &str, reference: &str) -> String {
    let reference_words: HashSet<&str> = reference.split_whitespace().collect();
    text.split_whitespace()
        .map(|word| {
            if reference_words.contains(word) {
                word.to_string()
            } else {
                word.yellow().bold().to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_key(key: &str, max: usize) -> String {
    if key.chars().count() <= max {
        return key.to_string();
    }
    let cut: String = key.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

fn print_metrics(fair: Option<f64>, supplier_hours: f64, decision: &Decision) {
    match fair {
        Some(f) => println!("  Historic (fair) hours:  {:.2}", f),
        Option::None => println!("  Historic (fair) hours:  n/a"),
    }
    println!("  Supplier quoted hours:  {:.2}", supplier_hours);
    println!("  Difference:             {}", diff_paint(decision));
}

fn print_analysis(
    query: &QueryInput,
    outcome: &MatchOutcome,
    decision: &Decision,
    supplier_hours: f64,
    data_path: &Path,
    quiet: bool,
) {
    println!();
    println!(
        "{} {}",
        "Conclusion:".bold(),
        severity_paint(decision.severity, &decision.recommendation)
    );

    match outcome {
        MatchOutcome::Exact { records } => {
            println!("  Match type: {}", "Exact Match".green().bold());
            print_metrics(fair_hours_for(outcome), supplier_hours, decision);
            if quiet {
                return;
            }
            println!();
            println!("{}", "Exact historic match found".green());
            println!(
                "{:>8} {:>8} {:>5}  {}",
                "Hours", "Fair", "Occ", "Description | Corrective action"
            );
            println!("{}", "-".repeat(70));
            for record in records {
                println!(
                    "{:>8.2} {:>8.2} {:>5}  {} | {}",
                    record.total_hours,
                    record.fair_quote,
                    record.occurrences,
                    record.description,
                    record.corrective_action
                );
            }
        }
        MatchOutcome::Approximate { candidates } => {
            println!("  Match type: {}", "Approximate Match".yellow().bold());
            print_metrics(fair_hours_for(outcome), supplier_hours, decision);
            if quiet {
                return;
            }
            println!();
            println!(
                "{}",
                format!("Top approximate matches (>= {}% overlap)", APPROX_FLOOR as u32).yellow()
            );
            println!(
                "{:>8} {:>8} {:>8} {:>5}  {}",
                "Overlap", "Historic", "Fair", "Occ", "Record"
            );
            println!("{}", "-".repeat(78));
            for candidate in candidates {
                println!(
                    "{:>7.1}% {:>8.2} {:>8.2} {:>5}  {} | {}",
                    candidate.overlap,
                    candidate.record.historic_hours,
                    candidate.record.fair_quote,
                    candidate.record.occurrences,
                    highlight_novel_words(
                        &candidate.record.norm_discrepancy,
                        &query.norm_discrepancy
                    ),
                    highlight_novel_words(&candidate.record.norm_corrective, &query.norm_corrective)
                );
            }
        }
        MatchOutcome::Weak { nearest } => {
            println!(
                "  Match type: {}",
                "Nearest Reference (low similarity)".red().bold()
            );
            print_metrics(fair_hours_for(outcome), supplier_hours, decision);
            if quiet {
                return;
            }
            println!();
            println!(
                "{}",
                "No close matches found; showing only the nearest reference.".yellow()
            );
            println!(
                "{:>8} {:>8} {:>8} {:>5}  {}",
                "Overlap", "Historic", "Fair", "Occ", "Record"
            );
            println!("{}", "-".repeat(78));
            println!(
                "{:>7.1}% {:>8.2} {:>8.2} {:>5}  {} | {}",
                nearest.overlap,
                nearest.record.historic_hours,
                nearest.record.fair_quote,
                nearest.record.occurrences,
                highlight_novel_words(&nearest.record.norm_discrepancy, &query.norm_discrepancy),
                highlight_novel_words(&nearest.record.norm_corrective, &query.norm_corrective)
            );
            println!();
            println!(
                "{}",
                "No reliable or similar past instance was found for this combination.".dimmed()
            );
            println!(
                "{}",
                format!(
                    "If this is a valid quote, save it for future reference:\n  fairquote add -d \"...\" -c \"...\" --hours {} --data {}",
                    supplier_hours,
                    data_path.display()
                )
                .dimmed()
            );
        }
        MatchOutcome::None => {
            println!("  Match type: {}", "No Reference Data".red().bold());
            print_metrics(Option::None, supplier_hours, decision);
            println!();
            println!(
                "{}",
                "The reference table is empty; no tier can fire. Add history first.".yellow()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(description: &str, corrective: &str, hours: f64) -> HistoricalRecord {
        HistoricalRecord {
            description: description.to_string(),
            corrective_action: corrective.to_string(),
            total_hours: hours,
            year: 2022,
        }
    }

    fn query(discrepancy: &str, corrective: &str) -> QueryInput {
        prepare_query(discrepancy, corrective)
    }

    #[test]
    fn test_normalize_uppercases_and_collapses() {
        assert_eq!(
            normalize_text("  crack   found\tin skin\npanel "),
            "CRACK FOUND IN SKIN PANEL"
        );
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text("   \t\n "), "");
        assert_eq!(normalize_discrepancy(""), "");
    }

    #[test]
    fn test_normalize_strips_dates() {
        let out = normalize_text("Replaced seal on 3/4/2022");
        assert_eq!(out, "REPLACED SEAL ON");
        assert!(!date_pattern().is_match(&out));

        // Both separators, 2-digit years
        assert_eq!(normalize_text("done 12-31-99 late"), "DONE LATE");
        assert_eq!(normalize_text("done 1/2/23"), "DONE");
    }

    #[test]
    fn test_normalize_idempotent() {
        let inputs = [
            "Replaced seal on 3/4/2022",
            "  crack   FOUND in panel  ",
            "",
            "(FOR REFERENCE ONLY) corroded bracket 10-11-2019",
        ];
        for input in inputs {
            let once = normalize_text(input);
            assert_eq!(normalize_text(&once), once);
        }
    }

    #[test]
    fn test_normalize_discrepancy_strips_boilerplate() {
        assert_eq!(
            normalize_discrepancy("Crack (FOR REFERENCE ONLY) in panel 01/02/2023"),
            "CRACK IN PANEL"
        );
        // Plain normalize_text keeps the marker
        assert!(normalize_text("(FOR REFERENCE ONLY) crack").contains("REFERENCE"));
    }

    #[test]
    fn test_combined_key_empty_when_both_sides_empty() {
        assert_eq!(combined_key("", ""), "");
        assert_eq!(combined_key("A", ""), "A | ");
        assert_eq!(combined_key("", "B"), " | B");
        assert_eq!(combined_key("A", "B"), "A | B");
    }

    #[test]
    fn test_token_set_ratio_symmetric() {
        let pairs = [
            ("CRACK FOUND IN SKIN PANEL", "CRACK IN PANEL FOUND"),
            ("REPLACED PANEL", "RESEALED ACTUATOR"),
            ("A B C", ""),
        ];
        for (a, b) in pairs {
            assert_eq!(token_set_ratio(a, b), token_set_ratio(b, a));
        }
    }

    #[test]
    fn test_token_set_ratio_order_insensitive() {
        assert_eq!(token_set_ratio("A B C", "C B A"), 100.0);
        assert_eq!(token_set_ratio("CRACK IN PANEL", "CRACK IN PANEL"), 100.0);
    }

    #[test]
    fn test_token_set_ratio_subset_scores_full() {
        // One side's tokens contained in the other's: best pairing is exact
        assert_eq!(
            token_set_ratio("REPLACED PANEL", "REPLACED PANEL AND SEAL"),
            100.0
        );
    }

    #[test]
    fn test_token_set_ratio_disjoint_is_low() {
        let score = token_set_ratio("CRACK IN PANEL", "HYDRAULIC PUMP LEAK");
        assert!(score < CLUSTER_THRESHOLD, "got {}", score);
    }

    #[test]
    fn test_sequence_overlap_empty_is_zero() {
        assert_eq!(sequence_overlap("", "CRACK"), 0.0);
        assert_eq!(sequence_overlap("CRACK", ""), 0.0);
        assert_eq!(sequence_overlap("", ""), 0.0);
    }

    #[test]
    fn test_sequence_overlap_identical_is_full() {
        assert_eq!(
            sequence_overlap("CRACK FOUND IN PANEL", "CRACK FOUND IN PANEL"),
            100.0
        );
    }

    #[test]
    fn test_sequence_overlap_order_sensitive() {
        // LCS of [A, B] vs [B, A] is one token: 2*1/4 = 50%
        assert_eq!(sequence_overlap("A B", "B A"), 50.0);
        // Token-set ratio on the same pair is order-blind
        assert_eq!(token_set_ratio("A B", "B A"), 100.0);
    }

    #[test]
    fn test_sequence_overlap_partial() {
        // LCS = 4 over lengths 5 + 4: 8/9
        let score = sequence_overlap("CRACK FOUND IN SKIN PANEL", "CRACK FOUND IN PANEL");
        assert!((score - 800.0 / 9.0).abs() < 1e-9, "got {}", score);
    }

    #[test]
    fn test_clustering_partitions_distinct_keys() {
        let history = vec![
            record("Crack found in skin panel", "Replaced panel", 10.0),
            record("Crack found in the skin panel", "Replaced panel", 12.0),
            record("Hydraulic leak at actuator", "Resealed actuator", 5.0),
            record("Crack found in skin panel", "Replaced panel", 14.0),
        ];
        let table = build_reference_table(&history);

        let mut distinct: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for r in &table.records {
            if seen.insert(r.combined_key.clone()) {
                distinct.push(r.combined_key.clone());
            }
        }

        let mut clustered: Vec<String> = table
            .clusters
            .iter()
            .flat_map(|c| c.members.iter().cloned())
            .collect();
        let total_members = clustered.len();
        clustered.sort();
        clustered.dedup();

        // No key in two clusters, no key omitted
        assert_eq!(total_members, clustered.len());
        let mut expected = distinct.clone();
        expected.sort();
        assert_eq!(clustered, expected);
    }

    #[test]
    fn test_clustering_groups_near_duplicates() {
        let history = vec![
            record("Crack found in skin panel", "Replaced panel", 10.0),
            record("Crack found in the skin panel", "Replaced panel", 12.0),
            record("Hydraulic leak at actuator", "Resealed actuator", 5.0),
        ];
        let table = build_reference_table(&history);

        assert_eq!(table.clusters.len(), 2);
        // First-seen key starts the cluster and stays its representative
        assert_eq!(
            table.clusters[0].representative,
            "CRACK FOUND IN SKIN PANEL | REPLACED PANEL"
        );
        assert_eq!(table.clusters[0].occurrences, 2);
        assert_eq!(table.clusters[0].fair_quote, 11.0);
        assert_eq!(table.clusters[1].occurrences, 1);
    }

    #[test]
    fn test_clustering_skips_records_with_no_usable_text() {
        let history = vec![
            record("3/4/2022", "", 5.0),
            record("Crack found in skin panel", "Replaced panel", 10.0),
        ];
        let table = build_reference_table(&history);

        // The date-only record normalizes to an empty key and never appears
        assert_eq!(table.records.len(), 1);
        assert_eq!(table.clusters.len(), 1);
        assert_eq!(table.clusters[0].occurrences, 1);
    }

    #[test]
    fn test_cluster_statistics_mean_and_rounding() {
        let history = vec![
            record("Crack found in skin panel", "Replaced panel", 10.0),
            record("Crack found in skin panel", "Replaced panel", 11.0),
            record("Crack found in skin panel", "Replaced panel", 11.0),
        ];
        let table = build_reference_table(&history);

        assert_eq!(table.clusters.len(), 1);
        assert_eq!(table.clusters[0].occurrences, 3);
        // mean 32/3 = 10.666..., fair quote rounds to 2 decimals
        assert_eq!(table.clusters[0].fair_quote, 10.67);
        for r in &table.records {
            assert_eq!(r.fair_quote, 10.67);
            assert_eq!(r.occurrences, 3);
        }
    }

    #[test]
    fn test_exact_match_end_to_end() {
        let history = vec![
            record("Crack found in skin panel", "Replaced panel", 10.0),
            record("Crack found in skin panel", "Replaced panel", 12.0),
            record("Crack found in skin panel", "Replaced panel", 14.0),
        ];
        let table = build_reference_table(&history);
        let q = query("Crack found in skin panel", "Replaced panel");
        let outcome = match_query(&q, &table);

        match outcome {
            MatchOutcome::Exact { ref records } => {
                assert_eq!(records.len(), 3);
                assert_eq!(records[0].fair_quote, 12.0);
                assert_eq!(records[0].occurrences, 3);
            }
            ref other => panic!("expected exact match, got {:?}", other),
        }
        assert_eq!(fair_hours_for(&outcome), Some(12.0));
    }

    #[test]
    fn test_exact_match_survives_noisy_input() {
        let history = vec![record("Crack found in skin panel", "Replaced panel", 12.0)];
        let table = build_reference_table(&history);
        // Boilerplate, date, case and whitespace noise all normalize away
        let q = query(
            "(FOR REFERENCE ONLY)  crack FOUND in skin panel 3/4/2022",
            "  replaced   PANEL ",
        );
        assert!(matches!(match_query(&q, &table), MatchOutcome::Exact { .. }));
    }

    #[test]
    fn test_approximate_match_single_candidate() {
        let history = vec![
            record("Crack found in skin panel", "Replaced panel", 12.0),
            record("Hydraulic leak at actuator", "Resealed actuator", 5.0),
        ];
        let table = build_reference_table(&history);
        // Shares most tokens with the first record but is not byte-equal
        let q = query("Crack found in floor panel", "Replaced panel");
        let outcome = match_query(&q, &table);

        match outcome {
            MatchOutcome::Approximate { candidates } => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].record.description, "Crack found in skin panel");
                assert!(candidates[0].overlap >= APPROX_FLOOR);
                assert!(candidates[0].overlap < 100.0);
            }
            other => panic!("expected approximate match, got {:?}", other),
        }
    }

    #[test]
    fn test_approximate_keeps_top_two_sorted() {
        let history = vec![
            record("Hydraulic leak at actuator", "Resealed actuator", 5.0),
            record("Crack found in floor panel", "Replaced panel", 9.0),
            record("Crack found in skin panel area", "Replaced panel", 12.0),
            record("Crack found in panel", "Replaced panel", 7.0),
        ];
        let table = build_reference_table(&history);
        let q = query("Crack found in skin panel", "Replaced panel");
        let outcome = match_query(&q, &table);

        match outcome {
            MatchOutcome::Approximate { candidates } => {
                assert_eq!(candidates.len(), APPROX_LIMIT);
                assert!(candidates[0].overlap >= candidates[1].overlap);
            }
            other => panic!("expected approximate match, got {:?}", other),
        }
    }

    #[test]
    fn test_approximate_tie_break_is_stable() {
        // Two rows with the same combined key score identically; table order wins
        let history = vec![
            record("Crack found in skin panel", "Replaced panel", 9.0),
            record("Crack found in skin panel", "Replaced panel", 13.0),
        ];
        let table = build_reference_table(&history);
        let q = query("Crack found in floor panel", "Replaced panel");
        let outcome = match_query(&q, &table);

        match outcome {
            MatchOutcome::Approximate { candidates } => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[0].overlap, candidates[1].overlap);
                assert_eq!(candidates[0].record.total_hours, 9.0);
                assert_eq!(candidates[1].record.total_hours, 13.0);
            }
            other => panic!("expected approximate match, got {:?}", other),
        }
    }

    #[test]
    fn test_weak_match_returns_single_nearest() {
        let history = vec![
            record("Hydraulic leak at actuator", "Resealed actuator", 5.0),
            record("Corrosion on wing fitting", "Treated and primed fitting", 8.0),
        ];
        let table = build_reference_table(&history);
        let q = query("Galley oven inoperative", "Swapped oven control unit");
        let outcome = match_query(&q, &table);

        match outcome {
            MatchOutcome::Weak { nearest } => {
                assert!(nearest.overlap < APPROX_FLOOR);
                // All overlaps equal (zero): first table row wins the tie
                assert_eq!(nearest.record.description, "Hydraulic leak at actuator");
            }
            other => panic!("expected weak match, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_table_yields_none() {
        let table = build_reference_table(&[]);
        let q = query("Anything", "At all");
        assert!(matches!(match_query(&q, &table), MatchOutcome::None));
        assert_eq!(fair_hours_for(&MatchOutcome::None), Option::None);
    }

    #[test]
    fn test_classify_below_average_approves() {
        let decision = classify(95.0, Some(100.0));
        assert_eq!(decision.severity, Severity::Approve);
        assert_eq!(decision.percent_display, "-5.0%");
        assert_eq!(decision.diff_class, "diff-negative");
    }

    #[test]
    fn test_classify_within_range_is_neutral() {
        let decision = classify(104.0, Some(100.0));
        assert_eq!(decision.severity, Severity::Neutral);
        assert_eq!(decision.percent_display, "+4.0%");
        assert_eq!(decision.diff_class, "diff-neutral");
    }

    #[test]
    fn test_classify_above_range_needs_review() {
        let decision = classify(120.0, Some(100.0));
        assert_eq!(decision.severity, Severity::Alert);
        assert_eq!(decision.percent_display, "+20.0%");
        assert_eq!(decision.diff_class, "diff-positive");
    }

    #[test]
    fn test_classify_without_history_is_manual_review() {
        for fair in [Option::None, Some(0.0)] {
            let decision = classify(50.0, fair);
            assert_eq!(decision.severity, Severity::Alert);
            assert_eq!(decision.percent_display, "N/A (no historical data)");
            assert_eq!(decision.diff_class, "diff-neutral");
        }
    }

    #[test]
    fn test_classify_equal_hours_is_neutral() {
        let decision = classify(100.0, Some(100.0));
        assert_eq!(decision.severity, Severity::Neutral);
        assert_eq!(decision.percent_display, "+0.0%");
    }

    #[test]
    fn test_parse_history_skips_malformed_rows() {
        let csv_data = "\
Description,Corrective Action,Total Hours,Year
Crack found in skin panel,Replaced panel,12.5,2021
Bad hours row,Replaced panel,not-a-number,2021
,,3.0,2021
Hydraulic leak,Resealed actuator,5,2022
";
        let (records, skipped) = parse_history(csv_data.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(skipped, 2);
        assert_eq!(records[0].total_hours, 12.5);
        assert_eq!(records[1].year, 2022);
    }

    #[test]
    fn test_parse_history_headers_case_insensitive() {
        let csv_data = "\
description,corrective action,total hours,year
Crack,Patched,4.0,2020
";
        let (records, skipped) = parse_history(csv_data.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn test_parse_history_missing_column_is_fatal() {
        let csv_data = "Description,Total Hours\nCrack,4.0\n";
        assert!(parse_history(csv_data.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_history_year_optional() {
        let csv_data = "Description,Corrective Action,Total Hours\nCrack,Patched,4.0\n";
        let (records, _) = parse_history(csv_data.as_bytes()).unwrap();
        assert_eq!(records[0].year, 0);
    }

    #[test]
    fn test_round_two() {
        assert_eq!(round_two(10.666666), 10.67);
        assert_eq!(round_two(12.0), 12.0);
        assert_eq!(round_two(0.005), 0.01);
    }

    #[test]
    fn test_match_outcome_json_tags() {
        let outcome = MatchOutcome::None;
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["tier"], "NONE");

        let history = vec![record("Crack found in skin panel", "Replaced panel", 12.0)];
        let table = build_reference_table(&history);
        let q = query("Crack found in skin panel", "Replaced panel");
        let json = serde_json::to_value(match_query(&q, &table)).unwrap();
        assert_eq!(json["tier"], "EXACT");
        assert_eq!(json["records"][0]["fair_quote"], 12.0);
    }
}
