use clap::{Parser, Subcommand};
use dcmprobe::batch::{self, Loaded, PairPaths};
use dcmprobe::container::read_container;
use dcmprobe::decode::{self, Written};
use dcmprobe::facets::FacetDecodeResult;
use dcmprobe::keys::KeyHypothesis;
use dcmprobe::mesh::VERTEX_SIZE;
use dcmprobe::options::AnalysisOptions;
use dcmprobe::store::{read_key_sidecar, AnalysisRecord, BatchDatabase, BatchSummary, CorrelationReport, PairOutcome};
use dcmprobe::stl::read_stl;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dcmprobe", about = "Known-plaintext analysis of DCM scan mesh containers")]
struct Cli {
    /// JSON options file; flags below override its fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Default)]
struct Tuning {
    /// Fixed vertex rounding precision (derived per batch when omitted)
    #[arg(long)]
    precision: Option<u32>,
    /// Fixed facet marker byte (discovered per batch when omitted)
    #[arg(long)]
    marker: Option<u8>,
    /// Write each pair's full XOR key as <container>.key into this directory
    #[arg(long)]
    key_dir: Option<PathBuf>,
}

#[derive(clap::Args)]
struct PairSource {
    /// File with one `container,reference.stl` pair per line
    #[arg(short, long)]
    mapping: Option<PathBuf>,
    /// Explicit pair; may be repeated
    #[arg(long, num_args = 2, value_names = ["CONTAINER", "STL"])]
    pair: Vec<PathBuf>,
    /// Process only the first N pairs
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show container metadata and payload sizes
    Info {
        input: PathBuf,
    },
    /// Recover the vertex key of one container from its reference STL
    Attack {
        container: PathBuf,
        stl:       PathBuf,
        /// Write the full analysis record as JSON
        #[arg(long)]
        json: Option<PathBuf>,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Analyze many pairs in parallel and persist the batch database
    Batch {
        #[command(flatten)]
        pairs: PairSource,
        #[arg(short, long, default_value = "dcm_batch.json")]
        output: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Reload a batch database and print the correlation report
    Report {
        database: PathBuf,
        /// Write the correlation report as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Facet evidence and connectivity decode attempts only
    Facets {
        #[command(flatten)]
        pairs: PairSource,
        #[arg(long)]
        json: Option<PathBuf>,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Decrypt a container with a key sidecar or a reference STL
    Decode {
        container: PathBuf,
        #[arg(long, conflicts_with = "stl", required_unless_present = "stl")]
        key: Option<PathBuf>,
        #[arg(long)]
        stl: Option<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        /// Write ASCII STL instead of binary
        #[arg(long)]
        ascii: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose > 0 { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let mut opts = match &cli.config {
        Some(path) => AnalysisOptions::load(path)?,
        None => AnalysisOptions::default(),
    };

    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let c = read_container(&input)?;
            println!("── DCM container ────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Format version {}", c.format_version);
            println!("  CE version     {}", c.ce_version);
            println!("  Schema         {}", c.schema.as_deref().unwrap_or("-"));
            println!("  SignatureHash  {}", or_dash(&c.signature_hash));
            println!("  EKID           {}", or_dash(c.ekid()));
            println!("  ScanSource     {}", or_dash(c.scan_source()));
            println!("  SourceApp      {}", or_dash(c.source_app()));
            println!("  Facets         {} ({} B)", c.facet_count, c.facet_payload.len());
            println!("  Vertices       {} ({} B)", c.vertex_payload.len() / VERTEX_SIZE, c.vertex_payload.len());
            if let Some(color) = c.facet_color {
                println!("  Facet color    {color}");
            }
            println!("  Properties ({}):", c.properties.len());
            for (k, v) in &c.properties {
                println!("    {k:<20} {v}");
            }
        }

        // ── Attack ───────────────────────────────────────────────────────────
        Commands::Attack { container, stl, json, tuning } => {
            apply_tuning(&mut opts, &tuning);
            let pair = match batch::load_pair(&PairPaths::new(&container, &stl)) {
                Loaded::Ready(p) => p,
                Loaded::Failed(r) => return Err(errored_message(&r).into()),
            };
            let params = batch::derive_parameters(&[&*pair], &opts);
            let record = batch::analyze_pair(&pair, &params, &opts);
            print_record(&record);
            if let Some(path) = json {
                std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
                println!("Report: {}", path.display());
            }
        }

        // ── Batch ────────────────────────────────────────────────────────────
        Commands::Batch { pairs, output, tuning } => {
            apply_tuning(&mut opts, &tuning);
            let list = collect_pairs(&pairs, &mut opts)?;
            let run = batch::run_batch(&list, &opts)?;
            run.database.save(&output)?;
            for record in &run.database.records {
                print_record(record);
            }
            print_summary(&run.database.summary());
            print_correlation(&run.database.correlate()?);
            println!("Database: {}", output.display());
        }

        // ── Report ───────────────────────────────────────────────────────────
        Commands::Report { database, json } => {
            let db = BatchDatabase::load(&database)?;
            println!("Batch {} ({}), precision {}, marker {}",
                db.batch_id, db.created_at.format("%Y-%m-%d %H:%M:%S"), db.precision,
                db.marker.map_or_else(|| "-".to_string(), |m| m.to_string()));
            let report = db.correlate()?;
            print_summary(&report.summary);
            print_correlation(&report);
            if let Some(path) = json {
                std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
            }
        }

        // ── Facets ───────────────────────────────────────────────────────────
        Commands::Facets { pairs, json, tuning } => {
            apply_tuning(&mut opts, &tuning);
            let list = collect_pairs(&pairs, &mut opts)?;
            let survey = batch::survey_facets(&list, &opts)?;
            println!("Marker {}, precision {}, {} skipped",
                survey.parameters.marker.map_or_else(|| "-".to_string(), |m| m.to_string()),
                survey.parameters.precision, survey.skipped);
            if let Some(d) = &survey.parameters.marker_discovery {
                println!("{:>6} {:>10} {:>8} {:>10}", "Value", "Frequency", "Score", "Faces/seg");
                for c in &d.candidates {
                    println!("{:>6} {:>10} {:>8.4} {:>10.3}", c.value, c.frequency, c.score, c.mean_ratio);
                }
            }
            println!("Constant header bytes: {:?}", survey.constant_header);
            for e in &survey.entries {
                println!("  {:<40} {}", e.container.display(), facet_status(&e.report.result));
            }
            if let Some(path) = json {
                std::fs::write(&path, serde_json::to_string_pretty(&survey)?)?;
            }
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { container, key, stl, output, ascii } => {
            let record = read_container(&container)?;
            let decoded = match (key, stl) {
                (Some(key), _) => decode::decode_with_key(&record, &read_key_sidecar(&key)?)?,
                (None, Some(stl)) => decode::decode_with_reference(&record, &read_stl(&stl)?, &opts),
                (None, None) => return Err("either --key or --stl is required".into()),
            };
            println!("Decoded {} vertices", decoded.vertices.len());
            match decode::write_decoded(&decoded, &output, ascii)? {
                Written::Stl(p) => println!("STL: {}", p.display()),
                Written::RawVertices(p) => println!("Raw vertices: {}", p.display()),
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn apply_tuning(opts: &mut AnalysisOptions, t: &Tuning) {
    if t.precision.is_some() {
        opts.precision = t.precision;
    }
    if t.marker.is_some() {
        opts.facets.marker = t.marker;
    }
    if t.key_dir.is_some() {
        opts.key_dir = t.key_dir.clone();
    }
}

fn collect_pairs(src: &PairSource, opts: &mut AnalysisOptions) -> Result<Vec<PairPaths>, Box<dyn std::error::Error>> {
    let mut list = match &src.mapping {
        Some(path) => batch::read_mapping(path)?,
        None => Vec::new(),
    };
    list.extend(src.pair.chunks_exact(2).map(|p| PairPaths::new(&p[0], &p[1])));
    if list.is_empty() {
        return Err("no pairs given; use --mapping or --pair".into());
    }
    if src.limit.is_some() {
        opts.pair_limit = src.limit;
    }
    Ok(list)
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() { "-" } else { s }
}

fn errored_message(r: &AnalysisRecord) -> String {
    match &r.outcome {
        PairOutcome::Errored { kind, message } => format!("{kind:?}: {message}"),
        PairOutcome::Analyzed(_) => String::new(),
    }
}

fn hypothesis_label(h: &KeyHypothesis) -> String {
    match h {
        KeyHypothesis::NoTransform => "no transform".into(),
        KeyHypothesis::RepeatingXor { period, key } => format!("repeating XOR, period {period}, key {}", hex::encode(key)),
        KeyHypothesis::RecordXor { record_size, key } => format!("record XOR ({record_size} B), key {}", hex::encode(key)),
        KeyHypothesis::SubstitutionTable { table } => {
            format!("substitution table, {} entries", table.iter().filter(|e| e.is_some()).count())
        }
        KeyHypothesis::GlobalXor { key } => format!("global XOR, {} B", key.len()),
        KeyHypothesis::BlockConsistent { block_size, unique_block_count } => {
            format!("block consistent ({block_size} B, {unique_block_count} unique)")
        }
        KeyHypothesis::Unconfirmed => "unconfirmed".into(),
    }
}

fn facet_status(r: &FacetDecodeResult) -> String {
    match r {
        FacetDecodeResult::Decoded { faces, mapping, offset, .. } => {
            format!("decoded {} faces (mapping {mapping}, offset {offset})", faces.len())
        }
        FacetDecodeResult::Unconfirmed(ev) => match &ev.closest {
            Some(c) => format!(
                "unconfirmed; {} mappings tried, best {}/{} faces",
                ev.mappings_tried, c.matching_faces, c.expected_faces
            ),
            None => format!("unconfirmed; {} mappings tried", ev.mappings_tried),
        },
    }
}

fn print_record(r: &AnalysisRecord) {
    println!("── {} ──", display_name(&r.container_path));
    let a = match &r.outcome {
        PairOutcome::Analyzed(a) => a,
        PairOutcome::Errored { .. } => {
            println!("  ERROR          {}", errored_message(r));
            return;
        }
    };
    println!("  Reference      {} ({} triangles, {} vertices @ {} dp)",
        display_name(&r.reference_path), a.reference_triangles, a.reference_vertices, a.precision);
    println!("  Vertex entropy {:.4}", a.vertex_profile.entropy);
    println!("  Key            {}", hypothesis_label(&a.key.hypothesis));
    if let Some(s) = &a.key.supporting {
        println!("  Supporting     {}", hypothesis_label(s));
    }
    println!("  Key entropy    {:.4} ({} unique bytes)", a.key.stats.profile.entropy, a.key.stats.profile.unique_bytes);
    println!("  Key hash       {}", &a.key.stats.key_hash[..a.key.stats.key_hash.len().min(16)]);
    for attempt in &a.key.attempts {
        println!("    {:<18} {:?}", attempt.kind.name(), attempt.verdict);
    }
    println!("  Facets         marker {}, {}", a.facets.marker, facet_status(&a.facets.result));
    for w in &r.warnings {
        println!("  WARN           {w}");
    }
}

fn display_name(p: &Path) -> String {
    p.file_name().map_or_else(|| p.display().to_string(), |n| n.to_string_lossy().into_owned())
}

fn print_summary(s: &BatchSummary) {
    println!("── Summary ──────────────────────────────────────────────");
    println!("  Pairs          {}", s.total);
    println!("  Analyzed       {}", s.analyzed);
    println!("  Errored        {}", s.errored);
    println!("  Keys confirmed {}", s.keys_confirmed);
    println!("  Unconfirmed    {}", s.keys_unconfirmed);
    println!("  Facets decoded {}", s.facets_decoded);
    println!("  Truncated      {}", s.truncated);
}

fn print_correlation(c: &CorrelationReport) {
    println!("── Correlation ──────────────────────────────────────────");
    println!("  Unique keys    {}", c.unique_keys);
    println!("  Duplicate keys {}", c.duplicate_keys.len());
    println!("  Shared keys    {}", c.shared_keys.len());
    println!("  Reused keys    {}", c.reused_keys.len());
    println!("  Fingerprints   {} consistent, {} anomalous",
        c.consistent_fingerprints, c.fingerprint_anomalies.len());
    for a in &c.fingerprint_anomalies {
        println!("    ANOMALY {} → {} distinct keys over {} files",
            a.fingerprint, a.distinct_keys, a.containers.len());
    }
    if let Some(e) = &c.facet_entropy {
        println!("  Facet entropy  min {:.4} max {:.4} mean {:.4}", e.min, e.max, e.mean);
    }
    if !c.by_scan_source.is_empty() {
        println!("  {:<20} {:>6} {:>12} {:>12}", "ScanSource", "Files", "Key H", "Facet H");
        for s in &c.by_scan_source {
            println!("  {:<20} {:>6} {:>12.4} {:>12.4}",
                or_dash(&s.scan_source), s.files, s.mean_key_entropy, s.mean_facet_entropy);
        }
    }
}
