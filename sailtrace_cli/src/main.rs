use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use sailtrace::baseline::{BaselineSet, BaselineStore, CancelFlag, HistoricalSession};
use sailtrace::fleet::{head_to_head, FleetWindow};
use sailtrace::normalize::RejectReason;
use sailtrace::wind::WindAvailability;
use sailtrace::{
    analyze_sessions, build_baseline, compare_fleet, parse_fixes, CourseConfig, Metric, Params,
    PolarTable, SessionAnalysis, SessionInput,
};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sailing telemetry analytics CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze sessions: wind, maneuvers and tactical snapshots
    Analyze(AnalyzeArgs),
    /// Rebuild performance baselines from a session manifest
    Baseline(BaselineArgs),
    /// Score sessions against a baseline
    Anomalies(AnomaliesArgs),
    /// Rank sailors across sessions sharing a window
    Fleet(FleetArgs),
    /// Report data-quality findings for telemetry files
    Diagnose(DiagnoseArgs),
}

#[derive(Parser, Debug, Clone)]
struct CommonArgs {
    /// Params JSON (partial files fall back to defaults)
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Polar JSON: {"tws_kn": [...], "twa_deg": [...], "target_kn": [[...]]}
    #[arg(long, value_hint = ValueHint::FilePath)]
    polar: Option<PathBuf>,

    /// Resample interval (seconds)
    #[arg(long)]
    sample_interval: Option<f64>,

    /// Longest dropout bridged by interpolation (seconds)
    #[arg(long)]
    max_gap: Option<f64>,

    /// Ignore external wind readings and derive wind aboard
    #[arg(long, action = ArgAction::SetTrue)]
    ignore_external_wind: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Telemetry files (FIT/GPX/CSV/JSON)
    #[arg(value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Session manifest JSON instead of bare files
    #[arg(long, value_hint = ValueHint::FilePath)]
    manifest: Option<PathBuf>,

    /// Sailor id for bare files
    #[arg(long, default_value = "unknown")]
    sailor: String,

    /// Course JSON for bare files
    #[arg(long, value_hint = ValueHint::FilePath)]
    course: Option<PathBuf>,

    /// Boat class for bare files (overrides the course file)
    #[arg(long)]
    boat_class: Option<String>,

    /// Output directory
    #[arg(short, long, default_value = "sailtrace_out", value_hint = ValueHint::DirPath)]
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct BaselineArgs {
    /// Session manifest JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    manifest: PathBuf,

    /// Output baseline JSON
    #[arg(short, long, default_value = "baseline.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct AnomaliesArgs {
    /// Session manifest JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    manifest: PathBuf,

    /// Baseline JSON produced by `baseline`
    #[arg(long, value_hint = ValueHint::FilePath)]
    baseline: PathBuf,

    /// Output JSON (`-` for stdout)
    #[arg(short, long, default_value = "-")]
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AlignmentOpt {
    Clock,
    Elapsed,
}

#[derive(Parser, Debug)]
struct FleetArgs {
    /// Session manifest JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    manifest: PathBuf,

    /// Timeline alignment
    #[arg(long, value_enum, default_value_t = AlignmentOpt::Clock)]
    alignment: AlignmentOpt,

    /// Window length for elapsed alignment (seconds; default longest session)
    #[arg(long)]
    duration: Option<f64>,

    /// Compare every session against this one on elapsed time
    #[arg(long)]
    ghost: Option<String>,

    /// Output JSON (`-` for stdout)
    #[arg(short, long, default_value = "-")]
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    /// Telemetry files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path
    #[arg(short, long, default_value = "telemetry_diagnostics.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

/// One manifest row; `path` is relative to the manifest file.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    session_id: Option<String>,
    sailor_id: String,
    path: PathBuf,
    #[serde(default)]
    course: CourseConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let common = match &cli.command {
        Command::Analyze(args) => &args.common,
        Command::Baseline(args) => &args.common,
        Command::Anomalies(args) => &args.common,
        Command::Fleet(args) => &args.common,
        Command::Diagnose(args) => &args.common,
    };
    let default_level = if common.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args),
        Command::Baseline(args) => handle_baseline(args),
        Command::Anomalies(args) => handle_anomalies(args),
        Command::Fleet(args) => handle_fleet(args),
        Command::Diagnose(args) => handle_diagnose(args),
    }
}

fn load_params(common: &CommonArgs) -> Result<Params> {
    let mut params = match common.params.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read params {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("{} is not a valid params file", path.display()))?
        }
        None => Params::default(),
    };
    if let Some(v) = common.sample_interval {
        params.normalize.sample_interval_s = v;
    }
    if let Some(v) = common.max_gap {
        params.normalize.max_gap_s = v;
    }
    if common.ignore_external_wind {
        params.wind.trust_external = false;
    }
    params.validate().context("invalid parameters")?;
    Ok(params)
}

fn load_polar(common: &CommonArgs) -> Result<Option<PolarTable>> {
    let Some(path) = common.polar.as_ref() else {
        return Ok(None);
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read polar {}", path.display()))?;
    let polar = PolarTable::from_json(&text)
        .with_context(|| format!("{} is not a valid polar table", path.display()))?;
    Ok(Some(polar))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn load_session(
    path: &Path,
    session_id: String,
    sailor_id: String,
    course: CourseConfig,
) -> Result<SessionInput> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let hint = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("csv");
    let fixes =
        parse_fixes(&data, hint).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(SessionInput {
        session_id,
        sailor_id,
        course,
        fixes,
    })
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("session")
        .to_string()
}

/// Parse every manifest entry on the rayon pool, keeping manifest order.
fn load_manifest(path: &Path) -> Result<Vec<SessionInput>> {
    let entries: Vec<ManifestEntry> = read_json(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    entries
        .into_par_iter()
        .map(|entry| {
            let file = base.join(&entry.path);
            let id = entry.session_id.unwrap_or_else(|| file_stem(&file));
            load_session(&file, id, entry.sailor_id, entry.course)
        })
        .collect()
}

fn run_pipeline(
    inputs: &[SessionInput],
    params: &Params,
    polar: Option<&PolarTable>,
    profile: bool,
) -> Vec<SessionAnalysis> {
    let t_compute = Instant::now();
    let curve = polar.map(|p| p as &dyn sailtrace::PerformanceCurve);
    let results = analyze_sessions(inputs, params, curve);
    if profile {
        info!(
            "Compute stage: {:.1} ms ({} sessions)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            inputs.len()
        );
    }
    inputs
        .iter()
        .zip(results)
        .filter_map(|(input, result)| match result {
            Ok(analysis) => Some(analysis),
            Err(err) => {
                warn!("{}: skipped ({})", input.session_id, err);
                None
            }
        })
        .collect()
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    let params = load_params(&args.common)?;
    let polar = load_polar(&args.common)?;

    let t_parse = Instant::now();
    let inputs = if let Some(manifest) = args.manifest.as_ref() {
        load_manifest(manifest)?
    } else {
        if args.inputs.is_empty() {
            return Err(anyhow!("no input files supplied"));
        }
        let mut course: CourseConfig = match args.course.as_ref() {
            Some(path) => read_json(path)?,
            None => CourseConfig::default(),
        };
        if let Some(class) = args.boat_class.clone() {
            course.boat_class = Some(class);
        }
        args.inputs
            .par_iter()
            .map(|path| load_session(path, file_stem(path), args.sailor.clone(), course.clone()))
            .collect::<Result<Vec<_>>>()?
    };
    if args.common.profile || args.common.verbose {
        info!(
            "Parse stage: {:.1} ms",
            t_parse.elapsed().as_secs_f64() * 1000.0
        );
    }

    let analyses = run_pipeline(&inputs, &params, polar.as_ref(), args.common.profile);
    fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    for analysis in &analyses {
        let out = |suffix: &str| {
            args.output
                .join(format!("{}.{}", analysis.session_id, suffix))
        };
        write_json(analysis, &out("analysis.json"))?;
        write_maneuvers_csv(analysis, &out("maneuvers.csv"))?;
        write_snapshots_csv(analysis, &out("snapshots.csv"))?;
        info!(
            "{}: {} tacks, {} gybes, {} wind shifts",
            analysis.session_id,
            analysis.maneuvers.tacks(),
            analysis.maneuvers.gybes(),
            analysis.wind.shifts.len()
        );
    }
    info!("Wrote {} analyses to {}", analyses.len(), args.output.display());
    Ok(())
}

fn historical(analyses: &[SessionAnalysis]) -> Vec<HistoricalSession> {
    analyses.iter().filter_map(SessionAnalysis::historical).collect()
}

fn handle_baseline(args: BaselineArgs) -> Result<()> {
    let params = load_params(&args.common)?;
    let polar = load_polar(&args.common)?;
    let inputs = load_manifest(&args.manifest)?;
    let analyses = run_pipeline(&inputs, &params, polar.as_ref(), args.common.profile);
    let history = historical(&analyses);

    let t_build = Instant::now();
    let baseline = build_baseline(&history, &params.baseline, &CancelFlag::new())?;
    if args.common.profile {
        info!(
            "Baseline stage: {:.1} ms",
            t_build.elapsed().as_secs_f64() * 1000.0
        );
    }
    write_json(&baseline, &args.output)?;
    info!(
        "Wrote baseline {} ({} models from {} sessions): {}",
        baseline.version,
        baseline.models.len(),
        history.len(),
        args.output.display()
    );
    Ok(())
}

fn handle_anomalies(args: AnomaliesArgs) -> Result<()> {
    let params = load_params(&args.common)?;
    let polar = load_polar(&args.common)?;
    let baseline: BaselineSet = read_json(&args.baseline)?;
    let inputs = load_manifest(&args.manifest)?;
    let analyses = run_pipeline(&inputs, &params, polar.as_ref(), args.common.profile);

    let store = BaselineStore::new(baseline, params.baseline.clone());
    let now = Utc::now();
    let reports = historical(&analyses)
        .iter()
        .map(|session| store.detect_anomalies(session, now))
        .collect::<Result<Vec<_>, _>>()?;
    for report in &reports {
        info!(
            "{}: {} anomalies, {} buckets without baseline{}",
            report.session_id,
            report.anomalies.len(),
            report.baseline_insufficient.len(),
            if report.stale.is_some() { " (stale baseline)" } else { "" }
        );
    }
    write_json(&reports, &args.output)
}

fn handle_fleet(args: FleetArgs) -> Result<()> {
    let params = load_params(&args.common)?;
    let polar = load_polar(&args.common)?;
    let inputs = load_manifest(&args.manifest)?;
    let analyses = run_pipeline(&inputs, &params, polar.as_ref(), args.common.profile);
    let entries: Vec<_> = analyses.iter().map(SessionAnalysis::fleet_entry).collect();

    let window = match args.alignment {
        AlignmentOpt::Clock => None,
        AlignmentOpt::Elapsed => {
            let longest = analyses
                .iter()
                .map(|a| OrderedFloat(a.series.covered_s()))
                .max()
                .map_or(0.0, |d| d.0);
            Some(FleetWindow::Elapsed {
                duration_s: args.duration.unwrap_or(longest),
            })
        }
    };
    let result = compare_fleet(&entries, window, &params.fleet)?;

    let mut output = serde_json::json!({ "fleet": result });
    if let Some(ghost_id) = args.ghost.as_ref() {
        let ghost = entries
            .iter()
            .find(|e| e.session_id == ghost_id.as_str())
            .ok_or_else(|| anyhow!("ghost session '{}' not in manifest", ghost_id))?;
        let duels = entries
            .iter()
            .filter(|e| e.session_id != ghost_id.as_str())
            .map(|attempt| head_to_head(ghost, attempt, &params.fleet))
            .collect::<Result<Vec<_>, _>>()?;
        output["head_to_head"] = serde_json::to_value(duels)?;
    }
    write_json(&output, &args.output)
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let params = load_params(&args.common)?;
    let mut report = String::new();

    for path in &args.inputs {
        let input = load_session(path, file_stem(path), "unknown".into(), CourseConfig::default())?;
        report.push_str(&format!("FILE: {}\n", path.display()));
        report.push_str(&format!("  fixes: {}\n", input.fixes.len()));
        let with_heading = input.fixes.iter().filter(|f| f.heading_deg.is_some()).count();
        let with_wind = input.fixes.iter().filter(|f| f.wind.is_some()).count();
        let with_apparent = input.fixes.iter().filter(|f| f.apparent.is_some()).count();
        report.push_str(&format!(
            "  heading: {}, external wind: {}, apparent wind: {}\n",
            with_heading, with_wind, with_apparent
        ));

        let series = match sailtrace::normalize(&input.fixes, &params.normalize) {
            Ok(series) => series,
            Err(err) => {
                report.push_str(&format!("  normalize: FAILED ({})\n\n", err));
                continue;
            }
        };
        report.push_str(&format!(
            "  samples: {} over {:.1}s ({} segments)\n",
            series.len(),
            series.covered_s(),
            series.segment_ranges().len()
        ));

        let mut reasons: BTreeMap<&'static str, usize> = BTreeMap::new();
        for r in series.rejected() {
            let key = match r.reason {
                RejectReason::Malformed { .. } => "malformed",
                RejectReason::DuplicateTimestamp => "duplicate_timestamp",
                RejectReason::ImplausibleSpeed { .. } => "implausible_speed",
                RejectReason::ImplausibleAcceleration { .. } => "implausible_acceleration",
                RejectReason::IsolatedSegment { .. } => "isolated_segment",
            };
            *reasons.entry(key).or_insert(0) += 1;
        }
        if !reasons.is_empty() {
            report.push_str("  rejected:\n");
            for (reason, count) in reasons {
                report.push_str(&format!("    - {}: {}\n", reason, count));
            }
        }
        for gap in series.gaps() {
            report.push_str(&format!(
                "  gap: {} -> {} ({:.0}s)\n",
                gap.start.to_rfc3339(),
                gap.end.to_rfc3339(),
                gap.duration_s
            ));
        }

        let wind = sailtrace::analyze_wind(&series, &params.wind);
        match wind.availability {
            WindAvailability::Available {
                external,
                apparent,
                heading_signature,
                missing,
            } => report.push_str(&format!(
                "  wind: external={} apparent={} heading_signature={} missing={}\n",
                external, apparent, heading_signature, missing
            )),
            WindAvailability::Unavailable => report.push_str("  wind: unavailable\n"),
        }
        report.push('\n');
    }

    fs::write(&args.output, report)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(
        "Diagnostic report written: {} ({})",
        args.output.display(),
        Utc::now().to_rfc3339()
    );
    Ok(())
}

fn write_json<T: serde::Serialize>(value: &T, path: &Path) -> Result<()> {
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        serde_json::to_writer_pretty(&mut handle, value)?;
        writeln!(handle)?;
        return Ok(());
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn opt(v: Option<f64>) -> String {
    v.map_or(String::new(), |x| format!("{:.3}", x))
}

fn write_maneuvers_csv(analysis: &SessionAnalysis, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record([
        "start",
        "end",
        "kind",
        "entry_heading_deg",
        "exit_heading_deg",
        "heading_change_deg",
        "duration_s",
        "speed_loss_kn",
        "recovery_s",
        "score",
    ])?;
    for m in &analysis.maneuvers.maneuvers {
        let kind = serde_json::to_value(&m.kind)?
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or("unknown")
            .to_string();
        writer.write_record([
            m.start_ts.to_rfc3339(),
            m.end_ts.to_rfc3339(),
            kind,
            format!("{:.1}", m.entry_heading_deg),
            format!("{:.1}", m.exit_heading_deg),
            format!("{:.1}", m.heading_change_deg),
            format!("{:.1}", m.duration_s),
            format!("{:.2}", m.speed_loss_kn),
            format!("{:.1}", m.recovery_s),
            format!("{:.1}", m.score),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_snapshots_csv(analysis: &SessionAnalysis, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record([
        "timestamp",
        "segment",
        "twa_deg",
        "vmg_kn",
        "target_vmg_kn",
        "target_twa_deg",
        "layline_port_m",
        "layline_starboard_m",
        "start_bias_deg",
        "time_to_line_s",
    ])?;
    for s in &analysis.snapshots {
        let vmg = s.vmg.defined();
        let layline = s.layline.defined();
        let ttl = match &s.time_to_line {
            Metric::Defined(t) => Some(t.seconds),
            Metric::Undefined(_) => None,
        };
        writer.write_record([
            s.timestamp.to_rfc3339(),
            s.segment.to_string(),
            opt(vmg.map(|v| v.twa_deg)),
            opt(vmg.map(|v| v.instantaneous_kn)),
            opt(vmg.and_then(|v| v.target).map(|t| t.vmg_kn)),
            opt(vmg.and_then(|v| v.target).map(|t| t.twa_deg)),
            opt(layline.map(|l| l.port.distance_m)),
            opt(layline.map(|l| l.starboard.distance_m)),
            opt(s.start_bias.defined().map(|b| b.bias_deg)),
            opt(ttl),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
