use std::path::PathBuf;

use anyhow::{Result, bail};
use articlestatus_core::catalog::{Catalog, unix_now};
use articlestatus_core::config::{StatusConfig, load_config};
use articlestatus_core::driver::{CourseReport, RunReport, update_all, update_course};
use articlestatus_core::migrate::{pending_migration_count, run_migrations};
use articlestatus_core::reconcile::PassReport;
use articlestatus_core::remote::{MediaWikiLookup, MediaWikiLookupConfig};
use articlestatus_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "articlestatus",
    version,
    about = "Reconcile tracked course articles against their remote wikis"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log at debug level unless RUST_LOG is set")]
    verbose: bool,
    #[arg(long, global = true, help = "Print reports as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            json: cli.json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the runtime layout, default config and catalog database")]
    Init(InitArgs),
    Db(DbArgs),
    #[command(about = "Reconcile every current course")]
    Run,
    #[command(about = "Reconcile a single course by slug")]
    Course(CourseArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

#[derive(Debug, Args)]
struct CourseArgs {
    slug: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Run) => run_all(&runtime),
        Some(Commands::Course(CourseArgs { slug })) => run_course(&runtime, &slug),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;
    let migrations = run_migrations(&paths)?;

    println!("Initialized articlestatus runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("migrations_applied: {}", migrations.applied.len());
    println!("schema_version: {}", migrations.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let pending = pending_migration_count(&paths)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("pending_before: {pending}");
    if report.applied.is_empty() {
        println!("applied: <none>");
    } else {
        for migration in &report.applied {
            println!("applied: v{:03}_{}", migration.version, migration.name);
        }
    }
    println!("schema_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;
    let stats = Catalog::open(&paths.db_path)?.stats()?;

    if runtime.json {
        return print_json(&stats);
    }
    println!("db stats");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("wikis: {}", stats.wikis);
    println!("courses: {}", stats.courses);
    println!("articles: {}", stats.articles);
    println!("articles.deleted: {}", stats.deleted_articles);
    println!("course_links: {}", stats.course_links);
    println!("revisions: {}", stats.revisions);
    print_warnings(&status.warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_all(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;
    let config = load_config(&paths.config_path)?;
    let settings = config.settings()?;
    let lookup_config = MediaWikiLookupConfig::from_config(&config)?;
    let now = unix_now()?;

    let report = update_all(&paths.db_path, &settings, now, || {
        MediaWikiLookup::new(lookup_config.clone())
    })?;

    if runtime.json {
        print_json(&report)?;
    } else {
        print_run_report(&report);
        print_warnings(&status.warnings);
        print_diagnostics(runtime, &paths);
    }
    if !report.failures.is_empty() {
        bail!(
            "{} failure(s) across {} course group(s)",
            report.failures.len(),
            report.groups
        );
    }
    Ok(())
}

fn run_course(runtime: &RuntimeOptions, slug: &str) -> Result<()> {
    let slug = slug.trim();
    if slug.is_empty() {
        bail!("course requires a non-empty slug");
    }
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;
    let config = load_config(&paths.config_path)?;
    let settings = config.settings()?;

    let mut catalog = Catalog::open(&paths.db_path)?;
    let Some(course) = catalog.course_by_slug(slug)? else {
        bail!("course not found: {slug}");
    };
    let mut lookup = MediaWikiLookup::new(MediaWikiLookupConfig::from_config(&config)?)?;
    let report = update_course(&mut catalog, &mut lookup, &course, &settings)?;

    if runtime.json {
        return print_json(&report);
    }
    println!("course update");
    print_course_report(&report);
    print_config_summary(&config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_run_report(report: &RunReport) {
    println!("status update");
    println!("groups: {}", report.groups);
    println!("courses.scheduled: {}", report.courses_scheduled);
    println!("courses.completed: {}", report.courses.len());
    println!("articles: {}", report.articles());
    println!("mutations: {}", report.mutations());
    println!("requests: {}", report.requests());
    println!("requests.failed: {}", report.failed_requests());
    println!("duration_ms: {}", report.duration_ms);
    if report.failures.is_empty() {
        println!("failures: <none>");
    } else {
        println!("failures:");
        for failure in &report.failures {
            println!(
                "  - group {} {}: {}",
                failure.group,
                failure.course.as_deref().unwrap_or("<worker>"),
                failure.error
            );
        }
    }
}

fn print_course_report(report: &CourseReport) {
    println!("course: {}", report.slug);
    println!("wikis: {}", report.wikis);
    println!("passes: {}", report.passes.len());
    println!("articles: {}", report.articles);
    println!("mutations: {}", report.mutations);
    println!("requests: {}", report.requests);
    println!("requests.failed: {}", report.failed_requests);
    let total = |field: fn(&PassReport) -> usize| report.passes.iter().map(field).sum::<usize>();
    println!("articles.renamed: {}", total(|pass| pass.metadata_updated));
    println!("articles.reassigned: {}", total(|pass| pass.ids_reassigned));
    println!("articles.superseded: {}", total(|pass| pass.duplicates_superseded));
    println!("articles.deleted: {}", total(|pass| pass.articles_deleted));
    println!("articles.undeleted: {}", total(|pass| pass.articles_undeleted));
    println!("course_links.removed: {}", total(|pass| pass.course_links_removed));
    println!("revisions.moved: {}", total(|pass| pass.revisions_moved));
    println!("revisions.dropped: {}", total(|pass| pass.revisions_dropped));
}

fn print_config_summary(config: &StatusConfig) {
    println!("user_agent: {}", config.user_agent());
}

fn print_warnings(warnings: &[String]) {
    if !warnings.is_empty() {
        println!("warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    debug!(
        project_root = %normalize_for_display(&paths.project_root),
        db_path = %normalize_for_display(&paths.db_path),
        "resolved runtime paths"
    );
    Ok(paths)
}
