use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use citelink_core::library::{MemoryLibrary, ZoteroLibrary};
use citelink_core::pipeline::{Pipeline, read_documents};
use citelink_core::{
    Config, Disambiguator, Library, LibraryKind, MatchCache, MatchCascade, MatchContext, ProgressEvent,
    authority::NameResolver, config_file, matchers::crossref,
};
use citelink_export::ExportWriter;

mod console;
mod output;

use output::ColorMode;

const NON_INTERACTIVE_ENV: &str = "CITELINK_NON_INTERACTIVE";
const MIRROR_STALE_DAYS: u64 = 30;

/// Resolve scanned reference lists against bibliographic sources and link
/// them into a reference library
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the default lookup
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct ServiceArgs {
    /// Translation service base URL (DOI/ISBN → record)
    #[arg(long)]
    translation_url: Option<String>,

    /// Contact address sent to Crossref
    #[arg(long)]
    crossref_mailto: Option<String>,

    /// Semantic Scholar API key
    #[arg(long)]
    s2_api_key: Option<String>,

    /// Response cache file
    #[arg(long)]
    cache: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the references of citing documents, link them in the library
    /// and append records to the export file
    Run {
        /// Citing documents (JSON array or JSON lines)
        input: PathBuf,

        /// Export file (appended to; documents already in it are skipped)
        #[arg(short, long)]
        output: PathBuf,

        /// Primary library id
        #[arg(long)]
        library_id: Option<String>,

        /// Library type: user or group
        #[arg(long)]
        library_type: Option<String>,

        /// Library API key
        #[arg(long)]
        api_key: Option<String>,

        /// Additional libraries searched in the mirror
        #[arg(long, value_delimiter = ',')]
        secondary: Vec<String>,

        /// Local mirror database
        #[arg(long)]
        mirror: Option<PathBuf>,

        /// Comma-separated list of matchers to disable
        #[arg(long, value_delimiter = ',')]
        disable: Vec<String>,

        /// Also query Semantic Scholar
        #[arg(long)]
        scholarly: bool,

        /// Never prompt; ties are settled by each matcher's policy
        #[arg(long)]
        non_interactive: bool,

        /// Use an in-memory library instead of the real one
        #[arg(long)]
        dry_run: bool,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Look up a DOI through the translation service and Crossref
    LookupDoi {
        doi: String,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Resolve author name variants against GND and Wikidata (one per line)
    ResolveNames {
        /// File with one name per line; stdin when omitted
        file: Option<PathBuf>,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Import a library JSON export into the local mirror
    MirrorImport {
        /// Mirror database (created if missing)
        path: PathBuf,

        /// Library id the items belong to
        #[arg(long)]
        library: String,

        /// JSON export (array or JSON lines)
        json: PathBuf,
    },

    /// Show mirror statistics
    MirrorInfo {
        path: PathBuf,

        #[arg(long)]
        no_color: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let mut config = load_config(cli.config.as_deref());

    match cli.command {
        Command::Run {
            input,
            output,
            library_id,
            library_type,
            api_key,
            secondary,
            mirror,
            disable,
            scholarly,
            non_interactive,
            dry_run,
            no_color,
            services,
        } => {
            if let Some(id) = library_id {
                config.library_id = id;
            }
            if let Some(kind) = library_type {
                config.library_kind = kind.parse::<LibraryKind>().map_err(anyhow::Error::msg)?;
            }
            if api_key.is_some() {
                config.library_api_key = api_key;
            }
            if !secondary.is_empty() {
                config.secondary_library_ids = secondary;
            }
            if mirror.is_some() {
                config.mirror_path = mirror;
            }
            if !disable.is_empty() {
                config.disabled_matchers = disable;
            }
            config.enable_scholarly |= scholarly;
            config.non_interactive |= non_interactive || env_flag(NON_INTERACTIVE_ENV);
            apply_services(&mut config, services);

            run(config, &input, &output, dry_run, ColorMode(!no_color)).await
        }
        Command::LookupDoi { doi, services } => {
            apply_services(&mut config, services);
            lookup_doi(config, &doi).await
        }
        Command::ResolveNames { file, services } => {
            apply_services(&mut config, services);
            resolve_names(config, file.as_deref()).await
        }
        Command::MirrorImport {
            path,
            library,
            json,
        } => mirror_import(&path, &library, &json),
        Command::MirrorInfo { path, no_color } => mirror_info(&path, ColorMode(!no_color)),
    }
}

fn init_tracing(
    log_file: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("citelink=info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let Some(name) = path.file_name() else {
        anyhow::bail!("--log-file must name a file: {}", path.display());
    };
    std::fs::create_dir_all(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Defaults, then the config file, then environment variables.
/// Command-line flags are applied on top by the caller.
fn load_config(path: Option<&Path>) -> Config {
    let file = match path {
        Some(path) => config_file::load_from_path(path).unwrap_or_else(|| {
            tracing::warn!(path = %path.display(), "config file not loaded, using defaults");
            Default::default()
        }),
        None => config_file::load_config(),
    };
    let mut config = Config::default();
    file.apply_to(&mut config);

    if let Some(id) = env_string("CITELINK_LIBRARY_ID") {
        config.library_id = id;
    }
    if let Some(kind) = env_string("CITELINK_LIBRARY_TYPE") {
        match kind.parse::<LibraryKind>() {
            Ok(kind) => config.library_kind = kind,
            Err(e) => tracing::warn!(error = %e, "ignoring CITELINK_LIBRARY_TYPE"),
        }
    }
    if let Some(key) = env_string("CITELINK_API_KEY") {
        config.library_api_key = Some(key);
    }
    if let Some(mailto) = env_string("CROSSREF_MAILTO") {
        config.crossref_mailto = Some(mailto);
    }
    if let Some(key) = env_string("S2_API_KEY") {
        config.s2_api_key = Some(key);
    }
    if let Some(url) = env_string("CITELINK_TRANSLATION_URL") {
        config.translation_url = url;
    }
    if let Some(path) = env_string("CITELINK_MIRROR_PATH") {
        config.mirror_path = Some(PathBuf::from(path));
    }
    if env_flag(NON_INTERACTIVE_ENV) {
        config.non_interactive = true;
    }
    config
}

fn apply_services(config: &mut Config, services: ServiceArgs) {
    if let Some(url) = services.translation_url {
        config.translation_url = url;
    }
    if services.crossref_mailto.is_some() {
        config.crossref_mailto = services.crossref_mailto;
    }
    if services.s2_api_key.is_some() {
        config.s2_api_key = services.s2_api_key;
    }
    if services.cache.is_some() {
        config.cache_path = services.cache;
    }
}

fn open_cache(config: &Config) -> anyhow::Result<MatchCache> {
    Ok(match &config.cache_path {
        Some(path) => MatchCache::load(path, config.flush_every)?,
        None => MatchCache::in_memory(),
    })
}

async fn run(
    mut config: Config,
    input: &Path,
    output_path: &Path,
    dry_run: bool,
    color: ColorMode,
) -> anyhow::Result<()> {
    if !input.exists() {
        anyhow::bail!("Input not found: {}", input.display());
    }
    if !dry_run && (config.library_id.is_empty() || config.library_api_key.is_none()) {
        anyhow::bail!(
            "A library id and API key are required (--library-id/--api-key, CITELINK_LIBRARY_ID/CITELINK_API_KEY); use --dry-run to work against an in-memory library"
        );
    }

    config.open_mirror()?;
    if let Some(db) = &config.mirror_db
        && let Ok(index) = db.lock()
        && let Ok(staleness) = index.check_staleness(MIRROR_STALE_DAYS)
        && staleness.is_stale
    {
        tracing::warn!(
            path = %index.path().display(),
            age_days = ?staleness.age_days,
            "local mirror is stale; consider running mirror-import"
        );
    }

    let docs = read_documents(input)?;
    let client = citelink_core::build_http_client(&config)?;
    let cache = open_cache(&config)?;
    let console = console::ConsoleDisambiguator::new(color);
    let disambiguator: Option<&dyn Disambiguator> = if config.non_interactive {
        None
    } else {
        Some(&console)
    };

    let library: Box<dyn Library> = if dry_run {
        let memory = MemoryLibrary::new(config.library_uri());
        for doc in &docs {
            memory.insert(&doc.key, serde_json::json!({ "title": doc.title }));
        }
        Box::new(memory)
    } else {
        Box::new(ZoteroLibrary::new(client.clone(), &config))
    };

    let cascade = MatchCascade::from_config(&config);
    tracing::info!(
        documents = docs.len(),
        matchers = ?cascade.matcher_names(),
        non_interactive = config.non_interactive,
        dry_run,
        "starting run"
    );

    let ctx = MatchContext {
        client: &client,
        config: &config,
        cache: &cache,
        disambiguator,
    };
    let pipeline = Pipeline::new(&cascade, library.as_ref(), ctx);
    let mut writer = ExportWriter::open(output_path)?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let progress = |event: ProgressEvent| {
        let mut out = std::io::stdout().lock();
        let _ = output::print_progress(&mut out, &event, color);
        let _ = out.flush();
    };

    let stats = pipeline.run(&docs, &mut writer, &progress, &cancel).await?;

    let mut out = std::io::stdout();
    output::print_summary(&mut out, &stats, color)?;
    writeln!(out, "Export: {}", writer.path().display())?;
    if cancel.is_cancelled() {
        writeln!(out, "Interrupted; re-run to continue with the remaining documents.")?;
    }
    Ok(())
}

async fn lookup_doi(config: Config, doi: &str) -> anyhow::Result<()> {
    let client = citelink_core::build_http_client(&config)?;
    let cache = open_cache(&config)?;
    let ctx = MatchContext {
        client: &client,
        config: &config,
        cache: &cache,
        disambiguator: None,
    };

    let record = crossref::lookup_doi(ctx, doi).await?;
    cache.flush(true)?;
    match record {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => anyhow::bail!("No record found for DOI {}", doi),
    }
    Ok(())
}

async fn resolve_names(config: Config, file: Option<&Path>) -> anyhow::Result<()> {
    let lines: Vec<String> = match file {
        Some(path) => std::fs::read_to_string(path)?
            .lines()
            .map(str::to_string)
            .collect(),
        None => std::io::stdin().lock().lines().collect::<Result<_, _>>()?,
    };
    let names: Vec<String> = lines
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if names.is_empty() {
        anyhow::bail!("No names given");
    }

    let client = citelink_core::build_http_client(&config)?;
    let cache = open_cache(&config)?;
    let ctx = MatchContext {
        client: &client,
        config: &config,
        cache: &cache,
        disambiguator: None,
    };

    let resolver = NameResolver::standard();
    let resolution = resolver.resolve(&names, ctx).await?;
    cache.flush(true)?;
    tracing::info!(
        names = names.len(),
        resolved = resolution.resolved_count(),
        "names resolved"
    );
    println!("{}", serde_json::to_string_pretty(&resolution)?);
    Ok(())
}

fn mirror_import(path: &Path, library: &str, json: &Path) -> anyhow::Result<()> {
    use citelink_mirror::ImportProgress;
    use indicatif::{HumanCount, ProgressBar, ProgressStyle};
    use std::time::Duration;

    if !json.exists() {
        anyhow::bail!("Export file not found: {}", json.display());
    }
    let index = if path.exists() {
        citelink_mirror::MirrorIndex::open(path)?
    } else {
        citelink_mirror::MirrorIndex::create(path)?
    };

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    bar.enable_steady_tick(Duration::from_millis(120));

    let stored = index.import_file(library, json, |event| match event {
        ImportProgress::Reading { bytes_total } => {
            bar.set_message(format!("Reading {} bytes...", HumanCount(bytes_total)));
        }
        ImportProgress::Inserting {
            items_read,
            items_stored,
        } => {
            bar.set_message(format!(
                "{} of {} items stored",
                HumanCount(items_stored),
                HumanCount(items_read)
            ));
        }
        ImportProgress::RebuildingIndex => {
            bar.set_message("Rebuilding FTS search index...");
        }
        ImportProgress::Complete {
            items_stored,
            items_skipped,
        } => {
            bar.finish_with_message(format!(
                "Stored {} items ({} skipped)",
                HumanCount(items_stored),
                HumanCount(items_skipped)
            ));
        }
    })?;

    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    println!(
        "Imported {} items for library {} into {}",
        stored,
        library,
        canonical.display()
    );
    Ok(())
}

fn mirror_info(path: &Path, color: ColorMode) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!(
            "Mirror not found at {}. Build it with: citelink mirror-import {} --library <id> <export.json>",
            path.display(),
            path.display()
        );
    }
    let index = citelink_mirror::MirrorIndex::open(path)?;
    let info = index.info()?;
    let staleness = index.check_staleness(MIRROR_STALE_DAYS)?;
    let stale_days = if staleness.is_stale {
        staleness.age_days
    } else {
        None
    };
    output::print_mirror_info(&mut std::io::stdout(), &info, stale_days, color)?;
    Ok(())
}
