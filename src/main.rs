mod config;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use sift_index::{
    BestEffortCache, CodeIndexer, ContextRetriever, IndexReport, QueryOptions, ResultCache,
    RetrievalOutcome, SnapshotMeta, indexer::files_by_folder,
};
use sift_llm::AnyProvider;
use sift_llm::ollama::OllamaProvider;
use sift_llm::openai::OpenAiProvider;

use crate::config::{Config, ProviderKind, resolve_config_path};

#[derive(Debug, Parser)]
#[command(name = "sift", version, about = "Code-aware retrieval over a local repository")]
struct Cli {
    /// Configuration file (default: $SIFT_CONFIG or config/default.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Index a repository incrementally.
    Index {
        repo: PathBuf,
        /// Index directory (default: derived from the repository path).
        #[arg(long)]
        index: Option<PathBuf>,
    },
    /// Retrieve curated context for a question.
    Query {
        text: String,
        #[arg(long, conflicts_with = "index", required_unless_present = "index")]
        repo: Option<PathBuf>,
        #[arg(long)]
        index: Option<PathBuf>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        output_k: Option<usize>,
        #[arg(long)]
        token_budget: Option<usize>,
        #[arg(long)]
        no_cache: bool,
    },
    /// Maintain the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// Remove expired entries.
    Sweep,
    /// Remove every entry.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_subscriber();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;

    match cli.command {
        Command::Index { repo, index } => run_index(&config, &repo, index).await,
        Command::Query {
            text,
            repo,
            index,
            top_k,
            output_k,
            token_budget,
            no_cache,
        } => {
            let options = QueryOptions {
                top_k,
                output_k,
                token_budget,
                use_cache: !no_cache,
            };
            run_query(&config, &text, repo.as_deref(), index, &options).await
        }
        Command::Cache { action } => run_cache(&config, &action).await,
    }
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    let llm = &config.llm;
    match llm.provider {
        ProviderKind::OpenAi => {
            let api_key = config
                .secrets
                .api_key
                .clone()
                .context("SIFT_API_KEY not found (required for the openai provider)")?;
            let client = sift_llm::http::client_with_timeout(Duration::from_secs(llm.timeout_secs))?;
            let provider = OpenAiProvider::new(
                api_key,
                llm.base_url.clone(),
                llm.chat_model.clone(),
                llm.embedding_model.clone(),
            )
            .with_client(client)
            .with_max_retries(llm.max_retries)
            .with_provider_routing(llm.chat_providers.clone(), llm.embedding_providers.clone());
            Ok(AnyProvider::OpenAi(provider))
        }
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(
            &llm.base_url,
            llm.chat_model.clone(),
            llm.embedding_model.clone(),
        ))),
    }
}

/// Short stable id of a repository: blake3 of its canonical path.
fn project_id(canonical: &Path) -> String {
    let hash = blake3::hash(canonical.to_string_lossy().as_bytes());
    hash.to_hex().as_str()[..16].to_owned()
}

/// `<index_root>/<project_id>` for `repo`.
fn project_index_dir(index_root: &Path, repo: &Path) -> anyhow::Result<PathBuf> {
    let canonical = repo
        .canonicalize()
        .with_context(|| format!("repository not found: {}", repo.display()))?;
    Ok(index_root.join(project_id(&canonical)))
}

async fn run_index(config: &Config, repo: &Path, index: Option<PathBuf>) -> anyhow::Result<()> {
    if !repo.is_dir() {
        bail!("not a directory: {}", repo.display());
    }
    let index_dir = match index {
        Some(dir) => dir,
        None => project_index_dir(&config.storage.index_root, repo)?,
    };
    let provider = Arc::new(create_provider(config)?);
    tracing::info!(
        repo = %repo.display(),
        index = %index_dir.display(),
        provider = config.llm.provider.as_str(),
        "indexing"
    );

    let indexer = CodeIndexer::new(provider, config.indexing.to_indexer_config());
    let report = indexer
        .index_repo(repo, &index_dir)
        .await
        .context("indexing failed")?;

    let folders = SnapshotMeta::load(&index_dir)
        .await
        .ok()
        .flatten()
        .map(|meta| files_by_folder(&meta.file_hashes))
        .unwrap_or_default();
    println!("{}", format_report(&report, &index_dir, &folders));
    Ok(())
}

fn format_report(
    report: &IndexReport,
    index_dir: &Path,
    folders: &std::collections::BTreeMap<String, usize>,
) -> String {
    let mut out = String::new();
    if report.noop {
        let _ = writeln!(out, "Index is up to date ({} fragments).", report.fragments_total);
    } else {
        let _ = writeln!(
            out,
            "Indexed {} files: {} added, {} modified, {} unchanged, {} deleted.",
            report.files_scanned,
            report.files_added,
            report.files_modified,
            report.files_unchanged,
            report.files_deleted
        );
        let _ = writeln!(
            out,
            "Fragments: {} extracted, {} embedded, {} skipped, {} summaries, {} total.",
            report.fragments_extracted,
            report.fragments_embedded,
            report.fragments_skipped,
            report.summaries_generated,
            report.fragments_total
        );
    }
    for (folder, count) in folders {
        let _ = writeln!(out, "  {folder}: {count} files");
    }
    if !report.errors.is_empty() {
        let _ = writeln!(out, "{} errors:", report.errors.len());
        for error in &report.errors {
            let _ = writeln!(out, "  {error}");
        }
    }
    let _ = write!(
        out,
        "Index: {} ({} ms)",
        index_dir.display(),
        report.duration_ms
    );
    out
}

async fn run_query(
    config: &Config,
    text: &str,
    repo: Option<&Path>,
    index: Option<PathBuf>,
    options: &QueryOptions,
) -> anyhow::Result<()> {
    let index_dir = match (index, repo) {
        (Some(dir), _) => dir,
        (None, Some(repo)) => project_index_dir(&config.storage.index_root, repo)?,
        (None, None) => bail!("either --repo or --index is required"),
    };
    let provider = Arc::new(create_provider(config)?);
    let cache = BestEffortCache::from_config(&config.cache_config()).await;
    let retrieval = config
        .retrieval
        .to_retrieval_config(config.indexing.retry_policy());

    let Some(retriever) = ContextRetriever::open(&index_dir, provider, cache, retrieval)
        .await
        .context("loading index")?
    else {
        let target = repo.map_or_else(|| index_dir.display().to_string(), |r| r.display().to_string());
        println!("No index found for {target}. Run `sift index` first.");
        return Ok(());
    };
    tracing::info!(
        index = %index_dir.display(),
        fragments = retriever.fragment_count(),
        "index opened"
    );

    match retriever.retrieve(text, options).await? {
        RetrievalOutcome::NoRelevantContext => println!("No relevant context found."),
        RetrievalOutcome::Answer(answer) => {
            tracing::debug!(
                origin = ?answer.origin,
                fragments = answer.fragments.len(),
                "answer ready"
            );
            println!("{}", answer.text);
        }
    }
    Ok(())
}

async fn run_cache(config: &Config, action: &CacheAction) -> anyhow::Result<()> {
    let cache_config = config.cache_config();
    let path = cache_config.path.to_string_lossy();
    let cache = ResultCache::open(&path, cache_config.ttl)
        .await
        .with_context(|| format!("opening cache {path}"))?;
    match action {
        CacheAction::Sweep => {
            let removed = cache.sweep().await?;
            println!("Removed {removed} expired entries.");
        }
        CacheAction::Clear => {
            let removed = cache.clear().await?;
            println!("Removed {removed} entries.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_llm::LlmProvider;
    use std::collections::BTreeMap;

    #[test]
    fn cli_parses_query_flags() {
        let cli = Cli::try_parse_from([
            "sift", "query", "where is login", "--repo", ".", "--output-k", "3", "--no-cache",
        ])
        .unwrap();
        let Command::Query {
            text,
            repo,
            output_k,
            no_cache,
            ..
        } = cli.command
        else {
            panic!("expected query");
        };
        assert_eq!(text, "where is login");
        assert_eq!(repo, Some(PathBuf::from(".")));
        assert_eq!(output_k, Some(3));
        assert!(no_cache);
    }

    #[test]
    fn cli_query_needs_a_target() {
        assert!(Cli::try_parse_from(["sift", "query", "q"]).is_err());
        assert!(Cli::try_parse_from(["sift", "query", "q", "--repo", "a", "--index", "b"]).is_err());
    }

    #[test]
    fn cli_parses_cache_actions() {
        let cli = Cli::try_parse_from(["sift", "--config", "x.toml", "cache", "sweep"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(
            cli.command,
            Command::Cache {
                action: CacheAction::Sweep
            }
        ));
    }

    #[test]
    fn project_id_is_stable_and_short() {
        let a = project_id(Path::new("/home/dev/repo"));
        assert_eq!(a.len(), 16);
        assert_eq!(a, project_id(Path::new("/home/dev/repo")));
        assert_ne!(a, project_id(Path::new("/home/dev/other")));
    }

    #[test]
    fn project_index_dir_uses_canonical_path() {
        let repo = tempfile::tempdir().unwrap();
        let root = Path::new("/indexes");
        let direct = project_index_dir(root, repo.path()).unwrap();
        let dotted = project_index_dir(root, &repo.path().join(".")).unwrap();
        assert_eq!(direct, dotted);
        assert!(direct.starts_with(root));
        assert!(project_index_dir(root, Path::new("/does/not/exist")).is_err());
    }

    #[test]
    fn create_provider_ollama() {
        let mut config = Config::default();
        config.llm.provider = ProviderKind::Ollama;
        config.llm.base_url = "http://localhost:11434".into();
        let provider = create_provider(&config).unwrap();
        assert!(matches!(provider, AnyProvider::Ollama(_)));
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn create_provider_openai_missing_api_key_errors() {
        let config = Config::default();
        let err = create_provider(&config).unwrap_err();
        assert!(err.to_string().contains("SIFT_API_KEY not found"));
    }

    #[test]
    fn create_provider_openai_with_key() {
        let mut config = Config::default();
        config.secrets.api_key = Some("sk-test".into());
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.embedding_model(), "text-embedding-3-small");
    }

    #[test]
    fn report_lists_counts_folders_and_errors() {
        let report = IndexReport {
            files_scanned: 3,
            files_added: 1,
            files_modified: 1,
            files_unchanged: 1,
            fragments_total: 12,
            errors: vec!["src/bad.py: unreadable".into()],
            duration_ms: 42,
            ..IndexReport::default()
        };
        let mut folders = BTreeMap::new();
        folders.insert("src".to_owned(), 2);
        folders.insert(".".to_owned(), 1);
        let out = format_report(&report, Path::new("/idx"), &folders);
        assert!(out.starts_with("Indexed 3 files: 1 added, 1 modified, 1 unchanged, 0 deleted."));
        assert!(out.contains("  .: 1 files\n  src: 2 files"));
        assert!(out.contains("1 errors:\n  src/bad.py: unreadable"));
        assert!(out.ends_with("Index: /idx (42 ms)"));
    }

    #[test]
    fn noop_report_is_one_line() {
        let report = IndexReport {
            noop: true,
            fragments_total: 7,
            ..IndexReport::default()
        };
        let out = format_report(&report, Path::new("/idx"), &BTreeMap::new());
        assert!(out.starts_with("Index is up to date (7 fragments)."));
    }
}
