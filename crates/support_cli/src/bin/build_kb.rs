use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use support_cli::{init_tracing, SettingsArgs};
use support_core::{build_knowledge_base, load_embedder, VectorStore};

#[derive(Debug, Parser)]
#[command(name = "build-kb", version)]
#[command(about = "Rebuild the policy knowledge base from plain-text policy files")]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,

    /// Policy folder to read instead of the configured one.
    #[arg(long)]
    policies: Option<PathBuf>,
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings.load()?;
    init_tracing(&settings.log_level);

    let policy_dir = match &cli.policies {
        Some(dir) => dir.clone(),
        None => settings.policy_path(),
    };
    let embedder = load_embedder(&settings).context("load embedder")?;
    let store = VectorStore::new(settings.vector_store_path(), settings.collection_name.clone());

    let report = build_knowledge_base(&policy_dir, &store, &embedder)
        .with_context(|| format!("build knowledge base from {}", policy_dir.display()))?;

    println!(
        "collection={} files={} chunks={} replaced={} output={}",
        store.collection_name(),
        report.files,
        report.chunks,
        report.replaced_existing,
        report.output.display()
    );
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
