use anyhow::Result;
use clap::Parser;
use rustyline::DefaultEditor;
use support_cli::{init_tracing, run_session, SettingsArgs};
use support_core::Pipeline;

#[derive(Debug, Parser)]
#[command(name = "supportbot", version)]
#[command(about = "Interactive customer support chatbot")]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,
}

fn start(cli: &Cli) -> Result<Pipeline> {
    let settings = cli.settings.load()?;
    init_tracing(&settings.log_level);
    tracing::info!(home = %settings.home.display(), "booting up chatbot");
    let pipeline = Pipeline::from_settings(&settings)?;
    tracing::info!("system online, ready for queries");
    Ok(pipeline)
}

fn run_repl(pipeline: &Pipeline) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    let stdout = std::io::stdout();
    run_session(pipeline, &mut editor, &mut stdout.lock())
}

fn main() {
    let cli = Cli::parse();

    let pipeline = match start(&cli) {
        Ok(p) => p,
        Err(err) => {
            eprintln!("\nCRITICAL ERROR during startup: {err:#}");
            eprintln!(
                "Please check that the classifier artifacts, the models/ folder and the \
                 knowledge base are in place (run build-kb to create the knowledge base)."
            );
            std::process::exit(1);
        }
    };

    if let Err(err) = run_repl(&pipeline) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
