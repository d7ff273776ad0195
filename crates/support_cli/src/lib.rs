use anyhow::{Context, Result};
use clap::Args;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use support_core::{Pipeline, Settings, TurnOutcome};
use tracing_subscriber::EnvFilter;

pub const PROMPT: &str = "User: ";
pub const GOODBYE: &str = "Bot: Goodbye! Have a great day.";

/// Where to find the project tree and its settings file.
#[derive(Debug, Args)]
pub struct SettingsArgs {
    /// Project root; relative paths in the settings resolve against it.
    #[arg(long, env = "SUPPORTBOT_HOME", default_value = ".")]
    pub home: PathBuf,

    /// Settings file. Defaults to <home>/config/settings.toml when present.
    #[arg(long, env = "SUPPORTBOT_CONFIG")]
    pub config: Option<PathBuf>,
}

impl SettingsArgs {
    pub fn load(&self) -> Result<Settings> {
        Settings::load(&self.home, self.config.as_deref()).context("load settings")
    }
}

/// Logs go to stderr so stdout only carries the conversation. `RUST_LOG`
/// wins over the configured level.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

/// Where user lines come from. `None` means end of input.
pub trait LineSource {
    fn next_line(&mut self, prompt: &str) -> Result<Option<String>>;
}

impl LineSource for DefaultEditor {
    fn next_line(&mut self, prompt: &str) -> Result<Option<String>> {
        loop {
            match self.readline(prompt) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        self.add_history_entry(line.trim()).ok();
                    }
                    return Ok(Some(line));
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Plain reader, no prompt echo.
pub struct ReaderLines<R>(pub R);

impl<R: BufRead> LineSource for ReaderLines<R> {
    fn next_line(&mut self, _prompt: &str) -> Result<Option<String>> {
        let mut buf = String::new();
        if self.0.read_line(&mut buf).context("read input line")? == 0 {
            return Ok(None);
        }
        Ok(Some(buf.trim_end_matches(['\n', '\r']).to_string()))
    }
}

/// The conversation loop: banner, then one turn per non-blank line until
/// `exit`/`quit` or end of input.
pub fn run_session<S, W>(pipeline: &Pipeline, lines: &mut S, out: &mut W) -> Result<()>
where
    S: LineSource,
    W: Write,
{
    writeln!(out, "--- Session ID: {} ---", pipeline.session())?;
    writeln!(out, "Type 'exit' or 'quit' to stop.\n")?;
    out.flush()?;

    while let Some(line) = lines.next_line(PROMPT)? {
        let input = line.trim();
        if matches!(input.to_lowercase().as_str(), "exit" | "quit") {
            writeln!(out, "{GOODBYE}")?;
            break;
        }
        if input.is_empty() {
            continue;
        }

        let outcome = pipeline
            .handle_turn(input)
            .context("write experiment log")?;
        writeln!(out, "Bot: {}", outcome.reply())?;
        if matches!(outcome, TurnOutcome::Answered(_)) {
            writeln!(out, "{}", "-".repeat(50))?;
        }
        out.flush()?;
    }

    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use support_core::{
        Components, ExperimentLogger, GenerationRequest, GroundednessScorer, QualityReason,
        QualityVerdict, ResponseGenerator, Retriever, SafetyCheck, SafetyVerdict, SupportError,
        TextClassifier, FALLBACK_MESSAGE, STAGE_ERROR_MESSAGE,
    };

    type CoreResult<T> = support_core::Result<T>;

    struct WordFilter;

    impl SafetyCheck for WordFilter {
        fn check_safety(&self, text: &str) -> CoreResult<SafetyVerdict> {
            Ok(if text.contains("idiot") {
                SafetyVerdict::blocked("insult", 0.91)
            } else {
                SafetyVerdict::safe()
            })
        }
    }

    struct Fixed(&'static str);

    impl TextClassifier for Fixed {
        fn predict(&self, _text: &str) -> CoreResult<String> {
            Ok(self.0.to_string())
        }
    }

    impl Retriever for Fixed {
        fn search(&self, _query: &str, _n: usize) -> CoreResult<String> {
            Ok(self.0.to_string())
        }
    }

    struct EchoGenerator;

    impl ResponseGenerator for EchoGenerator {
        fn generate_response(&self, request: &GenerationRequest<'_>) -> CoreResult<String> {
            if request.query.contains("crash") {
                return Err(SupportError::invalid("generator exploded"));
            }
            Ok(format!("Per policy: {} {}", request.context, request.query))
        }
    }

    /// Low score for anything mentioning shoes, high otherwise.
    struct ShoeSkeptic;

    impl GroundednessScorer for ShoeSkeptic {
        fn validate(&self, response: &str, _context: &str) -> CoreResult<QualityVerdict> {
            Ok(QualityVerdict {
                score: if response.contains("shoes") { 0.1 } else { 0.9 },
                reason: QualityReason::Valid,
            })
        }
    }

    fn pipeline(dir: &std::path::Path) -> Pipeline {
        let components = Components {
            sentiment: Box::new(Fixed("negative")),
            intent: Box::new(Fixed("refund_request")),
            safety: Box::new(WordFilter),
            retriever: Box::new(Fixed("Refunds are issued within 30 days.")),
            generator: Box::new(EchoGenerator),
            quality: Box::new(ShoeSkeptic),
        };
        let logger = ExperimentLogger::open(dir.join("logs/production_logs.csv")).unwrap();
        Pipeline::new(components, logger, &Settings::default())
    }

    fn converse(p: &Pipeline, input: &str) -> String {
        let mut out = Vec::new();
        run_session(p, &mut ReaderLines(input.as_bytes()), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn dashes() -> String {
        "-".repeat(50)
    }

    #[test]
    fn transcript_follows_the_turn_rules() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());

        let stdout = converse(&p, "   \nI want a refund\nyou idiot\n  QuIt  \nnever read\n");
        let expected = format!(
            "--- Session ID: {id} ---\n\
             Type 'exit' or 'quit' to stop.\n\
             \n\
             Bot: Per policy: Refunds are issued within 30 days. I want a refund\n\
             {dashes}\n\
             Bot: I cannot respond to that. (Blocked due to insult (0.91))\n\
             {GOODBYE}\n",
            id = p.session(),
            dashes = dashes(),
        );
        assert_eq!(stdout, expected);

        // header + two turns; the blank line and the line after quit never ran
        let log = std::fs::read_to_string(p.logger().path()).unwrap();
        assert_eq!(log.lines().count(), 3);
    }

    #[test]
    fn end_of_input_stops_without_goodbye() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());

        let stdout = converse(&p, "refund?");
        let last_turn = format!(
            "Bot: Per policy: Refunds are issued within 30 days. refund?\n{}\n",
            dashes()
        );
        assert!(stdout.ends_with(&last_turn));
        assert!(!stdout.contains(GOODBYE));
    }

    #[test]
    fn exit_is_matched_after_trimming() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());

        let stdout = converse(&p, "\t EXIT\r\n");
        assert!(stdout.ends_with(&format!("{GOODBYE}\n")));
        assert!(!stdout.contains("Bot: Per policy"));
        let log = std::fs::read_to_string(p.logger().path()).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn fallback_is_answered_but_failures_get_no_separator() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());

        let stdout = converse(&p, "return my shoes\nplease crash\nexit\n");
        let body: Vec<&str> = stdout.lines().skip(3).collect();
        assert_eq!(
            body,
            vec![
                format!("Bot: {FALLBACK_MESSAGE}").as_str(),
                dashes().as_str(),
                format!("Bot: {STAGE_ERROR_MESSAGE}").as_str(),
                GOODBYE,
            ]
        );
    }
}
