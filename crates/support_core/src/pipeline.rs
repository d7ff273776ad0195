use crate::analytics::{ExperimentLogger, LogRecord};
use crate::classifier::{ArtifactClassifier, TextClassifier};
use crate::embed::load_embedder;
use crate::error::Result;
use crate::generate::{ChatGenerator, GenerationRequest, ResponseGenerator};
use crate::knowledge::{KnowledgeBase, Retriever};
use crate::quality::{GroundednessScorer, QualityValidator, QualityVerdict};
use crate::settings::Settings;
use crate::storage::VectorStore;
use crate::toxicity::{SafetyCheck, ToxicityFilter};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const FALLBACK_MESSAGE: &str = "I'm not 100% sure about that based on our current policies. \
Let me connect you with a human agent to be safe.";
pub const STAGE_ERROR_MESSAGE: &str =
    "Sorry, something went wrong while handling your message. Please try again.";

pub const SAFETY_BLOCK_VARIANT: &str = "safety_block";
pub const STAGE_ERROR_VARIANT: &str = "stage_error";
pub const NOT_APPLICABLE: &str = "N/A";

/// Retrieval always feeds generation the single best chunk.
const RETRIEVAL_RESULTS: usize = 1;

/// One process run. Every logged turn carries the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    id: Uuid,
}

impl Session {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

pub struct Components {
    pub sentiment: Box<dyn TextClassifier>,
    pub intent: Box<dyn TextClassifier>,
    pub safety: Box<dyn SafetyCheck>,
    pub retriever: Box<dyn Retriever>,
    pub generator: Box<dyn ResponseGenerator>,
    pub quality: Box<dyn GroundednessScorer>,
}

impl Components {
    /// Loads every model and artifact once. The first failure aborts.
    pub fn load(settings: &Settings) -> Result<Self> {
        tracing::info!("loading classifiers (sentiment and intent)");
        let sentiment = ArtifactClassifier::sentiment(settings)?;
        let intent = ArtifactClassifier::intent(settings)?;

        tracing::info!("loading toxicity filter");
        let safety = ToxicityFilter::load(&settings.toxicity_model_path(), settings.toxicity_threshold)?;

        tracing::info!("connecting to knowledge base");
        let embedder = load_embedder(settings)?;
        let store = VectorStore::new(settings.vector_store_path(), settings.collection_name.clone());
        let knowledge = KnowledgeBase::open(&store, embedder.clone())?;

        tracing::info!("warming up generator");
        let generator = ChatGenerator::from_settings(settings)?;

        Ok(Self {
            sentiment: Box::new(sentiment),
            intent: Box::new(intent),
            safety: Box::new(safety),
            retriever: Box::new(knowledge),
            generator: Box::new(generator),
            quality: Box::new(QualityValidator::new(embedder)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub sentiment: String,
    pub intent: String,
    pub context: String,
    pub raw_response: String,
    /// What the user sees: the raw response, or the fallback.
    pub response: String,
    pub quality: QualityVerdict,
    pub fallback: bool,
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Blocked { reason: String },
    Answered(Turn),
    Failed { error: String },
}

impl TurnOutcome {
    pub fn reply(&self) -> String {
        match self {
            Self::Blocked { reason } => format!("I cannot respond to that. ({reason})"),
            Self::Answered(turn) => turn.response.clone(),
            Self::Failed { .. } => STAGE_ERROR_MESSAGE.to_string(),
        }
    }
}

pub struct Pipeline {
    components: Components,
    logger: ExperimentLogger,
    session: Session,
    variant: String,
    quality_threshold: f32,
}

impl Pipeline {
    pub fn new(components: Components, logger: ExperimentLogger, settings: &Settings) -> Self {
        Self {
            components,
            logger,
            session: Session::new(),
            variant: settings.variant.clone(),
            quality_threshold: settings.quality_threshold,
        }
    }

    /// Loads the components, then opens the experiment log.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let components = Components::load(settings)?;
        tracing::info!("initializing analytics");
        let logger = ExperimentLogger::open(settings.log_path())?;
        Ok(Self::new(components, logger, settings))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn logger(&self) -> &ExperimentLogger {
        &self.logger
    }

    /// Runs one turn and logs it. Stage failures become a [`TurnOutcome::Failed`]
    /// row; only a failure to write the log is returned as an error.
    pub fn handle_turn(&self, input: &str) -> Result<TurnOutcome> {
        let start = Instant::now();
        let outcome = match self.run_stages(input, start) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "turn failed");
                TurnOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };

        let record = match &outcome {
            TurnOutcome::Blocked { reason } => self.record(
                SAFETY_BLOCK_VARIANT,
                input,
                NOT_APPLICABLE,
                NOT_APPLICABLE,
                NOT_APPLICABLE,
                reason,
                0.0,
                0.0,
            ),
            TurnOutcome::Answered(turn) => self.record(
                &self.variant,
                input,
                &turn.sentiment,
                &turn.intent,
                &turn.context,
                &turn.response,
                turn.latency.as_secs_f64(),
                f64::from(turn.quality.score),
            ),
            TurnOutcome::Failed { error } => self.record(
                STAGE_ERROR_VARIANT,
                input,
                NOT_APPLICABLE,
                NOT_APPLICABLE,
                error,
                STAGE_ERROR_MESSAGE,
                start.elapsed().as_secs_f64(),
                0.0,
            ),
        };
        self.logger.log(&record)?;
        Ok(outcome)
    }

    fn run_stages(&self, input: &str, start: Instant) -> Result<TurnOutcome> {
        let c = &self.components;

        let verdict = c.safety.check_safety(input)?;
        if !verdict.is_safe {
            tracing::info!(reason = %verdict.reason, "message blocked");
            return Ok(TurnOutcome::Blocked {
                reason: verdict.reason,
            });
        }

        let sentiment = c.sentiment.predict(input)?;
        let intent = c.intent.predict(input)?;
        tracing::debug!(%sentiment, %intent, "classified");

        let context = c.retriever.search(input, RETRIEVAL_RESULTS)?;

        let raw_response = c.generator.generate_response(&GenerationRequest {
            query: input,
            context: &context,
            sentiment: &sentiment,
            intent: &intent,
        })?;

        let quality = c.quality.validate(&raw_response, &context)?;
        let fallback = quality.score < self.quality_threshold;
        let response = if fallback {
            tracing::warn!(
                score = format_args!("{:.2}", quality.score),
                "low quality detected, fallback triggered"
            );
            FALLBACK_MESSAGE.to_string()
        } else {
            raw_response.clone()
        };

        Ok(TurnOutcome::Answered(Turn {
            sentiment,
            intent,
            context,
            raw_response,
            response,
            quality,
            fallback,
            latency: start.elapsed(),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        variant: &str,
        query: &str,
        sentiment: &str,
        intent: &str,
        context: &str,
        response: &str,
        latency_seconds: f64,
        quality_score: f64,
    ) -> LogRecord {
        LogRecord {
            session_id: self.session.to_string(),
            variant: variant.to_string(),
            user_query: query.to_string(),
            sentiment: sentiment.to_string(),
            intent: intent.to_string(),
            retrieved_context: context.to_string(),
            llm_response: response.to_string(),
            latency_seconds,
            quality_score,
        }
    }
}
