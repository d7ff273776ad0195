use crate::bert::ModelFiles;
use crate::error::{Result, SupportError};
use crate::settings::Settings;
use crate::t5::{T5Config, T5Model};
use candle_core::Device;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::path::Path;

/// Longest prompt fed to the encoder; flan-t5 was trained on 512.
const MAX_PROMPT_TOKENS: usize = 512;

pub struct GenerationRequest<'a> {
    pub query: &'a str,
    pub context: &'a str,
    pub sentiment: &'a str,
    pub intent: &'a str,
}

pub trait ResponseGenerator {
    fn generate_response(&self, request: &GenerationRequest<'_>) -> Result<String>;
}

pub fn build_prompt(request: &GenerationRequest<'_>) -> String {
    format!(
        "You are a helpful Customer Support Agent. Follow these rules significantly:\n\
         1. Answer the user's question using ONLY the Context provided below.\n\
         2. If the Context does not contain the answer, say \"I don't have that information right now.\"\n\
         3. Do not make up facts.\n\
         4. Be polite and concise.\n\
         \n\
         Context:\n\
         {context}\n\
         \n\
         User Sentiment: {sentiment}\n\
         User Intent: {intent}\n\
         \n\
         User Question: {query}\n\
         \n\
         Answer:",
        context = request.context,
        sentiment = request.sentiment,
        intent = request.intent,
        query = request.query,
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodingParams {
    pub max_length: usize,
    pub temperature: f64,
    pub repetition_penalty: f32,
    pub top_k: usize,
    pub seed: Option<u64>,
}

impl DecodingParams {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_length: settings.llm_max_length,
            temperature: settings.llm_temperature,
            repetition_penalty: settings.llm_repetition_penalty,
            top_k: settings.llm_top_k,
            seed: settings.llm_seed,
        }
    }
}

/// Divides positive logits and multiplies negative ones by `penalty`, once
/// per distinct id already emitted.
pub fn apply_repetition_penalty(logits: &mut [f32], previous: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let seen: HashSet<u32> = previous.iter().copied().collect();
    for id in seen {
        if let Some(logit) = logits.get_mut(id as usize) {
            *logit = if *logit > 0.0 {
                *logit / penalty
            } else {
                *logit * penalty
            };
        }
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

/// Greedy when `temperature <= 0`, otherwise temperature-scaled sampling from
/// the `top_k` highest logits (`top_k == 0` keeps the whole vocabulary).
pub fn sample_token<R: rand::Rng>(
    logits: &[f32],
    temperature: f64,
    top_k: usize,
    rng: &mut R,
) -> Result<u32> {
    if logits.is_empty() {
        return Err(SupportError::invalid("model produced empty logits"));
    }
    if temperature <= 0.0 {
        return Ok(argmax(logits));
    }

    let mut ranked: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    if top_k > 0 {
        ranked.truncate(top_k);
    }

    let max = ranked[0].1 as f64;
    let weights: Vec<f64> = ranked
        .iter()
        .map(|(_, l)| ((*l as f64 - max) / temperature).exp())
        .collect();
    let dist = WeightedIndex::new(&weights)
        .map_err(|e| SupportError::invalid(format!("cannot sample next token: {e}")))?;
    Ok(ranked[dist.sample(rng)].0 as u32)
}

/// One decoding step. The penalty covers every decoder id so far, the start
/// token included.
pub fn next_token<R: rand::Rng>(
    mut logits: Vec<f32>,
    decoder_ids: &[u32],
    params: &DecodingParams,
    rng: &mut R,
) -> Result<u32> {
    apply_repetition_penalty(&mut logits, decoder_ids, params.repetition_penalty);
    sample_token(&logits, params.temperature, params.top_k, rng)
}

pub struct ChatGenerator {
    model: T5Model,
    tokenizer: tokenizers::Tokenizer,
    params: DecodingParams,
}

impl ChatGenerator {
    pub fn load(model_dir: &Path, params: DecodingParams) -> Result<Self> {
        let files = ModelFiles::in_dir(model_dir)?;
        let config = T5Config::from_file(&files.config)?;
        let vb = files.var_builder(&Device::Cpu)?;
        let model = T5Model::load(vb, config)?;
        tracing::info!(model = %model_dir.display(), "generator loaded");
        Ok(Self {
            model,
            tokenizer: files.load_tokenizer()?,
            params,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::load(
            &settings.llm_model_path(),
            DecodingParams::from_settings(settings),
        )
    }

    pub fn params(&self) -> &DecodingParams {
        &self.params
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(SupportError::tokenizer)?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.len() > MAX_PROMPT_TOKENS {
            let eos = self.model.config().eos_token_id;
            ids.truncate(MAX_PROMPT_TOKENS - 1);
            ids.push(eos);
        }
        Ok(ids)
    }
}

impl ResponseGenerator for ChatGenerator {
    fn generate_response(&self, request: &GenerationRequest<'_>) -> Result<String> {
        let prompt_ids = self.encode_prompt(&build_prompt(request))?;
        let encoded = self.model.encode(&prompt_ids)?;

        let config = self.model.config();
        let mut rng = match self.params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut ids = vec![config.decoder_start_token_id];
        while ids.len() < self.params.max_length {
            let logits = self.model.next_token_logits(&ids, &encoded)?;
            let next = next_token(logits, &ids, &self.params, &mut rng)?;
            if next == config.eos_token_id {
                break;
            }
            ids.push(next);
        }
        tracing::debug!(
            prompt_tokens = prompt_ids.len(),
            new_tokens = ids.len() - 1,
            "generation finished"
        );

        self.tokenizer
            .decode(&ids[1..], true)
            .map_err(SupportError::tokenizer)
    }
}
