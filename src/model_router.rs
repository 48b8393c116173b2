use crate::config::ModelTiers;
use crate::validate::AskRequest;
use serde::Serialize;

/// Prompts longer than this many characters go to the capable tier.
pub const LONG_PROMPT_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Capable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub tier: ModelTier,
    pub model: String,
}

pub fn select_tier(prompt: &str, detail: bool) -> ModelTier {
    if detail || prompt.chars().count() > LONG_PROMPT_CHARS {
        ModelTier::Capable
    } else {
        ModelTier::Fast
    }
}

/// Picks the upstream model for a request. Image presence does not matter.
pub fn select_model(request: &AskRequest, tiers: &ModelTiers) -> ModelSelection {
    let tier = select_tier(&request.prompt, request.detail);
    let model = match tier {
        ModelTier::Fast => tiers.fast.clone(),
        ModelTier::Capable => tiers.capable.clone(),
    };
    ModelSelection { tier, model }
}
