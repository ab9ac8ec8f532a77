//! Sampler chain assembly.
//!
//! The chain is rebuilt for every generation call, in fixed order:
//! repetition penalty, top-k, top-p, temperature, seeded distribution.
//! Drawing the seed here (not at engine construction) keeps each generation
//! independently reproducible when a fixed seed is configured.

use llama_cpp_2::sampling::LlamaSampler;

use super::GenerationParameters;

/// Window for the repetition penalty; frequency and presence penalties are
/// left at zero.
const PENALTY_LAST_N: i32 = 64;

/// Builds the sampler chain for one generation.
///
/// `parameters` must already be in clamped form; in particular the
/// temperature floor of 0.01 avoids degenerate divisions in the temperature
/// stage.
pub(crate) fn build(parameters: &GenerationParameters, configured_seed: Option<u32>) -> LlamaSampler {
    let seed = configured_seed.unwrap_or_else(random_seed);
    tracing::debug!(
        "sampler chain: top_k={}, top_p={}, temp={}, repeat_penalty={}, seed={}",
        parameters.top_k,
        parameters.top_p,
        parameters.temperature,
        parameters.repeat_penalty,
        seed,
    );

    LlamaSampler::chain_simple([
        LlamaSampler::penalties(PENALTY_LAST_N, parameters.repeat_penalty, 0.0, 0.0),
        LlamaSampler::top_k(parameters.top_k),
        LlamaSampler::top_p(parameters.top_p, 1),
        LlamaSampler::temp(parameters.temperature),
        LlamaSampler::dist(seed),
    ])
}

fn random_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_builds_from_clamped_params() {
        let params = GenerationParameters {
            temperature: 0.0,
            top_k: 0,
            ..Default::default()
        }
        .clamped();
        let _sampler = build(&params, Some(42));
    }

    #[test]
    fn test_random_seed_varies() {
        // RandomState is randomly keyed per instance, so collisions across
        // two draws are vanishingly unlikely.
        let a = random_seed();
        let b = random_seed();
        let c = random_seed();
        assert!(a != b || b != c);
    }
}
