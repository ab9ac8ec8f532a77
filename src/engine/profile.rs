//! GPU offload sizing.
//!
//! Answers one question at configuration time: of a model's layers, how many
//! should `gpu_offload_layers` ask llama.cpp to place on the GPU? The sizing
//! works from two numbers — the weights file's on-disk size and the free
//! VRAM of the strongest backend device — and scales the offload to the
//! fraction of the model the card can actually hold after a reserve for the
//! KV cache and compute scratch. Hosts with their own offload policy never
//! need this module; [`EngineConfig::with_auto_gpu_offload`] is the entry
//! point for those without one.
//!
//! [`EngineConfig::with_auto_gpu_offload`]: super::EngineConfig::with_auto_gpu_offload

use std::path::Path;

use llama_cpp_2::{list_llama_ggml_backend_devices, LlamaBackendDeviceType};

/// VRAM held back from the offload budget for the KV cache and per-decode
/// scratch buffers.
const VRAM_RESERVE_MB: u64 = 512;

/// Below this fraction of the model in VRAM, offloading loses more to
/// host/device traffic than it gains; stay on the CPU.
const MIN_COVERAGE: f64 = 0.25;

/// A usable GPU reported by the llama.cpp backends.
#[derive(Debug, Clone)]
pub struct GpuInfo {
    /// Device description with its backend, e.g. "Apple M2 (Metal)".
    pub name: String,
    /// Total VRAM in megabytes.
    pub total_vram_mb: u64,
    /// Free VRAM in megabytes.
    pub free_vram_mb: u64,
}

/// Finds the strongest GPU: discrete beats integrated, ties go to the most
/// free VRAM. Returns `None` on CPU-only systems.
pub fn detect_gpu() -> Option<GpuInfo> {
    let mut best: Option<(u8, u64, GpuInfo)> = None;

    for dev in list_llama_ggml_backend_devices() {
        let rank = match dev.device_type {
            LlamaBackendDeviceType::Gpu => 2u8,
            LlamaBackendDeviceType::IntegratedGpu => 1,
            _ => continue,
        };
        let free_mb = (dev.memory_free / (1024 * 1024)) as u64;
        let total_mb = (dev.memory_total / (1024 * 1024)) as u64;
        tracing::debug!(
            "GPU candidate via {}: {:?} \"{}\", {free_mb}MB of {total_mb}MB free",
            dev.backend,
            dev.device_type,
            dev.description,
        );

        let better = match &best {
            Some((r, f, _)) => (rank, free_mb) > (*r, *f),
            None => true,
        };
        if better {
            best = Some((
                rank,
                free_mb,
                GpuInfo {
                    name: format!("{} ({})", dev.description, dev.backend),
                    total_vram_mb: total_mb,
                    free_vram_mb: free_mb,
                },
            ));
        }
    }

    best.map(|(_, _, info)| info)
}

/// Sizes the offload for the weights file at `path`, assuming `layer_count`
/// transformer layers. Returns 0 when no GPU is present or the file's size
/// cannot be read.
pub fn offload_for_model(path: &Path, layer_count: u32) -> u32 {
    let model_size_mb = std::fs::metadata(path)
        .map(|m| m.len() / (1024 * 1024))
        .unwrap_or(0);
    let Some(gpu) = detect_gpu() else {
        tracing::info!("no GPU backend detected; running on CPU");
        return 0;
    };

    let layers = layers_in_budget(layer_count, model_size_mb, gpu.free_vram_mb);
    tracing::info!(
        "offloading {layers} of {layer_count} layers to {} ({}MB model, {}MB VRAM free)",
        gpu.name,
        model_size_mb,
        gpu.free_vram_mb,
    );
    layers
}

/// The core sizing rule: scale the layer count by how much of the model fits
/// in the VRAM budget (free minus reserve). Full coverage offloads every
/// layer; coverage under [`MIN_COVERAGE`] offloads none.
pub fn layers_in_budget(layer_count: u32, model_size_mb: u64, free_vram_mb: u64) -> u32 {
    if layer_count == 0 || model_size_mb == 0 {
        return 0;
    }

    let budget_mb = free_vram_mb.saturating_sub(VRAM_RESERVE_MB);
    if budget_mb >= model_size_mb {
        return layer_count;
    }

    let coverage = budget_mb as f64 / model_size_mb as f64;
    if coverage < MIN_COVERAGE {
        return 0;
    }
    (layer_count as f64 * coverage).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_inputs_offload_nothing() {
        assert_eq!(layers_in_budget(0, 2000, 8000), 0);
        assert_eq!(layers_in_budget(32, 0, 8000), 0);
        assert_eq!(layers_in_budget(32, 2000, 0), 0);
    }

    #[test]
    fn test_model_within_budget_offloads_all_layers() {
        // 2000MB model, 8000MB free: budget 7488MB covers it whole.
        assert_eq!(layers_in_budget(32, 2000, 8000), 32);
    }

    #[test]
    fn test_partial_coverage_scales_layer_count() {
        // 8000MB model, 4512MB free: budget 4000MB -> coverage 0.5.
        assert_eq!(layers_in_budget(32, 8000, 4512), 16);
    }

    #[test]
    fn test_thin_coverage_stays_on_cpu() {
        // 8000MB model, 1512MB free: budget 1000MB -> coverage 0.125.
        assert_eq!(layers_in_budget(32, 8000, 1512), 0);
    }

    #[test]
    fn test_missing_file_offloads_nothing() {
        assert_eq!(
            offload_for_model(Path::new("/nonexistent/model.gguf"), 32),
            0
        );
    }
}
