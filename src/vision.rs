//! Loading and running the vision-language captioning model

use crate::config;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip::{self, BlipForConditionalGeneration};
use hf_hub::api::sync::Api;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::{info, warn};

/// Side of the generated image patch fed to the vision tower
const IMAGE_SIZE: u32 = 384;

/// Per-channel normalization applied after scaling pixels to [0, 1]
const IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const IMAGE_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// `[DEC]` id that seeds the text decoder and `[SEP]` id that terminates
/// generation, both fixed in the BLIP text vocabulary
const DECODER_BOS_TOKEN: u32 = 30522;
const SEP_TOKEN: u32 = 102;

/// Seed for the argmax path, where it has no effect on the output
const GREEDY_SEED: u64 = 299792458;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("model not loaded")]
    NotReady,

    #[error("model load failed: {0}")]
    Acquire(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<candle_core::Error> for VisionError {
    fn from(err: candle_core::Error) -> Self {
        VisionError::Inference(err.to_string())
    }
}

/// Numeric width of the loaded weights
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Full,
    Half,
}

fn precision_of(dtype: DType) -> Precision {
    match dtype {
        DType::F16 => Precision::Half,
        _ => Precision::Full,
    }
}

/// The process-wide model slot. Constructed empty by the composition root,
/// filled exactly once by `load`, then read-only for the rest of the
/// process lifetime -- request handlers only ever take shared references.
#[derive(Default)]
pub struct ModelState {
    slot: OnceCell<VisionModel>,
}

impl ModelState {
    pub fn new() -> Self {
        ModelState {
            slot: OnceCell::new(),
        }
    }

    /// Acquire the model and place it. Idempotent: once the slot is filled,
    /// later calls return immediately without touching the provider. On
    /// failure the slot stays empty; callers must not retry.
    pub fn load(&self, model_name: &str) -> Result<(), VisionError> {
        if self.slot.get().is_some() {
            return Ok(());
        }
        let model = VisionModel::load(model_name)?;
        let _ = self.slot.set(model);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn model(&self) -> Result<&VisionModel, VisionError> {
        self.slot.get().ok_or(VisionError::NotReady)
    }
}

/// A placed BLIP model with its paired text pipeline. The generator keeps a
/// KV cache across decode steps, so generation takes the mutex for its full
/// duration and concurrent requests queue on it.
pub struct VisionModel {
    model: Mutex<BlipForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
}

impl VisionModel {
    /// Fetch the named model from the hub and place it, preferring the GPU
    /// in half precision, then GPU full precision, then CPU full precision.
    pub fn load(model_name: &str) -> Result<Self, VisionError> {
        let started = Instant::now();
        info!("fetching artifacts for model {model_name}");

        let api = Api::new().map_err(|e| VisionError::Acquire(e.to_string()))?;
        let repo = api.model(model_name.to_string());
        let weights = repo.get("model.safetensors").map_err(|e| {
            warn!("weights unavailable; check network access to the Hugging Face hub or pre-populate the local cache");
            VisionError::Acquire(e.to_string())
        })?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .map_err(|e| VisionError::Acquire(e.to_string()))?;
        let tokenizer =
            Tokenizer::from_file(&tokenizer_file).map_err(|e| VisionError::Acquire(e.to_string()))?;

        let device =
            Device::cuda_if_available(0).map_err(|e| VisionError::Acquire(e.to_string()))?;
        let (model, dtype) = if device.is_cuda() {
            // Half precision first to keep the VRAM footprint down
            match build_model(&weights, DType::F16, &device) {
                Ok(model) => (model, DType::F16),
                Err(err) => {
                    warn!("half precision placement failed ({err}), retrying in full precision");
                    (build_model(&weights, DType::F32, &device)?, DType::F32)
                }
            }
        } else {
            (build_model(&weights, DType::F32, &device)?, DType::F32)
        };

        info!(
            "model {} ready on {:?} ({:?} precision) in {:.1?}",
            model_name,
            device,
            precision_of(dtype),
            started.elapsed()
        );

        Ok(VisionModel {
            model: Mutex::new(model),
            tokenizer,
            device,
            dtype,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn precision(&self) -> Precision {
        precision_of(self.dtype)
    }

    /// Unconditioned caption: argmax decoding, so the output is a pure
    /// function of the image and the loaded weights.
    pub fn caption(&self, image: &RgbImage) -> Result<String, VisionError> {
        let sampler = LogitsProcessor::new(GREEDY_SEED, None, None);
        self.generate(image, &[], config::CAPTION_MAX_TOKENS, sampler)
    }

    /// Prompted description: the prompt tokens seed the decoder and the
    /// continuation is sampled, so repeated calls may differ.
    pub fn analyze(
        &self,
        image: &RgbImage,
        prompt: &str,
        max_length: usize,
    ) -> Result<String, VisionError> {
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| VisionError::Inference(e.to_string()))?;
        let sampler = LogitsProcessor::new(
            rand::random(),
            Some(config::ANALYZE_TEMPERATURE),
            None,
        );
        self.generate(image, encoding.get_ids(), max_length, sampler)
    }

    fn generate(
        &self,
        image: &RgbImage,
        prompt_ids: &[u32],
        max_tokens: usize,
        mut sampler: LogitsProcessor,
    ) -> Result<String, VisionError> {
        let pixel_values = preprocess(image, &self.device, self.dtype)?;

        let mut model = self.model.lock().unwrap();
        model.reset_kv_cache();
        let image_embeds = pixel_values.apply(model.vision_model())?;

        let mut token_ids = Vec::with_capacity(1 + prompt_ids.len() + max_tokens);
        token_ids.push(DECODER_BOS_TOKEN);
        token_ids.extend_from_slice(prompt_ids);
        let seed_len = token_ids.len();

        for step in 0..max_tokens {
            // With the KV cache warm only the newest token is fed back in
            let context_size = if step > 0 { 1 } else { token_ids.len() };
            let start = token_ids.len() - context_size;
            let input_ids = Tensor::new(&token_ids[start..], &self.device)?.unsqueeze(0)?;
            let logits = model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?.to_dtype(DType::F32)?;
            let next = sampler.sample(&logits)?;
            if next == SEP_TOKEN {
                break;
            }
            token_ids.push(next);
        }

        let text = self
            .tokenizer
            .decode(&token_ids[seed_len..], true)
            .map_err(|e| VisionError::Inference(e.to_string()))?;
        Ok(text.trim().to_string())
    }
}

fn build_model(
    weights: &Path,
    dtype: DType,
    device: &Device,
) -> Result<BlipForConditionalGeneration, VisionError> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device) }
        .map_err(|e| VisionError::Acquire(e.to_string()))?;
    let cfg = blip::Config::image_captioning_large();
    BlipForConditionalGeneration::new(&cfg, vb).map_err(|e| VisionError::Acquire(e.to_string()))
}

/// Turn a canonical RGB image into the model's input tensor: resize to fill
/// the vision patch, scale, normalize, NCHW with a batch dimension, then
/// place on the model's own device and dtype.
fn preprocess(image: &RgbImage, device: &Device, dtype: DType) -> candle_core::Result<Tensor> {
    let resized = DynamicImage::ImageRgb8(image.clone())
        .resize_to_fill(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle)
        .to_rgb8();
    let data = resized.into_raw();
    let pixels = Tensor::from_vec(
        data,
        (IMAGE_SIZE as usize, IMAGE_SIZE as usize, 3),
        &Device::Cpu,
    )?
    .permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    let pixels = (pixels.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    pixels.unsqueeze(0)?.to_device(device)?.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_starts_unloaded() {
        let state = ModelState::new();
        assert!(!state.is_loaded());
    }

    #[test]
    fn unloaded_state_fails_fast() {
        let state = ModelState::new();
        match state.model() {
            Err(VisionError::NotReady) => {}
            Err(other) => panic!("expected NotReady, got {other}"),
            Ok(_) => panic!("expected NotReady, got a model"),
        }
    }

    #[test]
    fn preprocess_yields_batched_nchw() {
        let image = RgbImage::from_pixel(25, 17, image::Rgb([7, 200, 96]));
        let tensor = preprocess(&image, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, IMAGE_SIZE as usize, IMAGE_SIZE as usize]);
        assert_eq!(tensor.dtype(), DType::F32);
    }

    #[test]
    fn precision_maps_from_dtype() {
        assert_eq!(precision_of(DType::F16), Precision::Half);
        assert_eq!(precision_of(DType::F32), Precision::Full);
        assert_eq!(precision_of(DType::F64), Precision::Full);
    }
}
