use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::blip;
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

use super::{DetailLevel, LocalModelSpec, VisionModel, VisionModelLoader};
use crate::error::CaptionError;

const IMAGE_SIZE: usize = 384;
const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];
/// `[DEC]` token that opens every generated caption.
const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;
const BRIEF_CAPTION_TOKENS: usize = 20;
const DETAILED_CAPTION_TOKENS: usize = 60;
const MAX_CAPTION_TOKENS: usize = 256;
const SAMPLING_SEED: u64 = 299_792_458;

pub struct BlipLoader;

impl VisionModelLoader for BlipLoader {
    fn load(
        &self,
        spec: &LocalModelSpec,
        weights: &[PathBuf],
    ) -> Result<Arc<dyn VisionModel>, CaptionError> {
        let model_file = find_file(weights, |path| {
            path.extension().is_some_and(|ext| ext == "safetensors")
        })?;
        let tokenizer_file = find_file(weights, |path| {
            path.file_name().is_some_and(|name| name == "tokenizer.json")
        })?;

        let device = Device::new_cuda(0).unwrap_or(Device::Cpu);
        let config = blip::Config::image_captioning_large();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(std::slice::from_ref(model_file), DType::F32, &device)?
        };
        let model = blip::BlipForConditionalGeneration::new(&config, vb)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(|e| CaptionError::Model(format!("{} tokenizer: {}", spec.name, e)))?;

        log::info!("{} ready on {:?}", spec.name, device);
        Ok(Arc::new(BlipModel {
            model: Mutex::new(model),
            tokenizer,
            device,
        }))
    }
}

fn find_file<'a>(
    weights: &'a [PathBuf],
    predicate: impl Fn(&Path) -> bool,
) -> Result<&'a PathBuf, CaptionError> {
    weights
        .iter()
        .find(|path| predicate(path))
        .ok_or_else(|| CaptionError::Model("incomplete BLIP weight set".into()))
}

struct BlipModel {
    model: Mutex<blip::BlipForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
}

impl VisionModel for BlipModel {
    fn caption(&self, image: &DynamicImage, task_token: &str) -> Result<String, CaptionError> {
        let budget = caption_budget(task_token);
        let pixels = preprocess(image, &self.device)?;

        let mut model = self
            .model
            .lock()
            .map_err(|_| CaptionError::Model("BLIP model lock poisoned".into()))?;
        model.reset_kv_cache();
        let image_embeds = model.vision_model().forward(&pixels.unsqueeze(0)?)?;

        let mut logits_processor = LogitsProcessor::from_sampling(SAMPLING_SEED, Sampling::ArgMax);
        let mut token_ids = vec![BOS_TOKEN_ID];
        for step in 0..budget {
            let context_size = if step > 0 { 1 } else { token_ids.len() };
            let start = token_ids.len() - context_size;
            let input_ids = Tensor::new(&token_ids[start..], &self.device)?.unsqueeze(0)?;
            let logits = model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        self.tokenizer
            .decode(&token_ids[1..], true)
            .map_err(|e| CaptionError::Model(format!("BLIP decode: {}", e)))
    }
}

/// BLIP has no task prompts, so the detail level bounds the decode length.
fn caption_budget(task_token: &str) -> usize {
    if task_token == DetailLevel::Brief.task_token() {
        BRIEF_CAPTION_TOKENS
    } else if task_token == DetailLevel::Detailed.task_token() {
        DETAILED_CAPTION_TOKENS
    } else {
        MAX_CAPTION_TOKENS
    }
}

/// Resizes to 384x384 and normalises with the CLIP channel statistics.
fn preprocess(image: &DynamicImage, device: &Device) -> Result<Tensor, CaptionError> {
    let size = IMAGE_SIZE as u32;
    let rgb = image
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8()
        .into_raw();
    let data = Tensor::from_vec(rgb, (IMAGE_SIZE, IMAGE_SIZE, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    let normalized = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(normalized.to_device(device)?)
}
