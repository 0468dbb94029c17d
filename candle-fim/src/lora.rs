//! LoRA adapters saved by PEFT, merged into the base projection weights.
use candle::{DType, Device, Tensor};
use std::collections::HashMap;

use crate::hub::AdapterFiles;
use crate::Result;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    Names(Vec<String>),
    Name(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        Self::Names(vec!["q_proj".to_string(), "v_proj".to_string()])
    }
}

/// The subset of `adapter_config.json` needed for merging.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: TargetModules,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

impl LoraConfig {
    pub fn scale(&self) -> f64 {
        if self.r == 0 {
            0.
        } else if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

pub struct LoraAdapter {
    config: LoraConfig,
    tensors: HashMap<String, Tensor>,
}

impl LoraAdapter {
    pub fn new(config: LoraConfig, tensors: HashMap<String, Tensor>) -> Self {
        Self { config, tensors }
    }

    pub fn load(files: &AdapterFiles, device: &Device) -> Result<Self> {
        let config: LoraConfig =
            serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(&files.config)?))?;
        let tensors = candle::safetensors::load(&files.weights, device)?;
        tracing::info!(
            r = config.r,
            alpha = config.lora_alpha,
            tensors = tensors.len(),
            "loaded lora adapter"
        );
        Ok(Self::new(config, tensors))
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// `module_path` is the dotted path of a linear layer, e.g.
    /// `model.layers.0.self_attn.q_proj`.
    pub fn targets(&self, module_path: &str) -> bool {
        let name = module_path.rsplit('.').next().unwrap_or(module_path);
        match &self.config.target_modules {
            TargetModules::Names(names) => names.iter().any(|n| n == name || n == module_path),
            TargetModules::Name(n) => n == name || n == "all-linear",
        }
    }

    fn get(&self, module_path: &str, which: &str) -> Option<&Tensor> {
        let plain = format!("base_model.model.{module_path}.{which}.weight");
        let named = format!("base_model.model.{module_path}.{which}.default.weight");
        self.tensors.get(&plain).or_else(|| self.tensors.get(&named))
    }

    /// Returns `weight + scale * B A` when the adapter covers `module_path`.
    pub fn merge(&self, module_path: &str, weight: Tensor) -> candle::Result<Tensor> {
        if !self.targets(module_path) {
            return Ok(weight);
        }
        let (a, b) = match (self.get(module_path, "lora_A"), self.get(module_path, "lora_B")) {
            (Some(a), Some(b)) => (a, b),
            _ => return Ok(weight),
        };
        let dtype = weight.dtype();
        let device = weight.device().clone();
        let a = a.to_device(&device)?.to_dtype(DType::F32)?;
        let b = b.to_device(&device)?.to_dtype(DType::F32)?;
        let delta = (b.matmul(&a)? * self.config.scale())?;
        let delta = if self.config.fan_in_fan_out {
            delta.t()?
        } else {
            delta
        };
        let merged = (weight.to_dtype(DType::F32)? + delta)?;
        merged.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(alpha: f64, r: usize) -> LoraConfig {
        LoraConfig {
            r,
            lora_alpha: alpha,
            target_modules: TargetModules::Names(vec!["q_proj".to_string()]),
            use_rslora: false,
            fan_in_fan_out: false,
        }
    }

    #[test]
    fn merge_adds_scaled_low_rank_update() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let path = "model.layers.0.self_attn.q_proj";
        let a = Tensor::new(&[[1f32, 2., 3.]], &dev)?;
        let b = Tensor::new(&[[1f32], [0.], [2.], [1.]], &dev)?;
        let mut tensors = HashMap::new();
        tensors.insert(format!("base_model.model.{path}.lora_A.weight"), a);
        tensors.insert(format!("base_model.model.{path}.lora_B.weight"), b);
        let adapter = LoraAdapter::new(config(4., 2), tensors);
        assert_eq!(adapter.config().scale(), 2.);

        let weight = Tensor::ones((4, 3), DType::F32, &dev)?;
        let merged = adapter.merge(path, weight.clone())?;
        assert_eq!(
            merged.to_vec2::<f32>()?,
            [
                [3., 5., 7.],
                [1., 1., 1.],
                [5., 9., 13.],
                [3., 5., 7.]
            ]
        );

        let untouched = adapter.merge("model.layers.0.self_attn.k_proj", weight)?;
        assert_eq!(untouched.to_vec2::<f32>()?, [[1f32; 3]; 4]);
        Ok(())
    }

    #[test]
    fn rslora_scale() {
        let mut cfg = config(8., 4);
        cfg.use_rslora = true;
        assert_eq!(cfg.scale(), 4.);
    }

    #[test]
    fn adapter_config_parsing() -> anyhow::Result<()> {
        let cfg: LoraConfig = serde_json::from_str(
            r#"{"r": 16, "lora_alpha": 32, "target_modules": ["q_proj", "v_proj"], "peft_type": "LORA"}"#,
        )?;
        assert_eq!(cfg.scale(), 2.);
        let adapter = LoraAdapter::new(cfg, HashMap::new());
        assert!(adapter.targets("model.layers.3.self_attn.v_proj"));
        assert!(!adapter.targets("model.layers.3.mlp.up_proj"));
        Ok(())
    }
}
