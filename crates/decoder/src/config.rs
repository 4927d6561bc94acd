//! Static layer geometry and the decoder configuration file.

use std::{
    fs,
    mem::size_of,
    path::{Path, PathBuf},
};

use attention::{AttentionConfig, CacheLayout};
use layers::mlp::FFN_EXPANSION;
use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};
use crate::gemm::DEFAULT_GEMM_PROFILE;
use crate::workspace::{POINTER_TABLE_ENTRIES, REGION_UNITS};

/// Per-layer geometry, fixed for the lifetime of a decoder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeConfig {
    pub batch_size: usize,
    pub max_seq_len: usize,
    pub head_num: usize,
    pub size_per_head: usize,
    /// Width of the encoder memory fed to cross-attention.
    pub memory_hidden_units: usize,
}

impl ShapeConfig {
    pub fn new(
        batch_size: usize,
        max_seq_len: usize,
        head_num: usize,
        size_per_head: usize,
        memory_hidden_units: usize,
    ) -> Result<Self> {
        let shape = Self {
            batch_size,
            max_seq_len,
            head_num,
            size_per_head,
            memory_hidden_units,
        };
        shape.validate()?;
        Ok(shape)
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("batch_size", self.batch_size),
            ("max_seq_len", self.max_seq_len),
            ("head_num", self.head_num),
            ("size_per_head", self.size_per_head),
            ("memory_hidden_units", self.memory_hidden_units),
        ];
        let errors: Vec<String> = fields
            .iter()
            .filter(|(_, value)| *value == 0)
            .map(|(name, _)| format!("{name} must be greater than 0"))
            .collect();
        if !errors.is_empty() {
            return Err(DecoderError::InvalidShape(errors.join("; ")));
        }
        self.checked_extents().map(|_| ()).ok_or_else(|| {
            DecoderError::InvalidShape(format!("{self:?} overflows the addressable element count"))
        })
    }

    /// Largest element count derived from the shape: the cache and memory
    /// tensors, and the workspace of 13 units plus its pointer tail.
    fn checked_extents(&self) -> Option<usize> {
        let hidden = self.head_num.checked_mul(self.size_per_head)?;
        FFN_EXPANSION.checked_mul(hidden)?;
        let unit = self.batch_size.checked_mul(hidden)?;
        let rows = self.batch_size.checked_mul(self.max_seq_len)?;
        let cache = rows.checked_mul(hidden)?;
        let memory = rows.checked_mul(self.memory_hidden_units)?;
        let tail = POINTER_TABLE_ENTRIES * size_of::<*const u8>();
        let workspace = REGION_UNITS.checked_mul(unit)?.checked_add(tail)?;
        Some(cache.max(memory).max(workspace))
    }

    /// `head_num * size_per_head`.
    pub fn hidden_units(&self) -> usize {
        self.head_num * self.size_per_head
    }

    /// Width of the feed-forward inner activation.
    pub fn ffn_inner_units(&self) -> usize {
        FFN_EXPANSION * self.hidden_units()
    }

    pub fn attention(&self) -> AttentionConfig {
        AttentionConfig::new(self.head_num, self.size_per_head)
    }

    pub fn cache_layout(&self) -> CacheLayout {
        CacheLayout::new(self.batch_size, self.max_seq_len, self.attention())
    }
}

fn default_gemm_profile() -> PathBuf {
    PathBuf::from(DEFAULT_GEMM_PROFILE)
}

/// Everything needed to construct a decoder step.
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub shape: ShapeConfig,
    /// Profiling output selecting GEMM algorithms; absence is not an error.
    #[serde(default = "default_gemm_profile")]
    pub gemm_profile: PathBuf,
    /// Synchronise the device after every stage in debug builds.
    #[serde(default)]
    pub debug_sync: bool,
}

impl DecoderConfig {
    pub fn new(shape: ShapeConfig) -> Self {
        Self {
            shape,
            gemm_profile: default_gemm_profile(),
            debug_sync: false,
        }
    }

    pub fn with_gemm_profile(mut self, path: impl Into<PathBuf>) -> Self {
        self.gemm_profile = path.into();
        self
    }

    /// Reads a TOML or JSON file, chosen by extension.
    ///
    /// A relative `gemm_profile` resolves against the config file's directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: DecoderConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DecoderError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        if config.gemm_profile.is_relative() {
            let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
            config.gemm_profile = base_dir.join(&config.gemm_profile);
        }
        config.shape.validate()?;
        Ok(config)
    }
}
