//! GEMM algorithm selection and the Q/K/V fusion decision.
//!
//! A profiling run writes one record naming the fastest algorithm for each
//! dense multiply of a decoder layer, plus the measured latency of the split
//! and fused Q/K/V projections. The record is read once per decoder instance.
//! A missing or malformed record is not fatal: every site falls back to the
//! precision's default heuristic with fusion disabled. A well-formed record
//! naming an algorithm the active precision cannot run aborts construction.

use std::{fmt, fs, path::Path, str::FromStr};

use layers::{GemmAlgorithm, Precision};

use crate::error::{DecoderError, Result};

/// File written by the GEMM profiler.
pub const DEFAULT_GEMM_PROFILE: &str = "decoding_gemm_config.in";

/// Fusion pays off when one batched call beats this many split calls.
const FUSION_SPEEDUP_THRESHOLD: f32 = 3.0;

/// Dense-multiply call sites of one decoder layer, in profile order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GemmSite {
    /// Split Q/K/V, both attention output projections, cross-attention query.
    Projection,
    /// Key/value projection of the encoder memory.
    MemoryProjection,
    /// Feed-forward expansion.
    FfnInner,
    /// Feed-forward contraction.
    FfnOutput,
    /// Single batched Q/K/V projection.
    FusedQkv,
}

impl GemmSite {
    pub const ALL: [GemmSite; 5] = [
        GemmSite::Projection,
        GemmSite::MemoryProjection,
        GemmSite::FfnInner,
        GemmSite::FfnOutput,
        GemmSite::FusedQkv,
    ];

    pub const fn index(self) -> usize {
        match self {
            GemmSite::Projection => 0,
            GemmSite::MemoryProjection => 1,
            GemmSite::FfnInner => 2,
            GemmSite::FfnOutput => 3,
            GemmSite::FusedQkv => 4,
        }
    }
}

impl fmt::Display for GemmSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GemmSite::Projection => "projection",
            GemmSite::MemoryProjection => "memory projection",
            GemmSite::FfnInner => "ffn inner",
            GemmSite::FfnOutput => "ffn output",
            GemmSite::FusedQkv => "fused qkv",
        };
        f.write_str(name)
    }
}

/// One parsed profiling record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmProfile {
    pub algorithms: [i32; 5],
    /// Latency of one split projection.
    pub split_time: f32,
    /// Latency of the fused batched projection.
    pub fused_time: f32,
}

impl GemmProfile {
    pub fn fuse_qkv(&self) -> bool {
        self.fused_time < FUSION_SPEEDUP_THRESHOLD * self.split_time
    }
}

fn field<T: FromStr>(token: &str, name: &str) -> Result<T> {
    token
        .parse()
        .map_err(|_| DecoderError::ConfigFormat(format!("{name}: cannot parse '{token}'")))
}

impl FromStr for GemmProfile {
    type Err = DecoderError;

    /// Accepts the compact record
    /// `skip algo0 split_time algo1 algo2 algo3 algo4 fused_time`
    /// or the profiler's six `(algo, time)` pairs, whose first pair belongs
    /// to the embedding GEMM and is skipped.
    fn from_str(text: &str) -> Result<Self> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let (algo, split, fused) = match tokens.len() {
            8 => ([1, 3, 4, 5, 6], 2, 7),
            12 => ([2, 4, 6, 8, 10], 3, 11),
            n => {
                return Err(DecoderError::ConfigFormat(format!(
                    "expected 8 or 12 fields, found {n}"
                )))
            }
        };
        let mut algorithms = [0i32; 5];
        for (site, &index) in algo.iter().enumerate() {
            algorithms[site] = field(tokens[index], "algorithm")?;
        }
        // Times the record skips must still be numbers.
        for (index, token) in tokens.iter().enumerate() {
            if !algo.contains(&index) {
                field::<f32>(token, "timing")?;
            }
        }
        Ok(Self {
            algorithms,
            split_time: field(tokens[split], "split_time")?,
            fused_time: field(tokens[fused], "fused_time")?,
        })
    }
}

/// Algorithm per call site plus the fusion decision; immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmAlgorithmTable {
    algorithms: [GemmAlgorithm; 5],
    fuse_qkv: bool,
}

impl GemmAlgorithmTable {
    /// Vendor default heuristic at every site, fusion off.
    pub fn defaults<P: Precision>() -> Self {
        Self {
            algorithms: [P::DEFAULT_ALGORITHM; 5],
            fuse_qkv: false,
        }
    }

    /// Validates every identifier against the range of `P`.
    pub fn from_profile<P: Precision>(profile: &GemmProfile) -> Result<Self> {
        let mut algorithms = [P::DEFAULT_ALGORITHM; 5];
        for site in GemmSite::ALL {
            let algorithm = GemmAlgorithm::new(profile.algorithms[site.index()]);
            if !P::accepts(algorithm) {
                return Err(DecoderError::InvalidAlgorithm {
                    site,
                    algorithm,
                    precision: P::OP,
                });
            }
            algorithms[site.index()] = algorithm;
        }
        Ok(Self {
            algorithms,
            fuse_qkv: profile.fuse_qkv(),
        })
    }

    /// Builds an explicit table, e.g. to force the fused path in tests.
    pub fn with_algorithms<P: Precision>(
        algorithms: [GemmAlgorithm; 5],
        fuse_qkv: bool,
    ) -> Result<Self> {
        let profile = GemmProfile {
            algorithms: algorithms.map(GemmAlgorithm::raw),
            split_time: 1.0,
            fused_time: if fuse_qkv { 0.0 } else { f32::INFINITY },
        };
        Self::from_profile::<P>(&profile)
    }

    /// Loads the profiling record at `path`.
    pub fn load<P: Precision>(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                log::warn!(
                    "{} not readable ({err}); using default GEMM algorithms",
                    path.display()
                );
                return Ok(Self::defaults::<P>());
            }
        };
        match text.parse::<GemmProfile>() {
            Ok(profile) => Self::from_profile::<P>(&profile),
            Err(err) => {
                log::warn!(
                    "{} is malformed ({err}); using default GEMM algorithms",
                    path.display()
                );
                Ok(Self::defaults::<P>())
            }
        }
    }

    pub fn algorithm(&self, site: GemmSite) -> GemmAlgorithm {
        self.algorithms[site.index()]
    }

    pub fn fuse_qkv(&self) -> bool {
        self.fuse_qkv
    }
}

impl fmt::Display for GemmAlgorithmTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for site in GemmSite::ALL {
            write!(f, "{site}={} ", self.algorithm(site))?;
        }
        write!(f, "fuse_qkv={}", self.fuse_qkv)
    }
}
