//! Head geometry shared by the decode-time attention sublayers.

/// Number of heads and their width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionConfig {
    /// Attention heads per layer.
    pub num_heads: usize,
    /// Width of each head.
    pub head_dim: usize,
}

impl AttentionConfig {
    pub fn new(num_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            head_dim,
        }
    }

    /// `num_heads * head_dim`.
    pub fn hidden(&self) -> usize {
        self.num_heads * self.head_dim
    }
}
