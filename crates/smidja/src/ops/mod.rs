//! Operator identifiers and contracts.
//!
//! Every operator has exactly one contract (input names, ranks, dtypes,
//! attributes, output count) shared by all backend implementations. The set
//! is closed: operators are registered once at engine construction and
//! looked up by id for the process lifetime.

pub mod attrs;
pub mod validate;

pub use attrs::{AttrValue, Attributes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Packed codec
    Pack,
    Unpack,
    // Fused transformer operators
    Qkv,
    Rope,
    AttentionScores,
    FusedSoftmax,
    RmsNorm,
    RmsNormGrad,
    AppendCache,
    GatherSub,
    ScatterSub,
    // Optimizer operators
    AdamMoments,
    AdamAdjust,
    // Elementwise / shape primitives
    Add,
    Sub,
    Mul,
    Sum,
    Reshape,
    Concat,
    Slice,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Pack => "pack",
            Op::Unpack => "unpack",
            Op::Qkv => "qkv",
            Op::Rope => "rope",
            Op::AttentionScores => "attention_scores",
            Op::FusedSoftmax => "fused_softmax",
            Op::RmsNorm => "rms_norm",
            Op::RmsNormGrad => "rms_norm_grad",
            Op::AppendCache => "append_cache",
            Op::GatherSub => "gather_sub",
            Op::ScatterSub => "scatter_sub",
            Op::AdamMoments => "adam_moments",
            Op::AdamAdjust => "adam_adjust",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Sum => "sum",
            Op::Reshape => "reshape",
            Op::Concat => "concat",
            Op::Slice => "slice",
        }
    }

    /// Input names in positional order; also the keys a gradient binding
    /// uses for its per-input thunks.
    pub fn input_names(&self) -> &'static [&'static str] {
        match self {
            Op::Pack | Op::Unpack => &["x"],
            Op::Qkv => &["x", "kernel"],
            Op::Rope => &["x", "sin", "cos"],
            Op::AttentionScores => &["q", "k"],
            Op::FusedSoftmax => &["logits"],
            Op::RmsNorm => &["x", "gamma"],
            Op::RmsNormGrad => &["dy", "x", "gamma"],
            Op::AppendCache => &["cache", "item"],
            Op::GatherSub => &["values", "labels", "logits"],
            Op::ScatterSub => &["probs", "labels", "dy"],
            Op::AdamMoments => &["moments", "gradient"],
            Op::AdamAdjust => &["moments", "value"],
            Op::Add | Op::Sub | Op::Mul => &["a", "b"],
            Op::Sum | Op::Reshape | Op::Slice => &["x"],
            Op::Concat => &["a", "b"],
        }
    }

    pub fn output_count(&self) -> usize {
        match self {
            Op::Qkv => 3,
            Op::RmsNormGrad => 2,
            _ => 1,
        }
    }

    pub fn all() -> &'static [Op] {
        &[
            Op::Pack,
            Op::Unpack,
            Op::Qkv,
            Op::Rope,
            Op::AttentionScores,
            Op::FusedSoftmax,
            Op::RmsNorm,
            Op::RmsNormGrad,
            Op::AppendCache,
            Op::GatherSub,
            Op::ScatterSub,
            Op::AdamMoments,
            Op::AdamAdjust,
            Op::Add,
            Op::Sub,
            Op::Mul,
            Op::Sum,
            Op::Reshape,
            Op::Concat,
            Op::Slice,
        ]
    }
}

/// Epsilon used by `rms_norm` and `rms_norm_grad`. Fixed by the operator
/// contract, not an attribute.
pub const RMS_NORM_EPS: f32 = 1e-8;
