//! Hierarchical invertible coupling layers and reshapes for normalizing
//! flows.
//!
//! Tensors follow the `(spatial..., channel, batch)` layout with 2 or 3
//! spatial axes. The crate provides:
//!
//! - channel split/concat primitives ([`split`]);
//! - invertible spatial-to-channel reshapes: block squeeze patterns
//!   ([`reshape`]) and the perfect-reconstruction Haar lifting transform
//!   ([`haar`]);
//! - the coupling-block and channel-mixer contracts with reference
//!   implementations ([`coupling`], [`permute`]);
//! - the recursive hierarchical coupling layer itself ([`hint`]) and a
//!   role-swapping reversal view ([`reverse`]).
//!
//! Every transform is exactly invertible in closed form, and the backward
//! passes recompute intermediate activations through the inverse direction
//! instead of caching them.

pub mod coupling;
pub mod haar;
pub mod hint;
pub mod permute;
pub mod reshape;
pub mod reverse;
pub mod split;

pub use coupling::{AdditiveCoupling, AffineCoupling, Conditioner, CouplingBlock};
pub use haar::{haar_squeeze, haar_unsqueeze};
pub use hint::{get_depth, HintLayer, LEAF_WIDTH};
pub use permute::{ChannelMixer, ShufflePermutation};
pub use reshape::{squeeze, unsqueeze, SqueezePattern};
pub use reverse::{InvertibleLayer, Reversed};
pub use split::{concat_channels, split_channels, split_channels_even};

// Re-export the shared foundation so downstream users need one import.
pub use hint_core::{CouplingKind, HintConfig, HintError, PermuteMode, Result};
