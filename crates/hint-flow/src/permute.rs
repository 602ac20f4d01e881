//! Invertible channel-mixing ("permutation") contract and a fixed shuffle.
//!
//! The recursive traversals propagate gradients through a mixer using its
//! `inverse`, which is only the correct adjoint when the underlying linear
//! map is orthonormal. Permutation matrices are; a general learned 1x1
//! mixing with non-orthogonal weights would need an explicit adjoint and is
//! out of scope here.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use hint_core::{HintError, Result};

use crate::split::channel_axis;

/// Invertible, channel-count-preserving linear map over the channel axis.
///
/// Implementations must be orthonormal (`transpose == inverse`) so that the
/// backward traversals can use [`ChannelMixer::inverse`] as the adjoint.
pub trait ChannelMixer: Send + Sync {
    /// Channel width the mixer was built for.
    fn width(&self) -> usize;

    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    fn inverse(&self, y: &Tensor) -> Result<Tensor>;
}

/// Fixed seeded channel shuffle: decorrelates the coupling split without
/// any learned parameters. Exactly invertible, logdet 0.
pub struct ShufflePermutation {
    n_channels: usize,
    perm: Tensor,
    inv_perm: Tensor,
}

impl ShufflePermutation {
    pub fn new(n_channels: usize, seed: u64, device: &Device) -> Result<Self> {
        if n_channels == 0 {
            return Err(HintError::Config(
                "shuffle permutation needs at least one channel".into(),
            ));
        }
        let mut perm: Vec<u32> = (0..n_channels as u32).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        perm.shuffle(&mut rng);

        let mut inv = vec![0u32; n_channels];
        for (dst, &src) in perm.iter().enumerate() {
            inv[src as usize] = dst as u32;
        }

        Ok(Self {
            n_channels,
            perm: Tensor::from_vec(perm, n_channels, device)?,
            inv_perm: Tensor::from_vec(inv, n_channels, device)?,
        })
    }

    fn check_width(&self, x: &Tensor, op: &'static str) -> Result<usize> {
        let axis = channel_axis(x)?;
        let c = x.dims()[axis];
        if c != self.n_channels {
            return Err(HintError::shape(
                op,
                format!(
                    "permutation built for {} channels applied to width {c}",
                    self.n_channels
                ),
            ));
        }
        Ok(axis)
    }
}

impl ChannelMixer for ShufflePermutation {
    fn width(&self) -> usize {
        self.n_channels
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let axis = self.check_width(x, "ShufflePermutation::forward")?;
        Ok(x.contiguous()?.index_select(&self.perm, axis)?)
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        let axis = self.check_width(y, "ShufflePermutation::inverse")?;
        Ok(y.contiguous()?.index_select(&self.inv_perm, axis)?)
    }
}
