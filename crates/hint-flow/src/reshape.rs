//! Invertible spatial-to-channel reshapes (squeeze / unsqueeze).
//!
//! A squeeze halves every spatial axis and multiplies the channel width by
//! `2^spatial_rank`; unsqueeze is its exact inverse. The three patterns move
//! the same data, they only differ in which spatial offset lands in which
//! channel sub-range. All three are pure data movement: round-trips are
//! bit-exact, with no arithmetic involved.

use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use hint_core::{HintError, Result};

use crate::split::channel_axis;

/// Pixel-to-channel arrangement used by [`squeeze`] / [`unsqueeze`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqueezePattern {
    /// Pure reshape, no data movement.
    Column,
    /// Contiguous spatial half-blocks (quadrants in 2-D, octants in 3-D)
    /// become adjacent channel groups, in lexicographic half order:
    /// top-left, top-right, bottom-left, bottom-right for 2-D.
    Patch,
    /// Even/odd spatial sublattices become channel groups, enumerated by the
    /// parity combination in the same lexicographic order. 2-D only.
    Checkerboard,
}

impl FromStr for SqueezePattern {
    type Err = HintError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "column" => Ok(Self::Column),
            "patch" => Ok(Self::Patch),
            "checkerboard" => Ok(Self::Checkerboard),
            other => Err(HintError::UnsupportedPattern(format!(
                "unknown squeeze pattern {other:?} (expected column|patch|checkerboard)"
            ))),
        }
    }
}

/// Number of spatial axes of `x` under the `(spatial..., channel, batch)`
/// layout, restricted to 2-D and 3-D data.
fn spatial_rank(x: &Tensor, op: &'static str) -> Result<usize> {
    match x.rank() {
        4 => Ok(2),
        5 => Ok(3),
        r => Err(HintError::shape(
            op,
            format!("expected rank 4 (2-D) or 5 (3-D), got rank {r}"),
        )),
    }
}

fn check_even_spatial(x: &Tensor, rank: usize, op: &'static str) -> Result<()> {
    for (axis, &size) in x.dims()[..rank].iter().enumerate() {
        if size % 2 != 0 {
            return Err(HintError::shape(
                op,
                format!("spatial axis {axis} has odd size {size}, expected even"),
            ));
        }
    }
    Ok(())
}

/// Split axis `axis` of `x` into its even- and odd-indexed sublattices.
///
/// `x[..., 2i, ...]` goes to the first result, `x[..., 2i+1, ...]` to the
/// second. The axis must have even length.
pub(crate) fn split_even_odd(x: &Tensor, axis: usize) -> Result<(Tensor, Tensor)> {
    let dims = x.dims();
    let n = dims[axis];
    if n % 2 != 0 {
        return Err(HintError::shape(
            "split_even_odd",
            format!("axis {axis} has odd size {n}, expected even"),
        ));
    }
    // Fold the axis into (n/2, 2) pairs; the trailing pair index is the parity.
    let mut folded = dims.to_vec();
    folded[axis] = n / 2;
    folded.insert(axis + 1, 2);
    let pairs = x.contiguous()?.reshape(folded)?;
    let even = pairs.narrow(axis + 1, 0, 1)?.squeeze(axis + 1)?;
    let odd = pairs.narrow(axis + 1, 1, 1)?.squeeze(axis + 1)?;
    Ok((even.contiguous()?, odd.contiguous()?))
}

/// Exact inverse of [`split_even_odd`]: interleave two sublattices back
/// into one axis of doubled length.
pub(crate) fn interleave(even: &Tensor, odd: &Tensor, axis: usize) -> Result<Tensor> {
    let stacked = Tensor::stack(&[even, odd], axis + 1)?;
    let mut merged = even.dims().to_vec();
    merged[axis] *= 2;
    Ok(stacked.contiguous()?.reshape(merged)?)
}

/// Trade a factor of 2 in each spatial axis for a `2^rank` factor in channels.
pub fn squeeze(x: &Tensor, pattern: SqueezePattern) -> Result<Tensor> {
    let rank = spatial_rank(x, "squeeze")?;
    check_even_spatial(x, rank, "squeeze")?;
    let ch = channel_axis(x)?;

    match pattern {
        SqueezePattern::Column => {
            let dims = x.dims();
            let mut shape: Vec<usize> = dims[..rank].iter().map(|s| s / 2).collect();
            shape.push(dims[ch] << rank);
            shape.push(dims[ch + 1]);
            Ok(x.contiguous()?.reshape(shape)?)
        }
        SqueezePattern::Patch => {
            // Halve each spatial axis in turn, keeping the low/high block of
            // every piece so far; the result enumerates half-blocks in
            // lexicographic order of their spatial half-indices.
            let mut groups = vec![x.clone()];
            for axis in 0..rank {
                let half = x.dims()[axis] / 2;
                let mut next = Vec::with_capacity(groups.len() * 2);
                for g in &groups {
                    next.push(g.narrow(axis, 0, half)?);
                    next.push(g.narrow(axis, half, half)?);
                }
                groups = next;
            }
            let refs: Vec<&Tensor> = groups.iter().collect();
            Ok(Tensor::cat(&refs, ch)?)
        }
        SqueezePattern::Checkerboard => {
            if rank != 2 {
                return Err(HintError::UnsupportedPattern(
                    "checkerboard squeeze is undefined for 3-D tensors".into(),
                ));
            }
            let mut groups = vec![x.clone()];
            for axis in 0..rank {
                let mut next = Vec::with_capacity(groups.len() * 2);
                for g in &groups {
                    let (even, odd) = split_even_odd(g, axis)?;
                    next.push(even);
                    next.push(odd);
                }
                groups = next;
            }
            let refs: Vec<&Tensor> = groups.iter().collect();
            Ok(Tensor::cat(&refs, ch)?)
        }
    }
}

/// Exact inverse of [`squeeze`] for the same pattern.
pub fn unsqueeze(x: &Tensor, pattern: SqueezePattern) -> Result<Tensor> {
    let rank = spatial_rank(x, "unsqueeze")?;
    let ch = channel_axis(x)?;
    let dims = x.dims();
    let c = dims[ch];
    let factor = 1usize << rank;
    if c % factor != 0 {
        return Err(HintError::shape(
            "unsqueeze",
            format!("channel width {c} is not divisible by {factor}"),
        ));
    }

    match pattern {
        SqueezePattern::Column => {
            let mut shape: Vec<usize> = dims[..rank].iter().map(|s| s * 2).collect();
            shape.push(c / factor);
            shape.push(dims[ch + 1]);
            Ok(x.contiguous()?.reshape(shape)?)
        }
        SqueezePattern::Patch | SqueezePattern::Checkerboard => {
            if pattern == SqueezePattern::Checkerboard && rank != 2 {
                return Err(HintError::UnsupportedPattern(
                    "checkerboard unsqueeze is undefined for 3-D tensors".into(),
                ));
            }
            let group_width = c / factor;
            let mut groups: Vec<Tensor> = (0..factor)
                .map(|g| x.narrow(ch, g * group_width, group_width))
                .collect::<candle_core::Result<_>>()?;
            // Merge pairs back along the spatial axes in reverse order of the
            // squeeze, undoing one axis per pass.
            for axis in (0..rank).rev() {
                let mut merged = Vec::with_capacity(groups.len() / 2);
                for pair in groups.chunks(2) {
                    let joined = match pattern {
                        SqueezePattern::Patch => Tensor::cat(&[&pair[0], &pair[1]], axis)?,
                        SqueezePattern::Checkerboard => interleave(&pair[0], &pair[1], axis)?,
                        SqueezePattern::Column => unreachable!(),
                    };
                    merged.push(joined);
                }
                groups = merged;
            }
            groups
                .pop()
                .ok_or_else(|| HintError::shape("unsqueeze", "merging left no output group"))
        }
    }
}
