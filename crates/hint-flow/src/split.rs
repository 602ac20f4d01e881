//! Channel-axis split and concatenate primitives.
//!
//! Tensors follow the `(spatial..., channel, batch)` layout: the channel
//! axis is always second-to-last and the batch axis last. Splitting and
//! concatenating are exact inverses of each other:
//! `concat_channels(&split_channels(x, None)?) == x` for any even width.

use candle_core::Tensor;
use hint_core::{HintError, Result};

/// Index of the channel axis for the `(spatial..., channel, batch)` layout.
pub fn channel_axis(x: &Tensor) -> Result<usize> {
    let rank = x.rank();
    if rank < 2 {
        return Err(HintError::shape(
            "channel_axis",
            format!("need rank >= 2 for a (channel, batch) suffix, got {rank}"),
        ));
    }
    Ok(rank - 2)
}

/// Index of the batch axis (always the last axis).
pub fn batch_axis(x: &Tensor) -> Result<usize> {
    Ok(channel_axis(x)? + 1)
}

/// Partition `x` along the channel axis into `(left, right)`.
///
/// `index` is the width of `left`; it defaults to `round(c / 2)`. An
/// explicit index may produce asymmetric halves. The index must stay
/// within `0..=c`.
pub fn split_channels(x: &Tensor, index: Option<usize>) -> Result<(Tensor, Tensor)> {
    let axis = channel_axis(x)?;
    let c = x.dims()[axis];
    let at = match index {
        Some(i) => i,
        None => (c as f64 / 2.0).round() as usize,
    };
    if at > c {
        return Err(HintError::shape(
            "split_channels",
            format!("split index {at} exceeds channel width {c}"),
        ));
    }
    let left = x.narrow(axis, 0, at)?;
    let right = x.narrow(axis, at, c - at)?;
    Ok((left, right))
}

/// Split `x` into two equal channel halves, failing on odd widths.
///
/// This is the variant the recursive traversals use: silent rounding of an
/// odd width would break invertibility, so it is rejected outright.
pub fn split_channels_even(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let axis = channel_axis(x)?;
    let c = x.dims()[axis];
    if c % 2 != 0 {
        return Err(HintError::shape(
            "split_channels_even",
            format!("channel axis has odd width {c}, expected even"),
        ));
    }
    split_channels(x, Some(c / 2))
}

/// Concatenate two channel batches back into one tensor.
///
/// A zero-width operand acts as the identity element: the other operand is
/// returned unchanged.
pub fn concat_channels(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let axis = channel_axis(a)?;
    if a.dims()[axis] == 0 {
        return Ok(b.clone());
    }
    if b.dims()[channel_axis(b)?] == 0 {
        return Ok(a.clone());
    }
    Ok(Tensor::cat(&[a, b], axis)?)
}
