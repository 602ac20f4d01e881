//! Perfect-reconstruction Haar lifting squeeze.
//!
//! One lifting step along a spatial axis splits it into even/odd sublattices
//! `(L, H)` and rewrites them in place:
//!
//! ```text
//! H <- H - L        predict
//! L <- L + H / 2    update
//! H <- H / sqrt(2)  normalize (energy preserving)
//! L <- L * sqrt(2)
//! ```
//!
//! which is the orthonormal Haar butterfly: `L' = (e + o)/sqrt(2)`,
//! `H' = (o - e)/sqrt(2)`. The inverse undoes normalize, update, predict in
//! exactly that order, so reconstruction is exact up to float round-off and
//! the total sum of squares is invariant.
//!
//! For 2-D data the steps run along spatial axis 1 then axis 0, producing
//! four sub-bands concatenated along the channel axis in a fixed order
//! (approximation, axis-0 detail, axis-1 detail, diagonal). For 3-D data a
//! third step along spatial axis 2 is applied to each of the four sub-bands,
//! giving eight.

use std::f64::consts::SQRT_2;

use candle_core::Tensor;
use hint_core::{HintError, Result};

use crate::reshape::{interleave, split_even_odd};
use crate::split::channel_axis;

/// Step order per spatial rank. The band layout of the output (and the
/// slicing order of the inverse) is fixed by this sequence.
fn lifting_axes(x: &Tensor, op: &'static str) -> Result<Vec<usize>> {
    match x.rank() {
        4 => Ok(vec![1, 0]),
        5 => Ok(vec![1, 0, 2]),
        r => Err(HintError::shape(
            op,
            format!("expected rank 4 (2-D) or 5 (3-D), got rank {r}"),
        )),
    }
}

/// One forward lifting step along `axis`: returns the `(low, high)` bands,
/// each with the axis halved.
fn lift(x: &Tensor, axis: usize) -> Result<(Tensor, Tensor)> {
    let (even, odd) = split_even_odd(x, axis)?;
    let high = (&odd - &even)?;
    let low = (&even + (&high * 0.5)?)?;
    let high = (high * (1.0 / SQRT_2))?;
    let low = (low * SQRT_2)?;
    Ok((low, high))
}

/// Exact inverse of [`lift`]: reconstitutes the interleaved axis.
fn unlift(low: &Tensor, high: &Tensor, axis: usize) -> Result<Tensor> {
    let low = (low * (1.0 / SQRT_2))?;
    let high = (high * SQRT_2)?;
    let even = (&low - (&high * 0.5)?)?;
    let odd = (&high + &even)?;
    interleave(&even, &odd, axis)
}

/// Haar lifting squeeze: halves every spatial axis and concatenates the
/// `2^spatial_rank` sub-bands along the channel axis.
pub fn haar_squeeze(x: &Tensor) -> Result<Tensor> {
    let axes = lifting_axes(x, "haar_squeeze")?;
    let ch = channel_axis(x)?;

    let mut bands = vec![x.clone()];
    for &axis in &axes {
        let mut next = Vec::with_capacity(bands.len() * 2);
        for band in &bands {
            let (low, high) = lift(band, axis)?;
            next.push(low);
            next.push(high);
        }
        bands = next;
    }
    let refs: Vec<&Tensor> = bands.iter().collect();
    Ok(Tensor::cat(&refs, ch)?)
}

/// Exact inverse of [`haar_squeeze`]: slices the fixed sub-band order back
/// out of the channel axis and runs the lifting steps in reverse.
pub fn haar_unsqueeze(x: &Tensor) -> Result<Tensor> {
    let axes = lifting_axes(x, "haar_unsqueeze")?;
    let ch = channel_axis(x)?;
    let c = x.dims()[ch];
    let n_bands = 1usize << axes.len();
    if c % n_bands != 0 {
        return Err(HintError::shape(
            "haar_unsqueeze",
            format!("channel width {c} is not divisible by the {n_bands} sub-bands"),
        ));
    }

    let band_width = c / n_bands;
    let mut bands: Vec<Tensor> = (0..n_bands)
        .map(|b| x.narrow(ch, b * band_width, band_width))
        .collect::<candle_core::Result<_>>()?;
    for &axis in axes.iter().rev() {
        let mut merged = Vec::with_capacity(bands.len() / 2);
        for pair in bands.chunks(2) {
            merged.push(unlift(&pair[0], &pair[1], axis)?);
        }
        bands = merged;
    }
    bands
        .pop()
        .ok_or_else(|| HintError::shape("haar_unsqueeze", "merging left no output band"))
}
