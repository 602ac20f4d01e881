//! Coupling-block contract and reference implementations.
//!
//! A coupling block transforms the second half of a channel split
//! bijectively, conditioned on the untouched first half. The contract is
//! deliberately narrow: exact forward, exact inverse, and two backward
//! variants that *recompute* the missing activations through the inverse
//! direction instead of reading a cache. Parameter gradients are not part
//! of the contract; blocks only report gradients with respect to their
//! tensor inputs.
//!
//! Two reference blocks are provided: additive (volume preserving) and
//! affine with a soft-clamped log-scale. Both condition through a small
//! two-layer channel-wise MLP (a pair of 1x1 mixings around a tanh).

use candle_core::Tensor;
use candle_nn::VarBuilder;

use hint_core::{HintError, Result};

use crate::split::channel_axis;

/// Sum over every non-batch axis, yielding a per-sample vector `[batch]`.
pub(crate) fn sum_non_batch(t: &Tensor) -> Result<Tensor> {
    let b = t.dims()[t.rank() - 1];
    Ok(t.contiguous()?.reshape(((), b))?.sum(0)?)
}

/// Per-sample zero log-determinant matching `x`'s batch axis.
pub(crate) fn zero_logdet(x: &Tensor) -> Result<Tensor> {
    let b = x.dims()[x.rank() - 1];
    Ok(Tensor::zeros(b, x.dtype(), x.device())?)
}

/// Bijective transform of one channel half conditioned on the other.
///
/// Conventions, shared by every method:
/// - the first half passes through unchanged (`ya == xa`);
/// - `logdet` has shape `[batch]`, summed over all non-batch elements, and
///   `inverse` reports the log-determinant of the inverse map (the negated
///   forward value);
/// - the backward methods receive gradients and *output* values and return
///   gradients with respect to the inputs plus the second input recovered by
///   inversion. The first gradient argument is a seed for the pass-through
///   branch: callers driving a recursion pass zeros there and accumulate,
///   while a leaf caller passes the real upstream gradient.
pub trait CouplingBlock: Send + Sync {
    /// `(ya, yb, logdet)` with `ya = xa`.
    fn forward(&self, xa: &Tensor, xb: &Tensor) -> Result<(Tensor, Tensor, Tensor)>;

    /// Exact inverse of [`CouplingBlock::forward`]: `(xa, xb, logdet)`.
    fn inverse(&self, ya: &Tensor, yb: &Tensor) -> Result<(Tensor, Tensor, Tensor)>;

    /// Adjoint of the forward direction: `(dxa, dxb, xb)`.
    fn backward(
        &self,
        dya: &Tensor,
        dyb: &Tensor,
        ya: &Tensor,
        yb: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)>;

    /// Adjoint of the inverse direction: `(dya, dyb, yb)`.
    fn backward_inverse(
        &self,
        dxa: &Tensor,
        dxb: &Tensor,
        xa: &Tensor,
        xb: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)>;
}

/// Apply a `(c_out, c_in)` weight over the channel axis.
fn channel_linear(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    let r = x.rank();
    let xt = x.transpose(r - 2, r - 1)?.contiguous()?; // (spatial..., batch, c_in)
    // Candle's CPU matmul rejects more than two batch dims, so flatten the
    // leading dims to a single row axis before the product.
    let mut out_dims = xt.dims().to_vec();
    out_dims[r - 1] = w.dims()[0];
    let y = xt.flatten_to(r - 2)?.broadcast_matmul(&w.t()?)?; // (rows, c_out)
    Ok(y.reshape(out_dims)?.transpose(r - 2, r - 1)?.contiguous()?)
}

/// Adjoint of [`channel_linear`]: maps gradients back through `w`.
fn channel_linear_adjoint(dy: &Tensor, w: &Tensor) -> Result<Tensor> {
    let r = dy.rank();
    let dt = dy.transpose(r - 2, r - 1)?.contiguous()?; // (spatial..., batch, c_out)
    // Same batch-dim flattening as `channel_linear` for the CPU backend.
    let mut out_dims = dt.dims().to_vec();
    out_dims[r - 1] = w.dims()[1];
    let dx = dt.flatten_to(r - 2)?.broadcast_matmul(w)?; // (rows, c_in)
    Ok(dx.reshape(out_dims)?.transpose(r - 2, r - 1)?.contiguous()?)
}

/// Two-layer channel-wise conditioner: `w2 * tanh(w1 * x + b1) + b2`.
///
/// Parameters come from a `VarBuilder`; only input gradients are exposed,
/// parameter gradients are out of scope for the block contract.
pub struct Conditioner {
    w1: Tensor, // (hidden, c_in)
    b1: Tensor, // (hidden, 1)
    w2: Tensor, // (c_out, hidden)
    b2: Tensor, // (c_out, 1)
}

impl Conditioner {
    pub fn new(c_in: usize, c_out: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        if c_in == 0 || c_out == 0 || hidden == 0 {
            return Err(HintError::Config(format!(
                "conditioner widths must be nonzero, got in={c_in} out={c_out} hidden={hidden}"
            )));
        }
        let init = candle_nn::Init::Randn {
            mean: 0.0,
            stdev: 0.05,
        };
        Ok(Self {
            w1: vb.get_with_hints((hidden, c_in), "w1", init)?,
            b1: vb.get_with_hints((hidden, 1), "b1", candle_nn::Init::Const(0.0))?,
            w2: vb.get_with_hints((c_out, hidden), "w2", init)?,
            b2: vb.get_with_hints((c_out, 1), "b2", candle_nn::Init::Const(0.0))?,
        })
    }

    fn hidden_pre(&self, x: &Tensor) -> Result<Tensor> {
        Ok(channel_linear(x, &self.w1)?.broadcast_add(&self.b1)?)
    }

    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.hidden_pre(x)?.tanh()?;
        Ok(channel_linear(&h, &self.w2)?.broadcast_add(&self.b2)?)
    }

    /// Gradient of `apply` with respect to its input, re-deriving the hidden
    /// activation from `x` rather than caching it.
    pub fn input_grad(&self, x: &Tensor, dout: &Tensor) -> Result<Tensor> {
        let th = self.hidden_pre(x)?.tanh()?;
        let dh = channel_linear_adjoint(dout, &self.w2)?;
        // d tanh(u)/du = 1 - tanh(u)^2
        let gate = th.sqr()?.affine(-1.0, 1.0)?;
        let dh = (dh * gate)?;
        channel_linear_adjoint(&dh, &self.w1)
    }
}

/// Volume-preserving additive coupling: `yb = xb + t(xa)`.
pub struct AdditiveCoupling {
    cond: Conditioner,
}

impl AdditiveCoupling {
    pub fn new(c_cond: usize, c_trans: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            cond: Conditioner::new(c_cond, c_trans, hidden, vb)?,
        })
    }
}

impl CouplingBlock for AdditiveCoupling {
    fn forward(&self, xa: &Tensor, xb: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let yb = (xb + self.cond.apply(xa)?)?;
        Ok((xa.clone(), yb, zero_logdet(xa)?))
    }

    fn inverse(&self, ya: &Tensor, yb: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let xb = (yb - self.cond.apply(ya)?)?;
        Ok((ya.clone(), xb, zero_logdet(ya)?))
    }

    fn backward(
        &self,
        dya: &Tensor,
        dyb: &Tensor,
        ya: &Tensor,
        yb: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let dxa = (dya + self.cond.input_grad(ya, dyb)?)?;
        let xb = (yb - self.cond.apply(ya)?)?;
        Ok((dxa, dyb.clone(), xb))
    }

    fn backward_inverse(
        &self,
        dxa: &Tensor,
        dxb: &Tensor,
        xa: &Tensor,
        xb: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let dya = (dxa - self.cond.input_grad(xa, dxb)?)?;
        let yb = (xb + self.cond.apply(xa)?)?;
        Ok((dya, dxb.clone(), yb))
    }
}

/// Affine coupling: `yb = xb * exp(s) + t` with `[s_raw, t] = cond(xa)` and
/// the log-scale soft-clamped as `s = clamp * tanh(s_raw / clamp)` to keep
/// the exponent bounded.
pub struct AffineCoupling {
    cond: Conditioner,
    c_trans: usize,
    clamp: f64,
}

impl AffineCoupling {
    pub fn new(
        c_cond: usize,
        c_trans: usize,
        hidden: usize,
        clamp: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if clamp <= 0.0 {
            return Err(HintError::Config(format!("clamp must be > 0, got {clamp}")));
        }
        Ok(Self {
            cond: Conditioner::new(c_cond, 2 * c_trans, hidden, vb)?,
            c_trans,
            clamp,
        })
    }

    /// Recompute the clamped log-scale and shift from the conditioning half.
    fn scale_shift(&self, xa: &Tensor) -> Result<(Tensor, Tensor)> {
        let out = self.cond.apply(xa)?;
        let ch = channel_axis(&out)?;
        let s_raw = out.narrow(ch, 0, self.c_trans)?;
        let t = out.narrow(ch, self.c_trans, self.c_trans)?.contiguous()?;
        let s = ((s_raw / self.clamp)?.tanh()? * self.clamp)?;
        Ok((s, t))
    }

    /// `d s / d s_raw`, recoverable from the clamped value alone:
    /// `1 - tanh(s_raw/clamp)^2 = 1 - (s/clamp)^2`.
    fn clamp_gate(&self, s: &Tensor) -> Result<Tensor> {
        Ok((s / self.clamp)?.sqr()?.affine(-1.0, 1.0)?)
    }

    /// Rebuild the conditioner-output gradient from its two channel slices
    /// and push it back to the conditioning input.
    fn cond_input_grad(&self, xa: &Tensor, ds_raw: &Tensor, dt: &Tensor) -> Result<Tensor> {
        let ch = channel_axis(ds_raw)?;
        let dout = Tensor::cat(&[ds_raw, dt], ch)?;
        self.cond.input_grad(xa, &dout)
    }
}

impl CouplingBlock for AffineCoupling {
    fn forward(&self, xa: &Tensor, xb: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (s, t) = self.scale_shift(xa)?;
        let yb = ((xb * s.exp()?)? + t)?;
        Ok((xa.clone(), yb, sum_non_batch(&s)?))
    }

    fn inverse(&self, ya: &Tensor, yb: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (s, t) = self.scale_shift(ya)?;
        let xb = ((yb - t)? * s.neg()?.exp()?)?;
        Ok((ya.clone(), xb, sum_non_batch(&s)?.neg()?))
    }

    fn backward(
        &self,
        dya: &Tensor,
        dyb: &Tensor,
        ya: &Tensor,
        yb: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (s, t) = self.scale_shift(ya)?;
        let e = s.exp()?;
        let dxb = (dyb * &e)?;
        // yb = xb*e + t, so dL/ds = dyb * xb * e = dyb * (yb - t).
        let ds = ((dyb * (yb - &t)?)? * self.clamp_gate(&s)?)?;
        let dxa = (dya + self.cond_input_grad(ya, &ds, dyb)?)?;
        let xb = ((yb - t)? * s.neg()?.exp()?)?;
        Ok((dxa, dxb, xb))
    }

    fn backward_inverse(
        &self,
        dxa: &Tensor,
        dxb: &Tensor,
        xa: &Tensor,
        xb: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (s, t) = self.scale_shift(xa)?;
        let e_neg = s.neg()?.exp()?;
        let dyb = (dxb * &e_neg)?;
        // xb = (yb - t)*exp(-s), so dL/ds = -dxb * xb and dL/dt = -dyb.
        let ds = ((dxb * xb)?.neg()? * self.clamp_gate(&s)?)?;
        let dya = (dxa + self.cond_input_grad(xa, &ds, &dyb.neg()?)?)?;
        let yb = ((xb * s.exp()?)? + t)?;
        Ok((dya, dyb, yb))
    }
}
