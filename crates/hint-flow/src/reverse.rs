//! Role-swapping view over an invertible layer.
//!
//! Instead of resolving the active direction through mutable flags or
//! name lookup, the four operations form a trait, and [`Reversed`] is a
//! zero-cost view that implements the same trait with the roles swapped
//! (forward <-> inverse, backward <-> backward_inverse). Reversing borrows
//! the underlying layer, so the owned coupling blocks are shared rather
//! than rebuilt.

use candle_core::Tensor;
use hint_core::Result;

use crate::hint::HintLayer;

/// Exactly invertible transform with adjoints for both directions.
pub trait InvertibleLayer {
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)>;

    fn inverse(&self, y: &Tensor) -> Result<(Tensor, Option<Tensor>)>;

    /// Adjoint of `forward`: `(input gradients, recomputed input)`.
    fn backward(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Adjoint of `inverse`.
    fn backward_inverse(&self, dx: &Tensor, x: &Tensor) -> Result<(Tensor, Tensor)>;

    /// View of this layer with forward/inverse (and their adjoints)
    /// swapped. Call on a reference to keep the original usable.
    fn reversed(self) -> Reversed<Self>
    where
        Self: Sized,
    {
        Reversed(self)
    }
}

impl<L: InvertibleLayer + ?Sized> InvertibleLayer for &L {
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        (**self).forward(x)
    }

    fn inverse(&self, y: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        (**self).inverse(y)
    }

    fn backward(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
        (**self).backward(dy, y)
    }

    fn backward_inverse(&self, dx: &Tensor, x: &Tensor) -> Result<(Tensor, Tensor)> {
        (**self).backward_inverse(dx, x)
    }
}

impl InvertibleLayer for HintLayer {
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        HintLayer::forward(self, x)
    }

    fn inverse(&self, y: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        HintLayer::inverse(self, y)
    }

    fn backward(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
        HintLayer::backward(self, dy, y)
    }

    fn backward_inverse(&self, dx: &Tensor, x: &Tensor) -> Result<(Tensor, Tensor)> {
        HintLayer::backward_inverse(self, dx, x)
    }
}

/// Role-swapped view of an invertible layer.
pub struct Reversed<L>(pub L);

impl<L: InvertibleLayer> InvertibleLayer for Reversed<L> {
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        self.0.inverse(x)
    }

    fn inverse(&self, y: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        self.0.forward(y)
    }

    fn backward(&self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
        self.0.backward_inverse(dy, y)
    }

    fn backward_inverse(&self, dx: &Tensor, x: &Tensor) -> Result<(Tensor, Tensor)> {
        self.0.backward(dx, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use hint_core::HintConfig;

    fn layer() -> HintLayer {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = HintConfig {
            n_channels: 8,
            ..Default::default()
        };
        HintLayer::new(&cfg, vb).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let av = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let bv = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        av.iter()
            .zip(&bv)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_reversed_swaps_directions() {
        let layer = layer();
        let x = Tensor::randn(0.0f32, 1.0, (4, 4, 8, 2), &Device::Cpu).unwrap();

        let rev = (&layer).reversed();
        let (via_rev, _) = rev.forward(&x).unwrap();
        let (via_inv, _) = layer.inverse(&x).unwrap();
        assert_eq!(max_abs_diff(&via_rev, &via_inv), 0.0);
    }

    #[test]
    fn test_double_reversal_is_identity_of_roles() {
        let layer = layer();
        let x = Tensor::randn(0.0f32, 1.0, (4, 4, 8, 1), &Device::Cpu).unwrap();

        let twice = (&layer).reversed().reversed();
        let (a, _) = twice.forward(&x).unwrap();
        let (b, _) = layer.forward(&x).unwrap();
        assert_eq!(max_abs_diff(&a, &b), 0.0);
    }

    #[test]
    fn test_reversed_roundtrip() {
        let layer = layer();
        let x = Tensor::randn(0.0f32, 1.0, (4, 4, 8, 2), &Device::Cpu).unwrap();

        let rev = (&layer).reversed();
        let (z, _) = rev.forward(&x).unwrap();
        let (back, _) = rev.inverse(&z).unwrap();
        assert!(max_abs_diff(&x, &back) < 1e-4);
    }
}
