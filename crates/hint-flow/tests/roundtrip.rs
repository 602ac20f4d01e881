//! End-to-end invertibility tests for the hierarchical coupling layer.
//!
//! Covers the 8-channel reference scenario (depth 2, exactly two distinct
//! coupling blocks), round-trips across every permute mode and both spatial
//! ranks, and the recompute-instead-of-cache behavior of backward.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use hint_flow::{
    concat_channels, split_channels_even, AdditiveCoupling, CouplingBlock, CouplingKind,
    HintConfig, HintLayer, PermuteMode,
};

fn build(cfg: &HintConfig) -> HintLayer {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    HintLayer::new(cfg, vb).unwrap()
}

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0.0f32, 1.0, shape, &Device::Cpu).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    let av = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let bv = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(av.len(), bv.len());
    av.iter()
        .zip(&bv)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Trait-object wrapper that counts forward invocations per block instance.
struct CountingBlock {
    inner: Box<dyn CouplingBlock>,
    calls: Arc<AtomicUsize>,
}

impl CouplingBlock for CountingBlock {
    fn forward(&self, xa: &Tensor, xb: &Tensor) -> hint_flow::Result<(Tensor, Tensor, Tensor)> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.forward(xa, xb)
    }

    fn inverse(&self, ya: &Tensor, yb: &Tensor) -> hint_flow::Result<(Tensor, Tensor, Tensor)> {
        self.inner.inverse(ya, yb)
    }

    fn backward(
        &self,
        dya: &Tensor,
        dyb: &Tensor,
        ya: &Tensor,
        yb: &Tensor,
    ) -> hint_flow::Result<(Tensor, Tensor, Tensor)> {
        self.inner.backward(dya, dyb, ya, yb)
    }

    fn backward_inverse(
        &self,
        dxa: &Tensor,
        dxb: &Tensor,
        xa: &Tensor,
        xb: &Tensor,
    ) -> hint_flow::Result<(Tensor, Tensor, Tensor)> {
        self.inner.backward_inverse(dxa, dxb, xa, xb)
    }
}

#[test]
fn eight_channel_scenario_uses_two_distinct_blocks() {
    // 8 channels: 8 -> 4 -> stop, one halving, depth 2. The root block runs
    // once, the leaf block once per half.
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

    let counters: Vec<Arc<AtomicUsize>> = (0..2).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let blocks: Vec<Box<dyn CouplingBlock>> = vec![
        Box::new(CountingBlock {
            inner: Box::new(AdditiveCoupling::new(4, 4, 16, vb.pp("root")).unwrap()),
            calls: counters[0].clone(),
        }),
        Box::new(CountingBlock {
            inner: Box::new(AdditiveCoupling::new(2, 2, 16, vb.pp("leaf")).unwrap()),
            calls: counters[1].clone(),
        }),
    ];
    let layer =
        HintLayer::from_parts(blocks, None, PermuteMode::None, false, 8, 2).unwrap();
    assert_eq!(layer.depth(), 2);

    let x = randn(&[8, 8, 8, 1]);
    let (y, ld) = layer.forward(&x).unwrap();
    assert_eq!(y.dims(), &[8, 8, 8, 1]);
    assert!(ld.is_none());

    assert_eq!(counters[0].load(Ordering::Relaxed), 1, "root block calls");
    assert_eq!(counters[1].load(Ordering::Relaxed), 2, "leaf block calls");

    let (back, _) = layer.inverse(&y).unwrap();
    assert!(max_abs_diff(&x, &back) < 1e-5);
}

#[test]
fn roundtrip_all_permute_modes_2d() {
    for permute in [
        PermuteMode::None,
        PermuteMode::Lower,
        PermuteMode::Both,
        PermuteMode::Full,
    ] {
        let cfg = HintConfig {
            n_channels: 8,
            permute,
            seed: 11,
            ..Default::default()
        };
        let layer = build(&cfg);
        let x = randn(&[6, 4, 8, 2]);
        let (y, _) = layer.forward(&x).unwrap();
        let (back, _) = layer.inverse(&y).unwrap();
        assert!(
            max_abs_diff(&x, &back) < 1e-4,
            "round-trip failed for {permute:?}"
        );
    }
}

#[test]
fn roundtrip_3d_depth_three() {
    let cfg = HintConfig {
        spatial_rank: 3,
        n_channels: 16,
        coupling: CouplingKind::Affine,
        permute: PermuteMode::Both,
        seed: 5,
        ..Default::default()
    };
    let layer = build(&cfg);
    assert_eq!(layer.depth(), 3);

    let x = randn(&[4, 2, 3, 16, 2]);
    let (y, _) = layer.forward(&x).unwrap();
    assert_eq!(y.dims(), x.dims());
    let (back, _) = layer.inverse(&y).unwrap();
    assert!(max_abs_diff(&x, &back) < 1e-4);
}

#[test]
fn backward_recomputes_the_input() {
    for permute in [PermuteMode::None, PermuteMode::Lower, PermuteMode::Both] {
        let cfg = HintConfig {
            n_channels: 8,
            permute,
            seed: 3,
            ..Default::default()
        };
        let layer = build(&cfg);
        let x = randn(&[4, 4, 8, 2]);
        let (y, _) = layer.forward(&x).unwrap();

        let dy = randn(&[4, 4, 8, 2]);
        let (_, x_rec) = layer.backward(&dy, &y).unwrap();
        assert!(
            max_abs_diff(&x, &x_rec) < 1e-4,
            "backward recompute failed for {permute:?}"
        );
    }
}

#[test]
fn backward_inverse_recomputes_the_output() {
    let cfg = HintConfig {
        n_channels: 8,
        permute: PermuteMode::Full,
        seed: 9,
        ..Default::default()
    };
    let layer = build(&cfg);
    let y = randn(&[4, 4, 8, 2]);
    let (x, _) = layer.inverse(&y).unwrap();

    let dx = randn(&[4, 4, 8, 2]);
    let (_, y_rec) = layer.backward_inverse(&dx, &x).unwrap();
    assert!(max_abs_diff(&y, &y_rec) < 1e-4);
}

#[test]
fn manual_node_evaluation_matches_forward() {
    // Depth-1 layer (4 channels): the whole transform is a single block
    // application around one split.
    let cfg = HintConfig {
        n_channels: 4,
        permute: PermuteMode::None,
        logdet: false,
        ..Default::default()
    };
    let layer = build(&cfg);
    assert_eq!(layer.depth(), 1);

    let x = randn(&[4, 4, 4, 2]);
    let (y, _) = layer.forward(&x).unwrap();

    let (xa, xb) = split_channels_even(&x).unwrap();
    let (ya, yb, _) = layer.blocks()[0].forward(&xa, &xb).unwrap();
    let manual = concat_channels(&ya, &yb).unwrap();
    assert_eq!(max_abs_diff(&y, &manual), 0.0);
}
