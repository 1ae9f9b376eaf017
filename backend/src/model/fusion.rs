use tch::nn::{self, ModuleT};
use tch::{Kind, Tensor};

use super::backbones::{Backbone, BackboneKind, OUTPUT_STRIDE};
use crate::config::FusionConfig;
use crate::vision::INPUT_SIZE;
use shared::DrGrade;
use strum::EnumCount;

pub const NUM_CLASSES: i64 = DrGrade::COUNT as i64;

/// Channel attention: BN -> global average pool -> bottleneck MLP -> sigmoid
/// scale, multiplied element-wise into the unnormalized feature map.
#[derive(Debug)]
pub struct AttentionBlock {
    bn: nn::BatchNorm,
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl AttentionBlock {
    pub fn new(p: &nn::Path, channels: i64) -> Self {
        let hidden = (channels / 16).max(16);
        Self {
            bn: nn::batch_norm2d(p / "bn", channels, Default::default()),
            fc1: nn::linear(p / "fc1", channels, hidden, Default::default()),
            fc2: nn::linear(p / "fc2", hidden, channels, Default::default()),
        }
    }
}

impl ModuleT for AttentionBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let scale = xs
            .apply_t(&self.bn, train)
            .adaptive_avg_pool2d([1, 1])
            .flatten(1, -1)
            .apply(&self.fc1)
            .relu()
            .apply(&self.fc2)
            .sigmoid()
            .unsqueeze(-1)
            .unsqueeze(-1);
        xs * scale
    }
}

/// Backbone -> attention -> 1x1 projection to the shared channel width.
#[derive(Debug)]
pub struct Branch {
    backbone: Backbone,
    attention: AttentionBlock,
    projection: nn::Conv2D,
}

impl Branch {
    pub fn new(p: &nn::Path, kind: BackboneKind, config: &FusionConfig) -> Self {
        let channels = kind.out_channels();
        Self {
            backbone: Backbone::new(&(p / "backbone"), kind),
            attention: AttentionBlock::new(&(p / "attention"), channels),
            projection: nn::conv2d(
                p / "projection",
                channels,
                config.projection_channels,
                1,
                Default::default(),
            ),
        }
    }

    pub fn kind(&self) -> BackboneKind {
        self.backbone.kind()
    }
}

impl ModuleT for Branch {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let features = if train {
            self.backbone.forward_t(xs, true)
        } else {
            self.backbone.extract(xs)
        };
        features
            .apply_t(&self.attention, train)
            .apply(&self.projection)
            .relu()
    }
}

/// Learned per-branch, per-channel weights, softmax-normalized across
/// branches so the contributions for every channel sum to one.
#[derive(Debug)]
pub struct FusionLayer {
    weights: Tensor,
}

impl FusionLayer {
    pub const BRANCHES: i64 = 3;

    pub fn new(p: &nn::Path, channels: i64) -> Self {
        Self {
            weights: p.var("weights", &[Self::BRANCHES, channels], nn::Init::Const(1.0)),
        }
    }

    /// `[branches, channels]`, each column summing to one.
    pub fn normalized_weights(&self) -> Tensor {
        self.weights.softmax(0, Kind::Float)
    }

    pub fn fuse(&self, maps: &[Tensor; 3]) -> Tensor {
        let weights = self.normalized_weights();
        let weighted = |idx: usize| &maps[idx] * weights.select(0, idx as i64).view([1, -1, 1, 1]);
        weighted(0) + weighted(1) + weighted(2)
    }
}

/// Mean normalized fusion weight per branch, in branch order.
pub fn mean_branch_weights(raw_weights: &Tensor) -> Vec<f32> {
    let normalized = raw_weights.softmax(0, Kind::Float);
    (0..normalized.size()[0])
        .map(|idx| normalized.select(0, idx).mean(Kind::Float).double_value(&[]) as f32)
        .collect()
}

/// Error raised by the checked forward pass.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Branch {branch} produced non-finite features")]
    NonFiniteBranch { branch: &'static str },
}

/// Three-branch attention fusion classifier.
#[derive(Debug)]
pub struct FusionNet {
    branches: [Branch; 3],
    fusion: FusionLayer,
    dense: nn::Linear,
    classifier: nn::Linear,
    dropout: f64,
}

impl FusionNet {
    pub fn new(p: &nn::Path, config: &FusionConfig) -> Self {
        let branches_path = p / "branches";
        let branches = BackboneKind::ALL
            .map(|kind| Branch::new(&(&branches_path / kind.name()), kind, config));

        let spatial = INPUT_SIZE as i64 / OUTPUT_STRIDE;
        let flat = spatial * spatial * config.projection_channels;
        Self {
            branches,
            fusion: FusionLayer::new(&(p / "fusion"), config.projection_channels),
            dense: nn::linear(p / "head" / "dense", flat, config.hidden_units, Default::default()),
            classifier: nn::linear(
                p / "head" / "classifier",
                config.hidden_units,
                NUM_CLASSES,
                Default::default(),
            ),
            dropout: config.dropout,
        }
    }

    pub fn branch_kinds(&self) -> [BackboneKind; 3] {
        [
            self.branches[0].kind(),
            self.branches[1].kind(),
            self.branches[2].kind(),
        ]
    }

    pub fn fusion_weights(&self) -> &Tensor {
        &self.fusion.weights
    }

    fn branch_maps(&self, xs: &Tensor, train: bool) -> [(BackboneKind, Tensor); 3] {
        self.branches
            .each_ref()
            .map(|branch| (branch.kind(), branch.forward_t(xs, train)))
    }

    fn classify(&self, maps: [(BackboneKind, Tensor); 3], train: bool) -> Tensor {
        let [(_, first), (_, second), (_, third)] = maps;
        // Align every map to the first branch's spatial size.
        let size = first.size();
        let align = |map: Tensor| {
            if map.size()[2..] == size[2..] {
                map
            } else {
                map.upsample_bilinear2d([size[2], size[3]], false, None::<f64>, None::<f64>)
            }
        };
        let aligned = [first, align(second), align(third)];

        // Channels-last flatten, matching the layout the head was trained on.
        self.fusion
            .fuse(&aligned)
            .permute([0, 2, 3, 1])
            .flatten(1, -1)
            .apply(&self.dense)
            .relu()
            .dropout(self.dropout, train)
            .apply(&self.classifier)
            .softmax(-1, Kind::Float)
    }

    /// Inference forward pass that reports the first branch emitting
    /// non-finite values.
    pub fn forward_checked(&self, xs: &Tensor) -> Result<Tensor, ForwardError> {
        let maps = self.branch_maps(xs, false);
        for (kind, map) in &maps {
            let finite = map.isfinite().all().to_kind(Kind::Int64).int64_value(&[]) == 1;
            if !finite {
                return Err(ForwardError::NonFiniteBranch {
                    branch: kind.name(),
                });
            }
        }
        Ok(self.classify(maps, false))
    }
}

impl ModuleT for FusionNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.classify(self.branch_maps(xs, train), train)
    }
}
