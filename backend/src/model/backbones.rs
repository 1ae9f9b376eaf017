//! Convolutional feature extractors used as the three fusion branches.
//!
//! Variable names follow the torchvision layout (`features.0.weight`,
//! `layer1.0.conv1.weight`, `features.denseblock1.denselayer1.norm1.weight`,
//! ...) so exported backbone weights map onto these modules directly.
//! Only the convolutional trunks are built; no classifier tops.

use serde::{Deserialize, Serialize};
use tch::nn::{self, ModuleT};
use tch::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    Vgg16,
    ResNet50,
    DenseNet121,
}

impl BackboneKind {
    /// Branch order inside the fusion network.
    pub const ALL: [BackboneKind; 3] = [
        BackboneKind::Vgg16,
        BackboneKind::ResNet50,
        BackboneKind::DenseNet121,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackboneKind::Vgg16 => "vgg16",
            BackboneKind::ResNet50 => "resnet50",
            BackboneKind::DenseNet121 => "densenet121",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            BackboneKind::Vgg16 => "VGG16",
            BackboneKind::ResNet50 => "ResNet50",
            BackboneKind::DenseNet121 => "DenseNet121",
        }
    }

    /// Channels of the final feature map.
    pub fn out_channels(self) -> i64 {
        match self {
            BackboneKind::Vgg16 => 512,
            BackboneKind::ResNet50 => 2048,
            BackboneKind::DenseNet121 => 1024,
        }
    }
}

/// Every backbone reduces spatial resolution by this factor.
pub const OUTPUT_STRIDE: i64 = 32;

fn conv2d(p: nn::Path, c_in: i64, c_out: i64, ksize: i64, padding: i64, stride: i64) -> nn::Conv2D {
    let conv2d_cfg = nn::ConvConfig {
        stride,
        padding,
        bias: false,
        ..Default::default()
    };
    nn::conv2d(p, c_in, c_out, ksize, conv2d_cfg)
}

fn batch_norm(p: nn::Path, channels: i64) -> nn::BatchNorm {
    nn::batch_norm2d(p, channels, Default::default())
}

const VGG16_BLOCKS: [&[i64]; 5] = [
    &[64, 64],
    &[128, 128],
    &[256, 256, 256],
    &[512, 512, 512],
    &[512, 512, 512],
];

#[derive(Debug)]
pub struct Vgg16Features {
    blocks: Vec<Vec<nn::Conv2D>>,
}

impl Vgg16Features {
    pub fn new(p: &nn::Path) -> Self {
        let features = p / "features";
        let mut blocks = Vec::with_capacity(VGG16_BLOCKS.len());
        let mut c_in = 3;
        // Index into the torchvision `features` sequential: conv, relu, ..., pool.
        let mut layer = 0;
        for block in VGG16_BLOCKS {
            let mut convs = Vec::with_capacity(block.len());
            for &c_out in block {
                let cfg = nn::ConvConfig {
                    padding: 1,
                    ..Default::default()
                };
                convs.push(nn::conv2d(&features / layer, c_in, c_out, 3, cfg));
                c_in = c_out;
                layer += 2;
            }
            layer += 1;
            blocks.push(convs);
        }
        Self { blocks }
    }
}

impl ModuleT for Vgg16Features {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        let mut ys = xs.shallow_clone();
        for block in &self.blocks {
            for conv in block {
                ys = ys.apply(conv).relu();
            }
            ys = ys.max_pool2d([2, 2], [2, 2], [0, 0], [1, 1], false);
        }
        ys
    }
}

#[derive(Debug)]
struct Bottleneck {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
    conv3: nn::Conv2D,
    bn3: nn::BatchNorm,
    downsample: Option<(nn::Conv2D, nn::BatchNorm)>,
}

impl Bottleneck {
    const EXPANSION: i64 = 4;

    fn new(p: &nn::Path, c_in: i64, planes: i64, stride: i64) -> Self {
        let c_out = planes * Self::EXPANSION;
        let downsample = if stride != 1 || c_in != c_out {
            Some((
                conv2d(p / "downsample" / "0", c_in, c_out, 1, 0, stride),
                batch_norm(p / "downsample" / "1", c_out),
            ))
        } else {
            None
        };
        Self {
            conv1: conv2d(p / "conv1", c_in, planes, 1, 0, 1),
            bn1: batch_norm(p / "bn1", planes),
            conv2: conv2d(p / "conv2", planes, planes, 3, 1, stride),
            bn2: batch_norm(p / "bn2", planes),
            conv3: conv2d(p / "conv3", planes, c_out, 1, 0, 1),
            bn3: batch_norm(p / "bn3", c_out),
            downsample,
        }
    }
}

impl ModuleT for Bottleneck {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = xs
            .apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train)
            .relu()
            .apply(&self.conv3)
            .apply_t(&self.bn3, train);
        let shortcut = match &self.downsample {
            Some((conv, bn)) => xs.apply(conv).apply_t(bn, train),
            None => xs.shallow_clone(),
        };
        (ys + shortcut).relu()
    }
}

/// `(planes, blocks, stride)` per stage.
const RESNET50_STAGES: [(i64, usize, i64); 4] = [(64, 3, 1), (128, 4, 2), (256, 6, 2), (512, 3, 2)];

#[derive(Debug)]
pub struct ResNet50Features {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    stages: Vec<Vec<Bottleneck>>,
}

impl ResNet50Features {
    pub fn new(p: &nn::Path) -> Self {
        let conv1 = conv2d(p / "conv1", 3, 64, 7, 3, 2);
        let bn1 = batch_norm(p / "bn1", 64);
        let mut c_in = 64;
        let mut stages = Vec::with_capacity(RESNET50_STAGES.len());
        for (idx, &(planes, blocks, stride)) in RESNET50_STAGES.iter().enumerate() {
            let stage_path = p / format!("layer{}", idx + 1);
            let mut stage = Vec::with_capacity(blocks);
            for block_idx in 0..blocks {
                let block_stride = if block_idx == 0 { stride } else { 1 };
                stage.push(Bottleneck::new(
                    &(&stage_path / block_idx),
                    c_in,
                    planes,
                    block_stride,
                ));
                c_in = planes * Bottleneck::EXPANSION;
            }
            stages.push(stage);
        }
        Self { conv1, bn1, stages }
    }
}

impl ModuleT for ResNet50Features {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut ys = xs
            .apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false);
        for stage in &self.stages {
            for block in stage {
                ys = block.forward_t(&ys, train);
            }
        }
        ys
    }
}

#[derive(Debug)]
struct DenseLayer {
    norm1: nn::BatchNorm,
    conv1: nn::Conv2D,
    norm2: nn::BatchNorm,
    conv2: nn::Conv2D,
}

impl DenseLayer {
    fn new(p: &nn::Path, c_in: i64, growth: i64, bn_size: i64) -> Self {
        let c_mid = bn_size * growth;
        Self {
            norm1: batch_norm(p / "norm1", c_in),
            conv1: conv2d(p / "conv1", c_in, c_mid, 1, 0, 1),
            norm2: batch_norm(p / "norm2", c_mid),
            conv2: conv2d(p / "conv2", c_mid, growth, 3, 1, 1),
        }
    }
}

impl ModuleT for DenseLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply_t(&self.norm1, train)
            .relu()
            .apply(&self.conv1)
            .apply_t(&self.norm2, train)
            .relu()
            .apply(&self.conv2)
    }
}

#[derive(Debug)]
struct DenseBlock {
    layers: Vec<DenseLayer>,
}

impl ModuleT for DenseBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut features = vec![xs.shallow_clone()];
        for layer in &self.layers {
            let input = Tensor::cat(&features[..], 1);
            features.push(layer.forward_t(&input, train));
        }
        Tensor::cat(&features[..], 1)
    }
}

#[derive(Debug)]
struct Transition {
    norm: nn::BatchNorm,
    conv: nn::Conv2D,
}

impl ModuleT for Transition {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply_t(&self.norm, train)
            .relu()
            .apply(&self.conv)
            .avg_pool2d([2, 2], [2, 2], [0, 0], false, true, None::<i64>)
    }
}

const DENSENET121_BLOCKS: [usize; 4] = [6, 12, 24, 16];
const DENSENET_GROWTH: i64 = 32;
const DENSENET_BN_SIZE: i64 = 4;
const DENSENET_INIT_FEATURES: i64 = 64;

#[derive(Debug)]
pub struct DenseNet121Features {
    conv0: nn::Conv2D,
    norm0: nn::BatchNorm,
    blocks: Vec<DenseBlock>,
    transitions: Vec<Transition>,
    norm5: nn::BatchNorm,
}

impl DenseNet121Features {
    pub fn new(p: &nn::Path) -> Self {
        let f = p / "features";
        let conv0 = conv2d(&f / "conv0", 3, DENSENET_INIT_FEATURES, 7, 3, 2);
        let norm0 = batch_norm(&f / "norm0", DENSENET_INIT_FEATURES);

        let mut channels = DENSENET_INIT_FEATURES;
        let mut blocks = Vec::with_capacity(DENSENET121_BLOCKS.len());
        let mut transitions = Vec::with_capacity(DENSENET121_BLOCKS.len() - 1);
        for (idx, &num_layers) in DENSENET121_BLOCKS.iter().enumerate() {
            let block_path = &f / format!("denseblock{}", idx + 1);
            let layers = (0..num_layers)
                .map(|i| {
                    DenseLayer::new(
                        &(&block_path / format!("denselayer{}", i + 1)),
                        channels + i as i64 * DENSENET_GROWTH,
                        DENSENET_GROWTH,
                        DENSENET_BN_SIZE,
                    )
                })
                .collect();
            blocks.push(DenseBlock { layers });
            channels += num_layers as i64 * DENSENET_GROWTH;

            if idx + 1 != DENSENET121_BLOCKS.len() {
                let t = &f / format!("transition{}", idx + 1);
                transitions.push(Transition {
                    norm: batch_norm(&t / "norm", channels),
                    conv: conv2d(&t / "conv", channels, channels / 2, 1, 0, 1),
                });
                channels /= 2;
            }
        }
        let norm5 = batch_norm(&f / "norm5", channels);
        Self {
            conv0,
            norm0,
            blocks,
            transitions,
            norm5,
        }
    }
}

impl ModuleT for DenseNet121Features {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut ys = xs
            .apply(&self.conv0)
            .apply_t(&self.norm0, train)
            .relu()
            .max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false);
        for (idx, block) in self.blocks.iter().enumerate() {
            ys = block.forward_t(&ys, train);
            if let Some(transition) = self.transitions.get(idx) {
                ys = transition.forward_t(&ys, train);
            }
        }
        ys.apply_t(&self.norm5, train).relu()
    }
}

/// One of the three fixed feature extractors.
#[derive(Debug)]
pub enum Backbone {
    Vgg16(Vgg16Features),
    ResNet50(ResNet50Features),
    DenseNet121(DenseNet121Features),
}

impl Backbone {
    pub fn new(p: &nn::Path, kind: BackboneKind) -> Self {
        match kind {
            BackboneKind::Vgg16 => Backbone::Vgg16(Vgg16Features::new(p)),
            BackboneKind::ResNet50 => Backbone::ResNet50(ResNet50Features::new(p)),
            BackboneKind::DenseNet121 => Backbone::DenseNet121(DenseNet121Features::new(p)),
        }
    }

    pub fn kind(&self) -> BackboneKind {
        match self {
            Backbone::Vgg16(_) => BackboneKind::Vgg16,
            Backbone::ResNet50(_) => BackboneKind::ResNet50,
            Backbone::DenseNet121(_) => BackboneKind::DenseNet121,
        }
    }

    /// Inference-mode feature map `[N, C, H/32, W/32]`.
    pub fn extract(&self, xs: &Tensor) -> Tensor {
        self.forward_t(xs, false)
    }
}

impl ModuleT for Backbone {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            Backbone::Vgg16(net) => net.forward_t(xs, train),
            Backbone::ResNet50(net) => net.forward_t(xs, train),
            Backbone::DenseNet121(net) => net.forward_t(xs, train),
        }
    }
}
