#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use dr_backend::config::FusionConfig;
use dr_backend::model::{FusionNet, ModelHandle};
use image::{ImageFormat, Rgb, RgbImage};
use tch::nn::VarStore;
use tch::Device;

/// Narrow head so test networks stay cheap to build and save.
pub fn small_fusion() -> FusionConfig {
    FusionConfig {
        projection_channels: 32,
        hidden_units: 16,
        dropout: 0.5,
    }
}

pub fn build_handle(strategy: &'static str) -> ModelHandle {
    let vars = VarStore::new(Device::Cpu);
    let net = FusionNet::new(&vars.root(), &small_fusion());
    ModelHandle::native(net, vars, &small_fusion(), strategy, Path::new("<memory>"))
}

/// Randomly initialized model shared by every test in the binary.
pub fn random_handle() -> Arc<ModelHandle> {
    static HANDLE: OnceLock<Arc<ModelHandle>> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            tch::manual_seed(7);
            Arc::new(build_handle("random_init"))
        })
        .clone()
}

/// Orange disc on black, roughly the look of a fundus photograph.
pub fn fundus_image(width: u32, height: u32) -> RgbImage {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let radius = cx.min(cy) * 0.9;
    RgbImage::from_fn(width, height, |x, y| {
        let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
        if d < radius {
            let shade = (1.0 - d / radius) * 80.0;
            Rgb([150 + shade as u8, 60 + (shade / 2.0) as u8, 20])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

pub fn encode(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, format).unwrap();
    bytes.into_inner()
}

pub const BOUNDARY: &str = "----dr-test-boundary";

pub fn multipart_body(field: &str, file_name: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}
