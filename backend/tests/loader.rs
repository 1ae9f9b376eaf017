mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{build_handle, small_fusion};
use dr_backend::config::FusionConfig;
use dr_backend::model::{
    FusionNet, LoadError, LoadStrategy, ModelHandle, ModelLoader, RebuildFromWeightsStrategy,
    StrategyError, TorchScriptStrategy,
};
use tch::nn::{self, ModuleT, VarStore};
use tch::{CModule, Device, Kind, Tensor};

fn save_weights_with(path: &Path, fusion: &FusionConfig) -> u64 {
    let vars = VarStore::new(Device::Cpu);
    let _net = FusionNet::new(&vars.root(), fusion);
    vars.save(path).unwrap();
    vars.trainable_variables()
        .iter()
        .map(|t| t.numel() as u64)
        .sum()
}

fn save_weights(path: &Path) -> u64 {
    save_weights_with(path, &small_fusion())
}

fn loader_for(primary: &Path, weights: &Path) -> ModelLoader {
    ModelLoader::new(Device::Cpu)
        .with_strategy(TorchScriptStrategy::new(primary, small_fusion(), true))
        .with_strategy(RebuildFromWeightsStrategy::new(weights, small_fusion(), true))
}

#[test]
fn corrupt_primary_falls_back_to_weights() {
    let dir = tempfile::tempdir().unwrap();
    let primary = dir.path().join("fusion_dr_model.pt");
    let weights = dir.path().join("fusion_dr_model.safetensors");
    std::fs::write(&primary, b"this is not a torchscript archive").unwrap();
    let expected_params = save_weights(&weights);

    let loader = loader_for(&primary, &weights);
    assert!(!loader.is_loaded());

    let handle = loader.acquire().unwrap();
    let meta = handle.metadata();
    assert_eq!(meta.strategy, "rebuild_from_weights");
    assert_eq!(meta.artifact, weights);
    assert_eq!(meta.trainable_parameters, expected_params);
    assert!(meta.total_parameters > meta.trainable_parameters);
    assert_eq!(
        meta.architecture(),
        "VGG16 + ResNet50 + DenseNet121 with Attention"
    );
    // Fresh fusion weights are all equal, so each branch gets a third.
    let branch_weights = meta.branch_weights.clone().unwrap();
    assert!(branch_weights.iter().all(|w| (w - 1.0 / 3.0).abs() < 1e-5));

    assert!(loader.is_loaded());
    let again = loader.acquire().unwrap();
    assert!(Arc::ptr_eq(&handle, &again));
}

#[test]
fn both_artifacts_corrupt_is_model_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let primary = dir.path().join("fusion_dr_model.pt");
    let weights = dir.path().join("fusion_dr_model.safetensors");
    std::fs::write(&primary, b"garbage").unwrap();
    std::fs::write(&weights, b"more garbage").unwrap();

    let loader = loader_for(&primary, &weights);
    let err = loader.acquire().unwrap_err();
    let LoadError::ModelUnavailable { failures } = &err;
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].strategy, "torchscript");
    assert_eq!(failures[1].strategy, "rebuild_from_weights");
    assert!(failures
        .iter()
        .all(|f| !matches!(f.error, StrategyError::Missing(_))));
    assert!(err.to_string().contains("torchscript"));
    assert!(!loader.is_loaded());
}

#[test]
fn weights_for_another_architecture_are_incompatible() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("other.safetensors");
    let vars = VarStore::new(Device::Cpu);
    let _layer = nn::linear(vars.root() / "fc", 4, 2, Default::default());
    vars.save(&weights).unwrap();

    let loader = ModelLoader::new(Device::Cpu).with_strategy(RebuildFromWeightsStrategy::new(
        &weights,
        small_fusion(),
        true,
    ));
    let LoadError::ModelUnavailable { failures } = loader.acquire().unwrap_err();
    assert!(matches!(
        failures[0].error,
        StrategyError::Incompatible { .. }
    ));
}

#[test]
fn weights_with_another_head_width_are_incompatible() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("narrow.safetensors");
    let narrow = FusionConfig {
        projection_channels: 16,
        ..small_fusion()
    };
    save_weights_with(&weights, &narrow);

    let loader = ModelLoader::new(Device::Cpu).with_strategy(RebuildFromWeightsStrategy::new(
        &weights,
        small_fusion(),
        false,
    ));
    let LoadError::ModelUnavailable { failures } = loader.acquire().unwrap_err();
    match &failures[0].error {
        StrategyError::Incompatible { reason, .. } => {
            assert!(reason.contains("shape"), "unexpected reason: {}", reason)
        }
        other => panic!("expected an incompatible artifact, got {:?}", other),
    }
}

#[test]
fn traced_module_loads_through_torchscript() {
    let dir = tempfile::tempdir().unwrap();
    let primary = dir.path().join("fusion_dr_model.pt");
    let weights = dir.path().join("missing.safetensors");

    tch::manual_seed(11);
    let vars = VarStore::new(Device::Cpu);
    let net = FusionNet::new(&vars.root(), &small_fusion());
    let example = Tensor::zeros([1, 3, 224, 224], (Kind::Float, Device::Cpu));
    let module = CModule::create_by_tracing("FusionNet", "forward", &[example], &mut |inputs: &[Tensor]| {
        vec![net.forward_t(&inputs[0], false)]
    })
    .unwrap();
    module.save(&primary).unwrap();

    let loader = loader_for(&primary, &weights);
    let handle = loader.acquire().unwrap();
    let meta = handle.metadata();
    assert_eq!(meta.strategy, "torchscript");
    assert_eq!(meta.artifact, primary);

    let saved_params: u64 = CModule::load(&primary)
        .unwrap()
        .named_parameters()
        .unwrap()
        .iter()
        .map(|(_, t)| t.numel() as u64)
        .sum();
    assert_eq!(meta.total_parameters, saved_params);
    assert_eq!(meta.trainable_parameters, saved_params);
    if let Some(branch_weights) = &meta.branch_weights {
        assert!(branch_weights.iter().all(|w| (w - 1.0 / 3.0).abs() < 1e-5));
    }
    assert_eq!(handle.model_info().artifact.strategy, "torchscript");
}

struct CountingStrategy {
    loads: Arc<AtomicUsize>,
    fail_first: bool,
}

impl LoadStrategy for CountingStrategy {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn artifact(&self) -> &Path {
        Path::new("<memory>")
    }

    fn load(&self, _device: Device) -> Result<ModelHandle, StrategyError> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_first && attempt == 0 {
            return Err(StrategyError::Missing("<memory>".into()));
        }
        std::thread::sleep(Duration::from_millis(50));
        Ok(build_handle("counting"))
    }
}

#[test]
fn concurrent_acquire_builds_one_handle() {
    let loads = Arc::new(AtomicUsize::new(0));
    let loader = ModelLoader::new(Device::Cpu).with_strategy(CountingStrategy {
        loads: Arc::clone(&loads),
        fail_first: false,
    });

    let handles: Vec<Arc<ModelHandle>> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8).map(|_| s.spawn(|| loader.acquire().unwrap())).collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
}

#[test]
fn failed_load_is_retried_on_next_acquire() {
    let loads = Arc::new(AtomicUsize::new(0));
    let loader = ModelLoader::new(Device::Cpu).with_strategy(CountingStrategy {
        loads: Arc::clone(&loads),
        fail_first: true,
    });

    assert!(loader.acquire().is_err());
    assert!(!loader.is_loaded());
    let handle = loader.acquire().unwrap();
    assert_eq!(handle.metadata().strategy, "counting");
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}
