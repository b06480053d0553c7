//! Manager-level composition and scaling behavior against stub scripts.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::hardware::GpuVendor;
use crate::install::RUN_SCRIPT;
use crate::platform::RegistrationToken;

struct FakePlatform {
    queue: AtomicUsize,
}

impl FakePlatform {
    fn new(queue: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: AtomicUsize::new(queue),
        })
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn registration_token(&self) -> Result<RegistrationToken, ApiError> {
        Ok(RegistrationToken {
            token: "reg-tok".into(),
            expires_at: None,
        })
    }

    async fn removal_token(&self) -> Result<String, ApiError> {
        Ok("rm-tok".into())
    }

    async fn list_runners(&self) -> Result<Vec<RemoteRunner>, ApiError> {
        Ok(Vec::new())
    }

    async fn pending_work(&self) -> Result<usize, ApiError> {
        Ok(self.queue.load(Ordering::SeqCst))
    }

    fn default_labels(&self) -> Vec<String> {
        vec!["self-hosted".into(), "linux".into()]
    }

    fn registration_url(&self) -> String {
        "https://github.com/acme/widgets".into()
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

fn write_script(dir: &Path, name: &str, body: &str) {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn stub_install(dir: &Path) {
    write_script(dir, CONFIG_SCRIPT, "#!/bin/sh\nexit 0\n");
    write_script(dir, RUN_SCRIPT, "#!/bin/sh\nexec sleep 30\n");
}

fn test_config(root: &Path) -> Config {
    let mut config = Config::from_env();
    config.platform = crate::config::PlatformKind::Github;
    config.token = "t".into();
    config.repository = "acme/widgets".into();
    config.name_prefix = "test".into();
    config.install_dir = root.join("actions-runner");
    config.work_dir = "_work".into();
    config.labels = Vec::new();
    config.target_archs = vec![Arch::X64];
    config.host_arch = Arch::X64;
    config.enable_emulation = false;
    config.enable_gpu = false;
    config.inference_only = false;
    config.enable_resource_optimization = false;
    config.use_cpu_affinity = false;
    config.clean_on_deregister = true;
    config.clean_docker = false;
    config.disk_min_free_gb = 0;
    config.runner_count = 1;
    config.min_runners = 1;
    config.max_runners = 3;
    config.deployment_strategy = DeploymentStrategy::Parallel;
    config.mode = Mode::Auto;
    config
}

async fn test_manager(root: &Path, queue: usize) -> Manager {
    let mut manager = Manager::new(test_config(root)).await.unwrap();
    manager.platform = FakePlatform::new(queue);
    manager
}

fn t4() -> GpuDescriptor {
    let mut gpu = GpuDescriptor {
        vendor: GpuVendor::Nvidia,
        model: "Tesla T4".into(),
        index: 0,
        memory_bytes: 16 * 1024 * 1024 * 1024,
        compute_capability: Some((7, 5)),
        pci_id: "0000:00:1e.0".into(),
        inference_capable: false,
        training_capable: false,
    };
    crate::hardware::gpu::classify(&mut gpu);
    gpu
}

#[tokio::test]
async fn runner_names_and_labels_compose() {
    let tmp = tempfile::tempdir().unwrap();
    let mut manager = test_manager(tmp.path(), 0).await;
    manager.gpus = vec![t4()];

    let runner = manager.build_runner(1, Arch::X64);
    assert_eq!(runner.name, "test-x64-1");
    assert!(runner.name.ends_with("-1"));
    assert!(runner
        .install_dir
        .to_string_lossy()
        .ends_with("actions-runner-x64-1"));

    for expected in ["self-hosted", "linux", "x64", "gpu", "nvidia", "inference", "training", "t4"]
    {
        assert!(
            runner.labels.iter().any(|l| l == expected),
            "missing label {expected} in {:?}",
            runner.labels
        );
    }
    // De-duplicated: "self-hosted" appears in both platform and GPU labels.
    let count = runner.labels.iter().filter(|l| *l == "self-hosted").count();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn gpu_assignment_is_ceilinged_round_robin() {
    let tmp = tempfile::tempdir().unwrap();
    let mut manager = test_manager(tmp.path(), 0).await;
    let mut second = t4();
    second.index = 1;
    manager.gpus = vec![t4(), second];

    // Three runners over two GPUs: 0, 1, 0.
    assert_eq!(manager.build_runner(1, Arch::X64).gpu.unwrap().index, 0);
    assert_eq!(manager.build_runner(2, Arch::X64).gpu.unwrap().index, 1);
    assert_eq!(manager.build_runner(3, Arch::X64).gpu.unwrap().index, 0);

    // One runner over two GPUs: the surplus GPU stays unassigned.
    manager.gpus = vec![t4(), {
        let mut g = t4();
        g.index = 1;
        g
    }];
    let only = manager.build_runner(4, Arch::X64);
    assert_eq!(only.gpu.unwrap().index, 1);
}

#[tokio::test]
async fn exclusive_install_dirs_per_runner() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = test_manager(tmp.path(), 0).await;
    let a = manager.build_runner(1, Arch::X64).install_dir;
    let b = manager.build_runner(2, Arch::X64).install_dir;
    let c = manager.build_runner(2, Arch::Arm64).install_dir;
    assert_ne!(a, b);
    assert_ne!(b, c);
}

#[tokio::test]
async fn register_distributes_runners_across_architectures() {
    let tmp = tempfile::tempdir().unwrap();
    let mut manager = test_manager(tmp.path(), 0).await;
    manager.config.runner_count = 3;
    manager.config.target_archs = vec![Arch::X64, Arch::Arm64];
    manager.config.deployment_stagger = Duration::ZERO;

    // Stub installs for the directories the manager will use.
    for dir in [
        "actions-runner-x64-1",
        "actions-runner-x64-2",
        "actions-runner-arm64-3",
    ] {
        stub_install(&tmp.path().join(dir));
    }

    manager.register_runners().await.unwrap();
    let archs: Vec<Arch> = manager.runners.values().map(|r| r.target_arch).collect();
    // Remainder goes to the earliest architecture.
    assert_eq!(archs, vec![Arch::X64, Arch::X64, Arch::Arm64]);
    assert!(manager
        .runners
        .values()
        .all(|r| r.state() == RunnerState::Registered));
}

#[tokio::test]
async fn scale_up_and_down_track_pool_membership() {
    let tmp = tempfile::tempdir().unwrap();
    let mut manager = test_manager(tmp.path(), 5).await;
    for id in 1..=3 {
        stub_install(&tmp.path().join(format!("actions-runner-x64-{id}")));
    }

    manager.register_runners().await.unwrap();
    manager.start_runners().unwrap();
    assert_eq!(manager.pool.counts().total, 1);

    manager.scale_up(2).await;
    assert_eq!(manager.pool.counts().total, 3);
    assert_eq!(manager.runners.len(), 3);

    manager.scale_down(2).await;
    let counts = manager.pool.counts();
    assert_eq!(counts.total, 1);
    assert_eq!(manager.runners.len(), 1);

    manager.shutdown().await;
    assert_eq!(manager.pool.counts().total, 0);
    assert!(manager.runners.is_empty());
}

#[tokio::test]
async fn child_exit_moves_runner_out_of_pool() {
    let tmp = tempfile::tempdir().unwrap();
    let mut manager = test_manager(tmp.path(), 0).await;
    let dir = tmp.path().join("actions-runner-x64-1");
    stub_install(&dir);
    // Worker crashes immediately.
    write_script(&dir, RUN_SCRIPT, "#!/bin/sh\nexit 7\n");

    manager.register_runners().await.unwrap();
    manager.start_runners().unwrap();
    assert_eq!(manager.pool.counts().total, 1);

    let exit = tokio::time::timeout(
        Duration::from_secs(10),
        manager.exits_rx.as_mut().unwrap().recv(),
    )
    .await
    .expect("timed out")
    .expect("channel closed");
    assert_eq!(exit.status, Some(7));

    manager.handle_child_exit(exit);
    assert_eq!(manager.pool.counts().total, 0);
    assert_eq!(
        manager.runners[&exit.id].state(),
        RunnerState::Registered
    );
}

#[tokio::test]
async fn disk_gate_refuses_additions() {
    let tmp = tempfile::tempdir().unwrap();
    let mut manager = test_manager(tmp.path(), 5).await;
    manager.config.disk_min_free_gb = u64::MAX;

    if free_space_for(&manager.config.install_dir).is_none() {
        // No mount information on this host; the gate is fail-open.
        return;
    }
    assert!(manager.check_disk_space().is_err());
    manager.scale_up(1).await;
    assert_eq!(manager.pool.counts().total, 0);
    assert!(manager.runners.is_empty());
}

#[tokio::test]
async fn stop_adopts_and_deregisters_leftover_installations() {
    let tmp = tempfile::tempdir().unwrap();
    let mut manager = test_manager(tmp.path(), 0).await;

    let leftover = tmp.path().join("actions-runner-x64-7");
    stub_install(&leftover);
    // Unrelated directories are not touched.
    let unrelated = tmp.path().join("something-else");
    std::fs::create_dir_all(&unrelated).unwrap();

    let removed = manager.deregister_installed().await.unwrap();
    assert_eq!(removed, 1);
    assert!(!leftover.exists());
    assert!(unrelated.exists());
}

#[tokio::test]
async fn status_merges_platform_view() {
    let tmp = tempfile::tempdir().unwrap();
    let mut manager = test_manager(tmp.path(), 4).await;
    stub_install(&tmp.path().join("actions-runner-x64-1"));
    manager.register_runners().await.unwrap();

    let report = manager.status().await;
    assert_eq!(report.platform, "fake");
    assert_eq!(report.queue, Some(4));
    assert_eq!(report.runners.len(), 1);
    assert_eq!(report.runners[0].state, "registered");

    // Serializes for --json output.
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"queue\":4"));

    manager.shutdown().await;
}
