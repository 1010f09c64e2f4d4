// file: tests/workflow_test.rs
// version: 1.0.0
// guid: 2d7f5b1c-8e4a-4c96-b3d0-6a9e1f4c7b28

//! Workflow engine ordering, failure and release behavior, plus the image
//! actions driven through a scripted executor

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use turingpi_provisioner::{
    actions::{
        ConfigureNetworkAction, DeployHook, MountImageAction, SetPasswordAction, UbuntuDeployBuilder,
        UnmountImageAction,
    },
    config::ProvisionerConfig,
    executor::mock::{MockExecutor, MockResponse},
    platform::StaticProbe,
    tools::{NetworkConfig, ToolProvider, ToolsConfig},
    workflow::{keys, Action, ActionContext, ActionHandler, Stage, Workflow, WorkflowState},
    ErrorKind, ProvisionError, Result,
};

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[derive(Clone, Copy)]
enum Outcome {
    Succeed,
    Fail,
    Panic,
}

/// Appends its name when run and optionally defers a release that logs too
struct Step {
    name: String,
    log: Log,
    outcome: Outcome,
    defer: bool,
}

impl Step {
    fn ok(name: &str, log: &Log) -> Action {
        Self::build(name, log, Outcome::Succeed, false)
    }

    fn build(name: &str, log: &Log, outcome: Outcome, defer: bool) -> Action {
        Action::regular(Step {
            name: name.to_string(),
            log: log.clone(),
            outcome,
            defer,
        })
    }
}

#[async_trait::async_trait]
impl ActionHandler for Step {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        self.log.lock().unwrap().push(self.name.clone());
        if self.defer {
            let log = self.log.clone();
            let name = self.name.clone();
            ctx.defer(format!("{}.resource", self.name), move || async move {
                log.lock().unwrap().push(format!("release {}", name));
                Ok(())
            });
        }
        match self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail => Err(ProvisionError::precondition(format!("{} failed", self.name))),
            Outcome::Panic => panic!("{} panicked", self.name),
        }
    }
}

async fn provider(cache: &TempDir, probe: StaticProbe, mock: Option<Arc<MockExecutor>>) -> Arc<ToolProvider> {
    let config = ProvisionerConfig {
        cache_dir: cache.path().to_path_buf(),
        ..Default::default()
    };
    let mut tools = ToolsConfig::new(config).with_probe(Arc::new(probe));
    if let Some(mock) = mock {
        tools = tools.with_tools_executor(mock);
    }
    Arc::new(ToolProvider::new(tools).await.unwrap())
}

const LINUX: StaticProbe = StaticProbe {
    linux: true,
    engine: false,
};

const KPARTX_OUTPUT: &str = "add map loop7p1 (253:0): 0 524288 linear 7:7 8192\nadd map loop7p2 (253:1): 0 6815744 linear 7:7 532480\n";

#[tokio::test]
async fn test_stages_and_actions_run_in_declared_order() -> Result<()> {
    let log = Log::default();
    let workflow = Workflow::new("ordering")
        .stage(Stage::new("first").action(Step::ok("a1", &log)).action(Step::ok("a2", &log)))
        .stage(Stage::new("second").action(Step::ok("b1", &log)))
        .stage(Stage::new("third").action(Step::ok("c1", &log)).action(Step::ok("c2", &log)));

    workflow.run(&CancellationToken::new()).await?;

    assert_eq!(entries(&log), ["a1", "a2", "b1", "c1", "c2"]);
    assert_eq!(
        workflow.store().get::<WorkflowState>(keys::WORKFLOW_STATE)?,
        WorkflowState::Completed
    );
    Ok(())
}

#[tokio::test]
async fn test_failure_stops_everything_after_it() {
    let log = Log::default();
    let workflow = Workflow::new("abort")
        .stage(Stage::new("first").action(Step::ok("a1", &log)))
        .stage(
            Stage::new("second")
                .action(Step::ok("b1", &log))
                .action(Step::build("b2", &log, Outcome::Fail, false))
                .action(Step::ok("b3", &log)),
        )
        .stage(Stage::new("third").action(Step::ok("c1", &log)));

    let err = workflow.run(&CancellationToken::new()).await.unwrap_err();

    assert_eq!(entries(&log), ["a1", "b1", "b2"]);
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert!(err.to_string().contains("second/b2"), "{}", err);
    assert_eq!(
        workflow.store().get::<WorkflowState>(keys::WORKFLOW_STATE).unwrap(),
        WorkflowState::Failed
    );
}

#[tokio::test]
async fn test_releases_run_in_reverse_after_failure() {
    let log = Log::default();
    let workflow = Workflow::new("releases")
        .stage(Stage::new("acquire").action(Step::build("r1", &log, Outcome::Succeed, true)))
        .stage(
            Stage::new("use")
                .action(Step::build("r2", &log, Outcome::Succeed, true))
                .action(Step::build("r3", &log, Outcome::Fail, true)),
        );

    workflow.run(&CancellationToken::new()).await.unwrap_err();

    assert_eq!(
        entries(&log),
        ["r1", "r2", "r3", "release r3", "release r2", "release r1"]
    );
}

#[tokio::test]
async fn test_releases_run_when_an_action_panics() {
    let log = Log::default();
    let workflow = Workflow::new("panics")
        .stage(
            Stage::new("only")
                .action(Step::build("held", &log, Outcome::Succeed, true))
                .action(Step::build("boom", &log, Outcome::Panic, false)),
        );

    let outcome = AssertUnwindSafe(workflow.run(&CancellationToken::new()))
        .catch_unwind()
        .await;

    assert!(outcome.is_err(), "panic should reach the caller");
    assert_eq!(entries(&log), ["held", "boom", "release held"]);
}

#[tokio::test]
async fn test_cancelled_workflow_runs_nothing() {
    let log = Log::default();
    let workflow = Workflow::new("cancelled").stage(Stage::new("only").action(Step::ok("a1", &log)));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = workflow.run(&cancel).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(entries(&log).is_empty());
    assert_eq!(
        workflow.store().get::<WorkflowState>(keys::WORKFLOW_STATE).unwrap(),
        WorkflowState::Cancelled
    );
}

#[tokio::test]
async fn test_platform_aware_action_without_linux_or_engine_fails() {
    let cache = TempDir::new().unwrap();
    let tools = provider(
        &cache,
        StaticProbe {
            linux: false,
            engine: false,
        },
        None,
    )
    .await;

    let workflow = Workflow::new("unsupported")
        .with_tools(tools.clone())
        .stage(Stage::new("customize").action(Action::platform_aware(UnmountImageAction::new())));

    let err = workflow.run(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert!(err.to_string().contains("unsupported platform"), "{}", err);
    tools.close().await;
}

#[tokio::test]
async fn test_mount_configure_unmount_sequence() -> Result<()> {
    let cache = TempDir::new().unwrap();
    let mock = Arc::new(MockExecutor::new());
    mock.respond("kpartx", KPARTX_OUTPUT);
    let tools = provider(&cache, LINUX, Some(mock.clone())).await;

    let network = NetworkConfig::new("host-3", "192.168.1.3/24", "192.168.1.1", vec!["8.8.8.8".into()]);
    let workflow = Workflow::new("customize")
        .with_tools(tools.clone())
        .stage(
            Stage::new("customize")
                .with_value(keys::IMAGE_WORKING, "/work/node3.img".to_string())
                .with_value(keys::WORKFLOW_CURRENT_NODE, 3u8)
                .action(Action::platform_aware(MountImageAction::new().mount_point("/mnt/node3")))
                .action(Action::platform_aware(ConfigureNetworkAction::new(network)))
                .action(Action::platform_aware(UnmountImageAction::new())),
        );

    workflow.run(&CancellationToken::new()).await?;

    let lines = mock.command_lines();
    let position = |wanted: &str| {
        lines
            .iter()
            .position(|l| l == wanted)
            .unwrap_or_else(|| panic!("{:?} not run: {:?}", wanted, lines))
    };
    let mapped = position("kpartx -av /work/node3.img");
    let mounted = position("mount /dev/mapper/loop7p2 /mnt/node3");
    let unmounted = position("umount /mnt/node3");
    let unmapped = position("kpartx -dv /work/node3.img");
    assert!(mapped < mounted && mounted < unmounted && unmounted < unmapped);

    // released once, by the unmount action
    assert_eq!(lines.iter().filter(|l| l.starts_with("umount")).count(), 1);

    let written: Vec<String> = mock
        .calls_for("sh")
        .iter()
        .filter_map(|c| c.args.get(3).cloned())
        .collect();
    assert!(written.contains(&"/mnt/node3/etc/hostname".to_string()), "{:?}", written);

    let store = workflow.store();
    assert!(!store.contains(keys::IMAGE_MOUNTS));
    assert_eq!(
        store.get::<String>(&keys::node(3, keys::NodeAttr::Ip))?,
        "192.168.1.3"
    );
    tools.close().await;
    Ok(())
}

#[tokio::test]
async fn test_mount_released_when_customization_fails() {
    let cache = TempDir::new().unwrap();
    let mock = Arc::new(MockExecutor::new());
    mock.respond("kpartx", KPARTX_OUTPUT);
    let tools = provider(&cache, LINUX, Some(mock.clone())).await;

    let log = Log::default();
    let workflow = Workflow::new("customize-fails")
        .with_tools(tools.clone())
        .stage(
            Stage::new("customize")
                .with_value(keys::IMAGE_WORKING, "/work/node1.img".to_string())
                .action(Action::platform_aware(MountImageAction::new().mount_point("/mnt/node1")))
                .action(Step::build("broken", &log, Outcome::Fail, false))
                .action(Action::platform_aware(UnmountImageAction::new())),
        );

    workflow.run(&CancellationToken::new()).await.unwrap_err();

    let lines = mock.command_lines();
    let tail: Vec<&str> = lines.iter().rev().take(2).map(String::as_str).collect();
    assert_eq!(tail, ["kpartx -dv /work/node1.img", "umount /mnt/node1"]);
    tools.close().await;
}

#[tokio::test]
async fn test_set_password_rewrites_shadow() -> Result<()> {
    use base64::Engine as _;

    let cache = TempDir::new().unwrap();
    let mock = Arc::new(MockExecutor::new());
    let shadow = "root:*:19000:0:99999:7:::\nubuntu:!:19000:0:99999:7:::\n";
    mock.respond("openssl", "$6$salt$hashed\n");
    mock.respond("base64", base64::engine::general_purpose::STANDARD.encode(shadow));
    let tools = provider(&cache, LINUX, Some(mock.clone())).await;

    let workflow = Workflow::new("password").with_tools(tools.clone()).stage(
        Stage::new("customize")
            .with_value(keys::IMAGE_MOUNTS, "/mnt/root".to_string())
            .action(Action::platform_aware(SetPasswordAction::new("ubuntu", "correct horse"))),
    );
    workflow.run(&CancellationToken::new()).await?;

    let openssl = mock.calls_for("openssl");
    assert_eq!(openssl[0].input_str().as_deref(), Some("correct horse"));
    assert!(!openssl[0].command_line().contains("correct horse"));

    let write = mock
        .calls_for("sh")
        .into_iter()
        .find(|c| c.args.get(3).map(String::as_str) == Some("/mnt/root/etc/shadow"))
        .expect("shadow written");
    assert_eq!(write.args.get(4).map(String::as_str), Some("640"));
    let content = write.input_str().unwrap();
    assert!(content.starts_with("root:*:19000:"));
    assert!(content.contains("\nubuntu:$6$salt$hashed:"));
    assert!(content.ends_with(":::\n"));
    tools.close().await;
    Ok(())
}

#[tokio::test]
async fn test_short_password_rejected() {
    let cache = TempDir::new().unwrap();
    let mock = Arc::new(MockExecutor::new());
    let tools = provider(&cache, LINUX, Some(mock.clone())).await;

    let workflow = Workflow::new("weak").with_tools(tools.clone()).stage(
        Stage::new("customize")
            .with_value(keys::IMAGE_MOUNTS, "/mnt/root".to_string())
            .action(Action::platform_aware(SetPasswordAction::new("ubuntu", "short"))),
    );
    let err = workflow.run(&CancellationToken::new()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
    assert!(mock.calls().is_empty());
    tools.close().await;
}

#[tokio::test]
async fn test_scripted_failure_surfaces_command_output() {
    let cache = TempDir::new().unwrap();
    let mock = Arc::new(MockExecutor::new());
    mock.push("kpartx", MockResponse::fail(1, "failed to stat() /work/missing.img"));
    let tools = provider(&cache, LINUX, Some(mock.clone())).await;

    let workflow = Workflow::new("missing-image").with_tools(tools.clone()).stage(
        Stage::new("customize")
            .with_value(keys::IMAGE_WORKING, "/work/missing.img".to_string())
            .action(Action::platform_aware(MountImageAction::new().mount_point("/mnt/x"))),
    );
    let err = workflow.run(&CancellationToken::new()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransportFailed);
    assert!(err.command_output().unwrap_or_default().contains("failed to stat"));
    // nothing was acquired, so nothing is released
    assert!(mock.command_lines().iter().all(|l| !l.starts_with("umount")));
    tools.close().await;
}

fn stage_names(workflow: &Workflow) -> Vec<&str> {
    workflow.stages().iter().map(|s| s.name()).collect()
}

#[tokio::test]
async fn test_deploy_builder_layout() -> Result<()> {
    let cache = TempDir::new().unwrap();
    let tools = provider(&cache, LINUX, Some(Arc::new(MockExecutor::new()))).await;
    let log = Log::default();
    let network = NetworkConfig::new("host-2", "10.0.0.12/24", "10.0.0.1", vec![]);

    let workflow = UbuntuDeployBuilder::new(2, "https://example.com/ubuntu-22.04-rk1.img.xz", network)
        .password("ubuntu", "long enough")
        .post_install_command("apt-get update")
        .hook(DeployHook::BeforeUnmount, Step::ok("extra-files", &log))
        .hook(DeployHook::AfterPostInstall, Step::ok("report", &log))
        .build(tools.clone())?;

    assert_eq!(workflow.name(), "ubuntu-deploy-node2");
    assert_eq!(
        stage_names(&workflow),
        ["prepare", "customize", "stage", "flash", "post-install"]
    );

    let customize = workflow.stages()[1].action_names();
    assert_eq!(
        customize,
        [
            "mount-image",
            "configure-network",
            "set-password",
            "extra-files",
            "unmount-image",
            "compress-image"
        ]
    );
    let post_install = workflow.stages()[4].action_names();
    assert_eq!(post_install.last().map(String::as_str), Some("report"));
    tools.close().await;
    Ok(())
}

#[tokio::test]
async fn test_deploy_builder_skip_flash() -> Result<()> {
    let cache = TempDir::new().unwrap();
    let tools = provider(&cache, LINUX, Some(Arc::new(MockExecutor::new()))).await;
    let network = NetworkConfig::new("host-4", "10.0.0.14/24", "10.0.0.1", vec![]);

    let builder = UbuntuDeployBuilder::new(4, "/images/base.img.xz", network).skip_flash(true);
    assert_eq!(builder.artifact_key(), "artifacts/ubuntu-22.04/node4-host-4.img.xz");
    let workflow = builder.build(tools.clone())?;
    assert_eq!(stage_names(&workflow), ["prepare", "customize"]);

    let network = NetworkConfig::new("host-5", "10.0.0.15/24", "10.0.0.1", vec![]);
    let err = UbuntuDeployBuilder::new(5, "/images/base.img.xz", network)
        .build(tools.clone())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
    tools.close().await;
    Ok(())
}
