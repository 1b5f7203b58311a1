//! End-to-end behavior across the scheduler, flow chains, and deployment.

use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stratus::deploy::{DeployConfig, LibModule, PlaybookFacade, PlaybookRequest};
use stratus::{Completion, CoreError, FlowChain, SchedulerConfig, SyncTaskScheduler, TaskSpec};
use stratus::core::FnFlow;
use stratus_test_utils::fixtures::ModuleFixture;
use stratus_test_utils::{init_test_tracing, FailingFlow, Journal, RecordingFlow};
use stratus_tests::HostRunner;

#[tokio::test]
async fn ten_synchronous_steps_complete_once() {
    init_test_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let steps = (0..10).map(|i| {
        let counter = counter.clone();
        Arc::new(FnFlow::new(format!("increment-{}", i), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })) as Arc<dyn stratus::Flow>
    });

    let done_count = done.clone();
    let error_count = errors.clone();
    let result = FlowChain::new("counter")
        .then_all(steps)
        .done(move |_| {
            done_count.fetch_add(1, Ordering::SeqCst);
        })
        .error(move |_, _| {
            error_count.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .await;

    assert!(result.is_ok());
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scheduled_chain_failure_reaches_completion() {
    init_test_tracing();
    let scheduler = SyncTaskScheduler::new(SchedulerConfig::default()).unwrap();
    let journal = Journal::new();

    let chain_journal = journal.clone();
    let task = TaskSpec::new("create-vm-42").body(async move {
        FlowChain::new("create-vm")
            .then(RecordingFlow::new("A", &chain_journal))
            .then(FailingFlow::new("B", &chain_journal, CoreError::external("no host")))
            .then(RecordingFlow::new("C", &chain_journal))
            .start()
            .await
            .map(|_| ())
    });

    let (completion, receiver) = Completion::channel("create-vm");
    scheduler.submit_async(task, completion).unwrap();

    let err = receiver.wait().await.unwrap_err();
    assert_eq!(err.root_cause(), &CoreError::external("no host"));
    journal.assert_entries(&["run:A", "run:B", "rollback:A"]);
}

fn runner() -> Arc<HostRunner> {
    HostRunner::new(Duration::from_millis(20))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_against_one_host_never_overlap() {
    init_test_tracing();
    let fixture = ModuleFixture::new("kvm", &[("kvm.yaml", "- hosts: all\n")]).unwrap();
    let runner = runner();
    let facade = PlaybookFacade::new(
        DeployConfig::under_root(&fixture.root_dir),
        SyncTaskScheduler::new(SchedulerConfig::default()).unwrap(),
        runner.clone(),
    );

    let request = || PlaybookRequest::new("host-A", "kvm.yaml", "/keys/id_rsa");
    let (first, second) = tokio::join!(
        facade.run_playbook(request()),
        facade.run_playbook(request())
    );

    assert!(first.is_ok() && second.is_ok());
    assert_eq!(runner.peak(), 1);
    runner
        .journal()
        .assert_entries(&["start:host-A", "end:host-A", "start:host-A", "end:host-A"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_against_different_hosts_may_overlap() {
    let fixture = ModuleFixture::new("kvm", &[("kvm.yaml", "- hosts: all\n")]).unwrap();
    let runner = runner();
    let facade = PlaybookFacade::new(
        DeployConfig::under_root(&fixture.root_dir),
        SyncTaskScheduler::new(SchedulerConfig::default()).unwrap(),
        runner.clone(),
    );

    let (a, b) = tokio::join!(
        facade.run_playbook(PlaybookRequest::new("host-A", "kvm.yaml", "/keys/id_rsa")),
        facade.run_playbook(PlaybookRequest::new("host-B", "kvm.yaml", "/keys/id_rsa"))
    );

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(runner.peak(), 2);
    assert_eq!(runner.journal().len(), 4);
}

#[tokio::test]
async fn init_deploys_library_module_once() {
    init_test_tracing();
    let fixture = ModuleFixture::new("stratuslib", &[("stratuslib.yaml", "- hosts: all\n")])
        .unwrap();
    let mut config = DeployConfig::under_root(&fixture.root_dir);
    config.lib_module = Some(LibModule {
        path: fixture.module_dir.clone(),
        playbook: "stratuslib.yaml".to_string(),
    });
    let facade = PlaybookFacade::new(
        config,
        SyncTaskScheduler::new(SchedulerConfig::default()).unwrap(),
        runner(),
    );

    let first = facade.init().await.unwrap().unwrap();
    assert!(first.deployed());
    let second = facade.init().await.unwrap().unwrap();
    assert!(!second.deployed());

    let deployer = facade.deployer();
    assert!(deployer.is_module_changed("stratuslib.yaml").await.unwrap());
    assert!(!deployer.is_module_changed("stratuslib.yaml").await.unwrap());
    assert!(fixture.root_dir.join("stratuslib.yaml").exists());
}
