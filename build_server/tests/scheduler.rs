mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use flate2::read::GzDecoder;

use shipyard_build_server::error::BuildError;
use shipyard_build_server::events::{BuildEvent, QueueEvent};
use shipyard_build_server::models::{BuildStatus, DeploymentStatus, JobState, StageStatus};
use shipyard_build_server::services::artifact_service::ArtifactPackager;
use shipyard_build_server::services::retention::RetentionSweeper;
use shipyard_build_server::services::script_generator::{self, StepLimits};
use shipyard_build_server::store::{BuildStore, JobQueue};

use common::{react_request, static_request, Behavior, FakeRuntime, Harness, Settings};

fn source_tree(root: &Path) -> std::path::PathBuf {
    let source = root.join("site");
    std::fs::create_dir_all(source.join("css")).unwrap();
    std::fs::write(source.join("index.html"), "<h1>Hello</h1>\n").unwrap();
    std::fs::write(source.join("css/site.css"), "body { margin: 0 }\n").unwrap();
    source
}

/// Relative path -> contents of every file in a tar.gz.
fn archive_files(path: &str) -> BTreeMap<String, Vec<u8>> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut files = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .unwrap()
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut contents).unwrap();
        files.insert(name, contents);
    }
    files
}

async fn wait_live(harness: &Harness, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness.runtime.live() != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} live containers, expected {count}",
            harness.runtime.live()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn short_lease() -> Settings {
    Settings {
        concurrency: 1,
        claim_lease: Duration::from_millis(300),
        ..Default::default()
    }
}

// ── Scenarios ──

#[tokio::test]
async fn static_site_is_packaged_unmodified() {
    let harness = Harness::started(FakeRuntime::new(Behavior::Succeed), Settings::default());
    let source = source_tree(harness.root());

    let queued = harness
        .scheduler
        .enqueue(static_request("site", &source))
        .await
        .unwrap();
    assert_eq!(queued.status, "queued");

    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Success);
    assert_eq!(view.progress, 100);
    assert_eq!(view.artifacts.len(), 1);
    assert!(view.error.is_none());

    let files = archive_files(&view.artifacts[0].path);
    assert_eq!(files.len(), 2);
    assert_eq!(files["index.html"], b"<h1>Hello</h1>\n");
    assert_eq!(files["css/site.css"], b"body { margin: 0 }\n");

    // Local sources are mounted, never fetched.
    let spec = &harness.runtime.created()[0];
    let mounted = std::fs::canonicalize(&source).unwrap();
    assert_eq!(spec.source.as_deref(), Some(mounted.as_path()));

    let deployment = harness
        .wait_deployment("dep-site", DeploymentStatus::Deploying)
        .await;
    assert_eq!(deployment.artifact_path.as_deref(), Some(view.artifacts[0].path.as_str()));
}

#[tokio::test]
async fn react_build_runs_npm_and_copies_build_dir() {
    let request = react_request("web");
    let script = script_generator::generate(&request, StepLimits::default()).unwrap();
    let clone = script.find("git clone").unwrap();
    let install = script.find("npm install").unwrap();
    let build = script.find("npm run build").unwrap();
    assert!(clone < install && install < build);
    assert!(script.contains("cp -a 'build'/. /workspace/output/"));

    let harness = Harness::started(FakeRuntime::new(Behavior::Succeed), Settings::default());
    let queued = harness.scheduler.enqueue(request).await.unwrap();
    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Success);

    let spec = &harness.runtime.created()[0];
    assert!(spec.image.starts_with("node:18"));
    let stored = harness.build(&queued.build_id).await.request;
    assert_eq!(
        script_generator::generate(&stored, StepLimits::default()).unwrap(),
        script
    );
}

#[tokio::test]
async fn failing_script_is_retried_then_failed() {
    let settings = Settings {
        max_retries: 2,
        ..Default::default()
    };
    let harness = Harness::started(FakeRuntime::new(Behavior::Exit(1)), settings);
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();

    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Failed);
    assert_eq!(view.retry_count, 2);
    let error = view.error.unwrap();
    assert_eq!(error.reason, "execution");
    assert_eq!(error.exit_code, Some(1));
    assert!(!error.message.is_empty());

    // First attempt plus two retries, each with its own stage and log.
    assert_eq!(harness.runtime.created_for(&queued.build_id), 3);
    let build = harness.build(&queued.build_id).await;
    assert_eq!(build.stages.len(), 3);
    for (n, stage) in build.stages.iter().enumerate() {
        assert_eq!(stage.attempt, n as u32 + 1);
        assert_eq!(stage.status, StageStatus::Failed);
        assert!(stage.logs.iter().any(|l| l.contains("npm ERR!")));
    }
    let logs = harness.scheduler.get_build_logs(&queued.build_id).await.unwrap();
    assert!(logs.exists);
    assert_eq!(logs.logs.matches("npm ERR! missing script").count(), 3);

    let job = JobQueue::get(harness.store.as_ref(), &queued.build_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
}

#[tokio::test]
async fn cancelling_pending_build_never_creates_a_container() {
    let harness = Harness::new(FakeRuntime::new(Behavior::Succeed), Settings::default());
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();
    assert_eq!(queued.queue_position, 1);

    harness.scheduler.cancel(&queued.build_id).await.unwrap();
    harness.scheduler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Cancelled);
    assert!(harness.runtime.created().is_empty());

    let again = harness.scheduler.cancel(&queued.build_id).await;
    assert!(matches!(again, Err(BuildError::AlreadyTerminal(_))));
}

#[tokio::test]
async fn timed_out_run_fails_and_tears_down() {
    let settings = Settings {
        max_retries: 0,
        run_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let harness = Harness::started(FakeRuntime::new(Behavior::Hang), settings);
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();

    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Failed);
    assert_eq!(view.error.unwrap().reason, "timeout");

    let created: Vec<String> = harness.runtime.created().into_iter().map(|s| s.name).collect();
    assert_eq!(created.len(), 1);
    assert_eq!(harness.runtime.killed(), created);
    assert_eq!(harness.runtime.removed(), created);
    assert_eq!(harness.runtime.live(), 0);
}

#[tokio::test]
async fn rebuild_links_to_original_and_leaves_it_untouched() {
    let settings = Settings {
        max_retries: 0,
        ..Default::default()
    };
    let harness = Harness::started(FakeRuntime::new(Behavior::Exit(2)), settings);
    let original = harness.scheduler.enqueue(react_request("web")).await.unwrap();
    assert_eq!(
        harness.wait_terminal(&original.build_id).await.status,
        BuildStatus::Failed
    );
    let before = harness.build(&original.build_id).await;

    let rebuilt = harness.scheduler.rebuild(&original.build_id).await.unwrap();
    assert_ne!(rebuilt.build_id, original.build_id);
    let view = harness.wait_terminal(&rebuilt.build_id).await;
    assert_eq!(view.rebuild_from.as_deref(), Some(original.build_id.as_str()));

    let after = harness.build(&original.build_id).await;
    assert_eq!(before, after);

    let missing = harness.scheduler.rebuild("no-such-build").await;
    assert!(matches!(missing, Err(BuildError::NotFound(_))));
}

// ── Properties ──

#[tokio::test]
async fn running_build_can_be_cancelled() {
    let harness = Harness::started(FakeRuntime::new(Behavior::Hang), Settings::default());
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness.runtime.live() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "container never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    harness.scheduler.cancel(&queued.build_id).await.unwrap();

    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Cancelled);
    assert_eq!(harness.runtime.created_for(&queued.build_id), 1);
    assert_eq!(harness.runtime.live(), 0);
    assert_eq!(harness.runtime.removed().len(), 1);
}

#[tokio::test]
async fn statuses_only_move_forward() {
    let harness = Harness::started(FakeRuntime::new(Behavior::FailFirst(1)), Settings::default());
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();
    assert_eq!(
        harness.wait_terminal(&queued.build_id).await.status,
        BuildStatus::Success
    );

    let rank = |s: BuildStatus| match s {
        BuildStatus::Pending => 0,
        BuildStatus::Running => 1,
        _ => 2,
    };
    let history = harness.journal.history(&queued.build_id);
    assert_eq!(history.first(), Some(&BuildStatus::Pending));
    assert_eq!(history.last(), Some(&BuildStatus::Success));
    assert!(history.windows(2).all(|w| rank(w[0]) <= rank(w[1])));
    assert_eq!(history.iter().filter(|s| s.is_terminal()).count(), 1);
}

#[tokio::test]
async fn each_build_runs_in_one_environment_at_a_time() {
    let settings = Settings {
        concurrency: 4,
        max_retries: 3,
        ..Default::default()
    };
    let harness = Harness::started(FakeRuntime::new(Behavior::FailFirst(2)), settings);

    let mut ids = Vec::new();
    for n in 0..3 {
        let queued = harness
            .scheduler
            .enqueue(react_request(&format!("web-{n}")))
            .await
            .unwrap();
        ids.push(queued.build_id);
    }
    for id in &ids {
        assert_eq!(harness.wait_terminal(id).await.status, BuildStatus::Success);
        assert_eq!(harness.runtime.created_for(id), 3);
        assert_eq!(harness.runtime.peak_for(id), 1);
    }
}

#[tokio::test]
async fn progress_never_goes_backwards_across_retries() {
    let harness = Harness::started(FakeRuntime::new(Behavior::FailFirst(1)), Settings::default());
    let mut events = harness.scheduler.subscribe();
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();

    let mut seen = Vec::new();
    let collect = async {
        loop {
            match events.recv().await.unwrap() {
                QueueEvent::Progress { build_id, progress } if build_id == queued.build_id => {
                    seen.push(progress)
                }
                QueueEvent::Completed { build_id } if build_id == queued.build_id => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(15), collect)
        .await
        .unwrap();

    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&100));
}

#[tokio::test]
async fn broken_cache_root_does_not_change_outcome() {
    let scratch = tempfile::tempdir().unwrap();
    let not_a_dir = scratch.path().join("cache");
    std::fs::write(&not_a_dir, "occupied").unwrap();

    let settings = Settings {
        cache_root: Some(not_a_dir),
        ..Default::default()
    };
    let harness = Harness::started(FakeRuntime::new(Behavior::Succeed), settings);
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();

    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Success);
    assert_eq!(view.retry_count, 0);
    let build = harness.build(&queued.build_id).await;
    assert_eq!(build.cache.hits, 0);
}

#[tokio::test]
async fn dependency_cache_is_shared_by_builds_of_a_project() {
    let harness = Harness::started(FakeRuntime::new(Behavior::Succeed), Settings::default());

    let first = harness.scheduler.enqueue(react_request("web")).await.unwrap();
    harness.wait_terminal(&first.build_id).await;
    let second = harness.scheduler.enqueue(react_request("web")).await.unwrap();
    harness.wait_terminal(&second.build_id).await;
    let other = harness.scheduler.enqueue(react_request("admin")).await.unwrap();
    harness.wait_terminal(&other.build_id).await;

    assert_eq!(harness.runtime.cache_seen(), vec![false, true, false]);
    let second = harness.build(&second.build_id).await;
    assert_eq!(second.cache.hits, 1);
    assert_eq!(second.cache.key.as_deref(), Some("web:node"));
}

#[tokio::test]
async fn expired_builds_are_swept_with_their_artifacts() {
    let harness = Harness::started(FakeRuntime::new(Behavior::Succeed), Settings::default());
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();
    let view = harness.wait_terminal(&queued.build_id).await;
    let artifact = view.artifacts[0].path.clone();
    assert!(Path::new(&artifact).exists());

    let sweeper = RetentionSweeper::new(
        harness.journal.clone(),
        harness.store.clone(),
        ArtifactPackager::new(&harness.artifact_root),
        chrono::Duration::days(7),
    );

    let untouched = sweeper.sweep(Utc::now()).await.unwrap();
    assert_eq!(untouched.swept, 0);
    assert!(Path::new(&artifact).exists());

    let report = sweeper
        .sweep(Utc::now() + chrono::Duration::days(8))
        .await
        .unwrap();
    assert_eq!(report.swept, 1);
    assert!(!Path::new(&artifact).exists());
    assert!(harness
        .scheduler
        .get_build_status(&queued.build_id)
        .await
        .unwrap()
        .is_none());
    let logs = harness.scheduler.get_build_logs(&queued.build_id).await.unwrap();
    assert!(!logs.exists);
}

#[tokio::test]
async fn invalid_configuration_is_rejected_at_enqueue() {
    let harness = Harness::new(FakeRuntime::new(Behavior::Succeed), Settings::default());
    let mut request = react_request("web");
    request.project_type = shipyard_build_server::models::ProjectType::Unrecognized {
        language: Some("cobol".into()),
    };

    let result = harness.scheduler.enqueue(request).await;
    assert!(matches!(result, Err(BuildError::Configuration(_))));
    assert!(harness.scheduler.list_builds("web", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn local_repository_outside_the_mirror_root_is_rejected() {
    let harness = Harness::started(FakeRuntime::new(Behavior::Succeed), Settings::default());
    let elsewhere = tempfile::tempdir().unwrap();
    let source = source_tree(elsewhere.path());

    let result = harness.scheduler.enqueue(static_request("site", &source)).await;
    assert!(matches!(result, Err(BuildError::Configuration(_))));
    assert!(harness.scheduler.list_builds("site", 10).await.unwrap().is_empty());
    assert!(harness.runtime.created().is_empty());
}

#[tokio::test]
async fn similar_project_ids_do_not_share_a_cache() {
    let harness = Harness::started(FakeRuntime::new(Behavior::Succeed), Settings::default());

    for project in ["acme/web", "acme_web", "acme/web"] {
        let queued = harness.scheduler.enqueue(react_request(project)).await.unwrap();
        let view = harness.wait_terminal(&queued.build_id).await;
        assert_eq!(view.status, BuildStatus::Success);
    }
    assert_eq!(harness.runtime.cache_seen(), vec![false, false, true]);
}

// ── Several engines on one job table ──

#[tokio::test]
async fn second_engine_leaves_live_claims_alone() {
    let harness = Harness::started(FakeRuntime::new(Behavior::Hang), short_lease());
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();
    wait_live(&harness, 1).await;

    let peer = harness.peer(short_lease());
    assert_eq!(peer.requeue_expired().await.unwrap(), 0);
    peer.start();
    // Several leases pass while the first engine keeps renewing its claim.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(harness.runtime.created_for(&queued.build_id), 1);
    assert_eq!(harness.runtime.peak_for(&queued.build_id), 1);
    let job = JobQueue::get(harness.store.as_ref(), &queued.build_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Active);
    assert_eq!(job.attempts, 1);

    harness.scheduler.cancel(&queued.build_id).await.unwrap();
    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Cancelled);
    peer.shutdown(Duration::from_secs(2)).await;
    harness.scheduler.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn lapsed_claim_is_picked_up_and_its_stage_closed() {
    let settings = Settings {
        claim_lease: Duration::from_millis(200),
        ..Default::default()
    };
    let harness = Harness::new(FakeRuntime::new(Behavior::Succeed), settings);
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();

    // A worker of an engine that then died claimed the job and started attempt 1.
    let job = harness.store.claim("gone-host-0").await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    let mut build = harness.build(&queued.build_id).await;
    BuildEvent::AttemptStarted { attempt: 1 }
        .apply(&mut build, Utc::now())
        .unwrap();
    BuildStore::save(harness.store.as_ref(), &build).await.unwrap();

    harness.scheduler.start();
    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Success);

    let build = harness.build(&queued.build_id).await;
    assert_eq!(build.stages.len(), 2);
    assert_eq!(build.stages[0].attempt, 1);
    assert_eq!(build.stages[0].status, StageStatus::Failed);
    assert!(build.stages[0].logs[0].contains("interrupted"));
    assert_eq!(build.stages[1].attempt, 2);
    assert_eq!(build.stages[1].status, StageStatus::Success);
    assert_eq!(harness.runtime.created_for(&queued.build_id), 1);

    let job = JobQueue::get(harness.store.as_ref(), &queued.build_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn cancel_from_another_engine_stops_the_container() {
    let harness = Harness::started(FakeRuntime::new(Behavior::Hang), short_lease());
    let queued = harness.scheduler.enqueue(react_request("web")).await.unwrap();
    wait_live(&harness, 1).await;

    // The peer has no handle on the attempt: it only sees a claimed job.
    let peer = harness.peer(short_lease());
    peer.cancel(&queued.build_id).await.unwrap();
    let view = harness.wait_terminal(&queued.build_id).await;
    assert_eq!(view.status, BuildStatus::Cancelled);

    wait_live(&harness, 0).await;
    assert_eq!(harness.runtime.killed().len(), 1);
    let created = harness.runtime.created().len();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness.runtime.removed().len() < created {
        assert!(tokio::time::Instant::now() < deadline, "container never removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let build = harness.build(&queued.build_id).await;
    assert_eq!(build.status, BuildStatus::Cancelled);
    let job = JobQueue::get(harness.store.as_ref(), &queued.build_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Cancelled);
}
