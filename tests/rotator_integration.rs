use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use profile_rotator::config::Credentials;
use profile_rotator::error::Error;
use profile_rotator::events::{CycleOutcome, ExitReason, RotationState};
use profile_rotator::pool::{self, ImageCandidate};
use profile_rotator::remote::{
    IdentityConnector, IdentitySession, MirrorConnector, PhotoRef, RemoteError,
};
use profile_rotator::retention::RetentionPolicy;
use profile_rotator::selection::SelectionMode;
use profile_rotator::tasks::rotator::{self, Rotator, RotatorSettings, Sleeper, TokioSleeper};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Upload(PathBuf),
    List,
    Delete(Vec<i64>),
    Teardown,
}

#[derive(Default)]
struct FakeState {
    /// Oldest first.
    history: Vec<PhotoRef>,
    calls: Vec<Call>,
    last_id: i64,
    failing: HashSet<PathBuf>,
    panicking: HashSet<PathBuf>,
    fail_delete: bool,
    newest_first: bool,
}

#[derive(Clone, Default)]
struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    fn newest_first() -> Self {
        let session = Self::default();
        session.state.lock().unwrap().newest_first = true;
        session
    }

    fn fail_upload_of(&self, path: &str) {
        self.state.lock().unwrap().failing.insert(PathBuf::from(path));
    }

    fn panic_on_upload_of(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .panicking
            .insert(PathBuf::from(path));
    }

    fn fail_deletes(&self) {
        self.state.lock().unwrap().fail_delete = true;
    }

    fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn uploads(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Upload(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn history_ids(&self) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .history
            .iter()
            .map(|p| p.id)
            .collect()
    }
}

#[async_trait]
impl IdentitySession for FakeSession {
    async fn upload_and_assign(&self, image: &Path) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Upload(image.to_path_buf()));
        if state.panicking.contains(image) {
            drop(state);
            panic!("simulated crash uploading {}", image.display());
        }
        if state.failing.contains(image) {
            return Err(RemoteError::RateLimited(Duration::from_secs(30)));
        }
        state.last_id += 1;
        let id = state.last_id;
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        state.history.push(PhotoRef {
            id,
            access_hash: id * 7,
            file_reference: vec![id as u8],
            date: base + chrono::Duration::seconds(id),
        });
        Ok(())
    }

    async fn list_profile_photos(&self) -> Result<Vec<PhotoRef>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::List);
        let mut photos = state.history.clone();
        if state.newest_first {
            photos.reverse();
        }
        Ok(photos)
    }

    async fn delete_photos(&self, photos: &[PhotoRef]) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<i64> = photos.iter().map(|p| p.id).collect();
        state.calls.push(Call::Delete(ids.clone()));
        if state.fail_delete {
            return Err(RemoteError::Delete {
                count: ids.len(),
                reason: "FILE_REFERENCE_EXPIRED".into(),
            });
        }
        state.history.retain(|p| !ids.contains(&p.id));
        Ok(())
    }

    async fn teardown(&self) -> Result<(), RemoteError> {
        self.state.lock().unwrap().calls.push(Call::Teardown);
        Ok(())
    }
}

struct FakeConnector {
    session: FakeSession,
    fail_auth: bool,
}

#[async_trait]
impl IdentityConnector for FakeConnector {
    type Session = FakeSession;

    async fn authenticate(&self, _credentials: &Credentials) -> Result<FakeSession, RemoteError> {
        if self.fail_auth {
            return Err(RemoteError::Auth("AUTH_KEY_UNREGISTERED".into()));
        }
        Ok(self.session.clone())
    }
}

/// Returns immediately and cancels the loop once it has been asked to sleep `cancel_after` times.
#[derive(Clone)]
struct ScriptedSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
    cancel_after: usize,
    cancel: CancellationToken,
}

impl ScriptedSleeper {
    fn new(cancel_after: usize, cancel: &CancellationToken) -> Self {
        Self {
            slept: Arc::default(),
            cancel_after,
            cancel: cancel.clone(),
        }
    }

    fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for ScriptedSleeper {
    async fn sleep(&self, duration: Duration) {
        let count = {
            let mut slept = self.slept.lock().unwrap();
            slept.push(duration);
            slept.len()
        };
        if count >= self.cancel_after {
            self.cancel.cancel();
        }
        tokio::task::yield_now().await;
    }
}

fn pool_of(names: &[&str]) -> Vec<ImageCandidate> {
    names.iter().map(|n| ImageCandidate::new(*n)).collect()
}

fn settings(keep: Option<usize>) -> RotatorSettings {
    RotatorSettings {
        interval: INTERVAL,
        retention: keep.map(RetentionPolicy::new),
        selection: SelectionMode::Sequential,
        selection_seed: None,
        max_cycles: None,
    }
}

fn credentials() -> Credentials {
    Credentials {
        api_id: 12345,
        api_hash: "0123456789abcdef".into(),
        session: "me".into(),
    }
}

#[tokio::test]
async fn sequential_rotation_prunes_to_newest_photo() {
    let session = FakeSession::newest_first();
    let cancel = CancellationToken::new();
    let sleeper = ScriptedSleeper::new(4, &cancel);

    let mut rotator = Rotator::new(
        &session,
        pool_of(&["A", "B", "C"]),
        settings(Some(1)),
        sleeper.clone(),
    );
    let reason = rotator.run(cancel.clone()).await;

    assert_eq!(reason, ExitReason::Cancelled);
    assert_eq!(rotator.state(), RotationState::Terminated);
    assert_eq!(rotator.cycles(), 4);
    assert_eq!(
        session.uploads(),
        vec![
            PathBuf::from("A"),
            PathBuf::from("B"),
            PathBuf::from("C"),
            PathBuf::from("A")
        ]
    );
    assert_eq!(session.history_ids(), vec![4]);
    assert_eq!(sleeper.slept(), vec![INTERVAL; 4]);

    let calls = session.calls();
    assert_eq!(
        &calls[..5],
        &[
            Call::Upload(PathBuf::from("A")),
            Call::List,
            Call::Upload(PathBuf::from("B")),
            Call::List,
            Call::Delete(vec![1]),
        ],
        "a lone photo must not trigger a delete call; the next pass evicts only the older one"
    );
}

#[tokio::test]
async fn upload_failure_does_not_stop_rotation() {
    let session = FakeSession::default();
    session.fail_upload_of("B");
    let cancel = CancellationToken::new();

    let mut rotator = Rotator::new(
        &session,
        pool_of(&["A", "B", "C"]),
        settings(None),
        ScriptedSleeper::new(3, &cancel),
    );
    let reason = rotator.run(cancel).await;

    assert_eq!(reason, ExitReason::Cancelled);
    assert_eq!(
        session.uploads(),
        vec![PathBuf::from("A"), PathBuf::from("B"), PathBuf::from("C")]
    );
    assert_eq!(rotator.selector().cycle(), Some(3));
    assert_eq!(session.history_ids(), vec![1, 2]);
    assert!(
        !session.calls().contains(&Call::List),
        "retention disabled: no listing expected"
    );
}

#[tokio::test]
async fn run_cycle_reports_typed_outcomes() {
    let session = FakeSession::default();
    session.fail_upload_of("bad.jpg");
    let mut rotator = Rotator::new(
        &session,
        pool_of(&["bad.jpg", "good.jpg"]),
        settings(Some(1)),
        TokioSleeper,
    );

    match rotator.run_cycle().await {
        CycleOutcome::UploadFailed { image, error } => {
            assert_eq!(image, PathBuf::from("bad.jpg"));
            assert!(matches!(error, RemoteError::RateLimited(_)));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(rotator.state(), RotationState::Uploading);

    let outcome = rotator.run_cycle().await;
    assert!(outcome.is_success());
    assert!(matches!(
        outcome,
        CycleOutcome::Rotated { evicted: Some(0), .. }
    ));
    assert_eq!(rotator.state(), RotationState::Evicting);
}

#[tokio::test]
async fn empty_pool_exits_without_remote_calls() {
    let session = FakeSession::default();
    let cancel = CancellationToken::new();
    let sleeper = ScriptedSleeper::new(usize::MAX, &cancel);

    let mut rotator = Rotator::new(&session, Vec::new(), settings(Some(1)), sleeper.clone());
    let mut states = rotator.subscribe();
    let reason = rotator.run(cancel).await;

    assert_eq!(reason, ExitReason::EmptyPool);
    assert!(session.calls().is_empty());
    assert!(sleeper.slept().is_empty());
    assert_eq!(*states.borrow_and_update(), RotationState::Terminated);
}

#[tokio::test]
async fn session_is_released_after_empty_pool() {
    let session = FakeSession::default();
    let connector = FakeConnector {
        session: session.clone(),
        fail_auth: false,
    };

    let reason = rotator::run(
        &connector,
        &credentials(),
        Vec::new(),
        settings(Some(1)),
        TokioSleeper,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(reason, ExitReason::EmptyPool);
    assert_eq!(session.calls(), vec![Call::Teardown]);
}

#[tokio::test]
async fn session_is_released_after_cancellation() {
    let session = FakeSession::default();
    let connector = FakeConnector {
        session: session.clone(),
        fail_auth: false,
    };
    let cancel = CancellationToken::new();

    let reason = rotator::run(
        &connector,
        &credentials(),
        pool_of(&["A"]),
        settings(None),
        ScriptedSleeper::new(2, &cancel),
        cancel.clone(),
    )
    .await
    .unwrap();

    assert_eq!(reason, ExitReason::Cancelled);
    assert_eq!(
        session.calls(),
        vec![
            Call::Upload(PathBuf::from("A")),
            Call::Upload(PathBuf::from("A")),
            Call::Teardown
        ]
    );
}

#[tokio::test]
async fn authentication_failure_is_returned() {
    let session = FakeSession::default();
    let connector = FakeConnector {
        session: session.clone(),
        fail_auth: true,
    };

    let err = rotator::run(
        &connector,
        &credentials(),
        pool_of(&["A"]),
        settings(Some(1)),
        TokioSleeper,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Remote(RemoteError::Auth(_))), "got {err:?}");
    assert!(session.calls().is_empty());
}

#[tokio::test]
async fn panic_inside_cycle_is_contained() {
    let session = FakeSession::default();
    session.panic_on_upload_of("A");
    let cancel = CancellationToken::new();

    let mut rotator = Rotator::new(
        &session,
        pool_of(&["A", "B"]),
        settings(Some(1)),
        ScriptedSleeper::new(2, &cancel),
    );
    let reason = rotator.run(cancel).await;

    assert_eq!(reason, ExitReason::Cancelled);
    assert_eq!(rotator.cycles(), 2);
    assert_eq!(
        session.uploads(),
        vec![PathBuf::from("A"), PathBuf::from("B")]
    );
    assert_eq!(session.history_ids(), vec![1]);
}

#[tokio::test]
async fn eviction_failure_keeps_rotating() {
    let session = FakeSession::default();
    session.fail_deletes();
    let cancel = CancellationToken::new();

    let mut rotator = Rotator::new(
        &session,
        pool_of(&["A", "B", "C"]),
        settings(Some(1)),
        ScriptedSleeper::new(3, &cancel),
    );
    rotator.run(cancel).await;

    assert_eq!(session.uploads().len(), 3);
    assert_eq!(session.history_ids(), vec![1, 2, 3]);
    let deletes: Vec<Call> = session
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Delete(_)))
        .collect();
    assert_eq!(
        deletes,
        vec![Call::Delete(vec![1]), Call::Delete(vec![1, 2])]
    );
}

#[tokio::test]
async fn single_cycle_mode_completes_without_sleeping() {
    let session = FakeSession::default();
    let cancel = CancellationToken::new();
    let sleeper = ScriptedSleeper::new(usize::MAX, &cancel);
    let mut settings = settings(Some(1));
    settings.max_cycles = Some(1);

    let mut rotator = Rotator::new(&session, pool_of(&["A", "B"]), settings, sleeper.clone());
    let reason = rotator.run(cancel).await;

    assert_eq!(reason, ExitReason::Completed);
    assert_eq!(session.uploads(), vec![PathBuf::from("A")]);
    assert!(sleeper.slept().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_interrupts_sleep_promptly() {
    let session = FakeSession::default();
    let observer = session.clone();
    let cancel = CancellationToken::new();
    let mut long = settings(None);
    long.interval = Duration::from_secs(3600);

    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let mut rotator = Rotator::new(&session, pool_of(&["A"]), long, TokioSleeper);
            rotator.run(cancel).await
        }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while observer.uploads().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first upload never happened");

    cancel.cancel();
    let reason = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop did not stop promptly")
        .expect("rotator task panicked");
    assert_eq!(reason, ExitReason::Cancelled);
    assert_eq!(observer.uploads().len(), 1);
}

#[tokio::test]
async fn mirror_backend_end_to_end() {
    let tmp = tempdir().unwrap();
    let images = tmp.path().join("images");
    fs::create_dir_all(&images).unwrap();
    fs::write(images.join("01.jpg"), b"one").unwrap();
    fs::write(images.join("02.png"), b"two").unwrap();
    fs::write(images.join("03.webp"), b"three").unwrap();
    fs::write(images.join("readme.md"), b"skip").unwrap();

    let mirror_root = tmp.path().join("mirror");
    let connector = MirrorConnector::new(&mirror_root);
    let cancel = CancellationToken::new();

    let reason = rotator::run(
        &connector,
        &credentials(),
        pool::list_candidates(&images),
        settings(Some(1)),
        ScriptedSleeper::new(3, &cancel),
        cancel.clone(),
    )
    .await
    .unwrap();
    assert_eq!(reason, ExitReason::Cancelled);

    let session = connector.authenticate(&credentials()).await.unwrap();
    let remaining = session.list_profile_photos().await.unwrap();
    assert_eq!(remaining.iter().map(|p| p.id).collect::<Vec<_>>(), vec![3]);

    let dir = mirror_root.join("me");
    assert_eq!(fs::read(dir.join("current.webp")).unwrap(), b"three");
    assert!(dir.join("photo-3.webp").exists());
    assert!(!dir.join("photo-1.jpg").exists());
    assert!(!dir.join("photo-2.png").exists());
    assert!(!dir.join("current.png").exists());
}

#[tokio::test]
async fn second_prune_pass_makes_no_delete_call() {
    let session = FakeSession::newest_first();
    for name in ["A", "B", "C", "D"] {
        session.upload_and_assign(Path::new(name)).await.unwrap();
    }
    let policy = RetentionPolicy::new(2);

    assert_eq!(policy.prune(&session).await.unwrap(), 2);
    assert_eq!(session.history_ids(), vec![3, 4]);

    assert_eq!(policy.prune(&session).await.unwrap(), 0);
    let deletes: Vec<Call> = session
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Delete(_)))
        .collect();
    assert_eq!(deletes, vec![Call::Delete(vec![1, 2])]);
    assert_eq!(session.history_ids(), vec![3, 4]);
}

#[tokio::test]
async fn mirror_keeps_new_upload_when_history_is_dated_in_the_future() {
    let tmp = tempdir().unwrap();
    let image = tmp.path().join("a.jpg");
    fs::write(&image, b"fresh").unwrap();
    let connector = MirrorConnector::new(tmp.path().join("mirror"));

    let session = connector.authenticate(&credentials()).await.unwrap();
    session.upload_and_assign(&image).await.unwrap();
    session.teardown().await.unwrap();

    // Existing entry stamped far ahead of the local clock.
    let manifest_path = session.dir().join("history.json");
    let mut manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(&manifest_path).unwrap()).unwrap();
    manifest["photos"][0]["photo"]["date"] = "2099-01-01T00:00:00Z".into();
    fs::write(&manifest_path, serde_json::to_vec(&manifest).unwrap()).unwrap();

    let session = connector.authenticate(&credentials()).await.unwrap();
    let mut rotator = Rotator::new(
        &session,
        vec![ImageCandidate::new(image.clone())],
        settings(Some(1)),
        TokioSleeper,
    );
    let outcome = rotator.run_cycle().await;
    assert!(
        matches!(outcome, CycleOutcome::Rotated { evicted: Some(1), .. }),
        "got {outcome:?}"
    );

    let remaining = session.list_profile_photos().await.unwrap();
    assert_eq!(remaining.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2]);
    let future = DateTime::parse_from_rfc3339("2099-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    assert!(remaining[0].date >= future);

    let current = session.current_photo().await.expect("profile photo assigned");
    assert_eq!(fs::read(current).unwrap(), b"fresh");
}
