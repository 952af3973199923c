//! Shadow tree watching
//!
//! This crate keeps a [`shadow_core::Node`] tree in step with a directory on
//! disk and publishes one [`Transaction`] per applied change:
//! - Non-recursive watches on every mirrored directory
//! - Debounced coalescing of raw notifications into semantic events
//! - A single mutation lock over the tree and the watch set
//! - Bounded output streams with a publish timeout

pub mod config;
pub mod debounce;
pub mod error;
pub mod event;
mod handler;
pub mod source;
mod tasks;

pub use config::{DispatchMode, WatcherConfig};
pub use error::{Result, WatcherError};
pub use event::{Event, EventKind, ExtraPayload, RawNotification, RawOp, Transaction};
pub use source::{ManualHandle, ManualSource, NotificationSource, NotifySource, SourceEvent};

use handler::State;
use parking_lot::Mutex;
use shadow_core::{Blake3Checksum, Checksum, Node, RelativePath, SourcePath};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasks::{Outputs, Shared};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle to a running watcher
///
/// Dropping the handle closes the watcher.
pub struct TreeWatcher<S: NotificationSource> {
    shared: Arc<Shared<S>>,
    root: SourcePath,
    outputs: Mutex<Option<Outputs>>,
    events: Option<mpsc::Receiver<Transaction>>,
    errors: Option<mpsc::Receiver<WatcherError>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TreeWatcher<NotifySource> {
    /// Watch the directory at `root` with the platform notification source
    ///
    /// Returns the watcher and the transaction for the initial population
    /// of the tree.
    pub fn new_path_watcher(root: impl AsRef<Path>, config: WatcherConfig) -> Result<(Self, Transaction)> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(shadow_core::Error::NotDirectory(root.to_path_buf()).into());
        }
        let root = std::fs::canonicalize(root)
            .map_err(|_| shadow_core::Error::PathDoesNotExist(root.to_path_buf()))?;

        let (source, notifications) = NotifySource::new()?;
        let checksum = Arc::new(Blake3Checksum::new(config.mmap_threshold_bytes));
        Self::start(SourcePath::fs(root), source, notifications, checksum, config)
    }
}

impl<S: NotificationSource> TreeWatcher<S> {
    /// Populate the tree under `root` and start the background tasks
    ///
    /// Population runs synchronously on the calling thread and every
    /// discovered directory is registered with `source`. Any failure,
    /// registration included, aborts startup before tasks are spawned.
    /// Must be called from within a tokio runtime.
    pub fn start(
        root: SourcePath,
        mut source: S,
        notifications: mpsc::UnboundedReceiver<SourceEvent>,
        checksum: Arc<dyn Checksum>,
        config: WatcherConfig,
    ) -> Result<(Self, Transaction)> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| WatcherError::NoRuntime)?;

        if !root.is_dir() {
            source.close();
            return Err(shadow_core::Error::NotDirectory(root.as_path().to_path_buf()).into());
        }

        let name = root.name();
        if name.is_empty() {
            source.close();
            return Err(shadow_core::Error::UnnamedRoot(root.as_path().to_path_buf()).into());
        }

        let base = root.parent();
        let mut state = State::new(Node::root(name), source);
        let initial = match state.apply(&base, checksum.as_ref(), Event::create(root.clone())) {
            Ok(applied) => applied,
            Err(e) => {
                state.source.close();
                return Err(e);
            }
        };
        if let Some(e) = initial.side_errors.into_iter().next() {
            state.source.close();
            return Err(e);
        }
        info!(
            root = %root,
            nodes = state.tree.node_count(),
            directories = state.watched.len(),
            "Tree watcher started"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            base,
            checksum,
            debouncer: debounce::Debouncer::new(),
            mode: config.mode,
            drain_gate: tokio::sync::Mutex::new(()),
        });

        let (events_tx, events_rx) = mpsc::channel(config.output_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(config.output_capacity);
        let outputs = Outputs::new(events_tx, errors_tx, config.publish_timeout());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut handles = vec![runtime.spawn(tasks::run_intake(
            Arc::clone(&shared),
            notifications,
            outputs.clone(),
            shutdown_rx.clone(),
        ))];
        if config.mode == DispatchMode::Debounced {
            handles.push(runtime.spawn(tasks::run_drain(
                Arc::clone(&shared),
                outputs.clone(),
                config.drain_interval(),
                shutdown_rx,
            )));
        }

        let watcher = Self {
            shared,
            root,
            outputs: Mutex::new(Some(outputs)),
            events: Some(events_rx),
            errors: Some(errors_rx),
            shutdown,
            tasks: handles,
        };
        Ok((watcher, initial.transaction))
    }

    /// Stream of applied transactions; `None` once taken
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Transaction>> {
        self.events.take()
    }

    /// Stream of failed events and source errors; `None` once taken
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<WatcherError>> {
        self.errors.take()
    }

    /// Apply an event directly, bypassing the debouncer
    ///
    /// Blocks on the mutation lock. The transaction is returned rather than
    /// published; watch registration failures go to the errors stream.
    pub fn handle(&self, event: Event) -> Result<Transaction> {
        let outputs = self.outputs.lock().clone().ok_or(WatcherError::Closed)?;
        let applied = self.shared.apply(event)?;
        for e in applied.side_errors {
            outputs.offer_error(e);
        }
        Ok(applied.transaction)
    }

    /// Apply whatever is pending now instead of waiting for the next tick
    ///
    /// Returns the number of coalesced events applied or rejected.
    pub async fn flush(&self) -> usize {
        let outputs = self.outputs.lock().clone();
        match outputs {
            Some(outputs) => tasks::drain_and_publish(&self.shared, &outputs).await,
            None => 0,
        }
    }

    /// Replace the tree wholesale, returning the previous one
    ///
    /// The watch set is left alone; re-registering directories to match the
    /// restored tree is up to the caller.
    pub fn restore(&self, tree: Node) -> Node {
        let mut state = self.shared.state.lock();
        if tree.name != state.tree.name {
            warn!(
                "Restored tree root {} does not match watched root {}",
                tree.name, state.tree.name
            );
        }
        std::mem::replace(&mut state.tree, tree)
    }

    /// Copy of the current tree
    pub fn tree(&self) -> Node {
        self.shared.state.lock().tree.clone()
    }

    pub fn search(&self, path: &RelativePath) -> Option<Node> {
        self.shared.state.lock().tree.search(path).cloned()
    }

    /// Relative path of `path` as the tree addresses it
    pub fn relative(&self, path: &SourcePath) -> Result<RelativePath> {
        Ok(path.exclude_prefix(&self.shared.base)?)
    }

    pub fn watched_directories(&self) -> BTreeSet<PathBuf> {
        self.shared.state.lock().watched.clone()
    }

    /// Raw notifications queued for the next drain
    pub fn pending(&self) -> usize {
        self.shared.debouncer.pending_count()
    }

    pub fn root(&self) -> &SourcePath {
        &self.root
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop the source and the background tasks
    ///
    /// Idempotent. Both output streams end once the tasks have exited.
    /// Notifications still pending are discarded.
    pub fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.outputs.lock().take();
        let mut state = self.shared.state.lock();
        state.source.close();
        state.watched.clear();
        info!(root = %self.root, "Tree watcher closed");
    }

    /// Close and wait for the background tasks to exit
    pub async fn shutdown(mut self) {
        self.close();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Watcher task ended abnormally: {}", e);
            }
        }
    }
}

impl<S: NotificationSource> Drop for TreeWatcher<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Long enough that only `flush` drains during a test
    fn manual_config() -> WatcherConfig {
        WatcherConfig {
            drain_interval_ms: 600_000,
            ..WatcherConfig::default()
        }
    }

    struct Fixture {
        temp_dir: TempDir,
        watcher: TreeWatcher<ManualSource>,
        handle: ManualHandle,
        events: mpsc::Receiver<Transaction>,
        errors: mpsc::Receiver<WatcherError>,
        initial: Transaction,
    }

    impl Fixture {
        fn start(config: WatcherConfig, setup: impl FnOnce(&Path)) -> Self {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path().join("data");
            fs::create_dir(&root).unwrap();
            setup(&root);

            let (source, handle, notifications) = ManualSource::new();
            let (mut watcher, initial) = TreeWatcher::start(
                SourcePath::fs(&root),
                source,
                notifications,
                Arc::new(Blake3Checksum::default()),
                config,
            )
            .unwrap();
            let events = watcher.take_events().unwrap();
            let errors = watcher.take_errors().unwrap();
            Self {
                temp_dir,
                watcher,
                handle,
                events,
                errors,
                initial,
            }
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.temp_dir.path().join(relative)
        }

        fn notify(&self, op: RawOp, relative: &str) {
            assert!(self.handle.notify(op, SourcePath::fs(self.path(relative))));
        }

        async fn wait_pending(&self, count: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.watcher.pending() < count {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("notifications never reached the debouncer");
        }

        async fn next_event(&mut self) -> Transaction {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for a transaction")
                .expect("events stream ended")
        }

        async fn next_error(&mut self) -> WatcherError {
            tokio::time::timeout(Duration::from_secs(5), self.errors.recv())
                .await
                .expect("timed out waiting for an error")
                .expect("errors stream ended")
        }

        fn checksum_of(&self, relative: &str) -> String {
            shadow_core::hash::hash_file(&self.path(relative))
                .unwrap()
                .to_hex()
        }
    }

    fn rel(path: &str) -> RelativePath {
        RelativePath::parse(path)
    }

    #[tokio::test]
    async fn test_initial_population() {
        let fx = Fixture::start(manual_config(), |root| {
            fs::create_dir_all(root.join("a/b")).unwrap();
            fs::write(root.join("a/f.txt"), b"hi").unwrap();
        });

        assert_eq!(fx.initial.kind, EventKind::Create);
        assert_eq!(fx.initial.path, rel("data"));
        assert_eq!(fx.initial.node.node_count(), 4);
        assert_eq!(fx.watcher.watched_directories().len(), 3);
        assert_eq!(fx.handle.watched(), fx.watcher.watched_directories());
    }

    #[tokio::test]
    async fn test_end_to_end_across_drains() {
        let mut fx = Fixture::start(manual_config(), |_| {});

        fs::create_dir(fx.path("data/a")).unwrap();
        fx.notify(RawOp::Create, "data/a");
        fx.wait_pending(1).await;
        fx.watcher.flush().await;
        let created = fx.next_event().await;
        assert_eq!((created.kind, created.path), (EventKind::Create, rel("data/a")));
        assert!(fx.handle.watched().contains(&fx.path("data/a")));

        fs::write(fx.path("data/a/f.txt"), b"first").unwrap();
        let c1 = fx.checksum_of("data/a/f.txt");
        fx.notify(RawOp::Create, "data/a/f.txt");
        fx.wait_pending(1).await;
        fx.watcher.flush().await;
        let file = fx.next_event().await;
        assert_eq!(file.kind, EventKind::Create);
        assert_eq!(file.node.meta.checksum, c1);

        fs::write(fx.path("data/a/f.txt"), b"second").unwrap();
        let c2 = fx.checksum_of("data/a/f.txt");
        fx.notify(RawOp::Write, "data/a/f.txt");
        fx.wait_pending(1).await;
        fx.watcher.flush().await;
        let written = fx.next_event().await;
        assert_eq!(written.kind, EventKind::Write);
        assert_eq!(written.node.meta.checksum, c2);

        fs::remove_dir_all(fx.path("data/a")).unwrap();
        fx.notify(RawOp::Remove, "data/a/f.txt");
        fx.notify(RawOp::Remove, "data/a");
        fx.wait_pending(2).await;
        fx.watcher.flush().await;
        let removed = fx.next_event().await;
        assert_eq!((removed.kind, removed.path), (EventKind::Remove, rel("data/a")));

        assert!(fx.watcher.search(&rel("data/a")).is_none());
        assert!(!fx.handle.watched().contains(&fx.path("data/a")));
        assert!(!fx.watcher.watched_directories().contains(&fx.path("data/a")));
        assert!(fx.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transient_directory_within_one_drain() {
        let mut fx = Fixture::start(manual_config(), |_| {});

        fs::create_dir(fx.path("data/a")).unwrap();
        fs::write(fx.path("data/a/f.txt"), b"x").unwrap();
        fx.notify(RawOp::Create, "data/a");
        fx.notify(RawOp::Create, "data/a/f.txt");
        fx.notify(RawOp::Write, "data/a/f.txt");
        fs::remove_dir_all(fx.path("data/a")).unwrap();
        fx.notify(RawOp::Remove, "data/a");
        fx.wait_pending(4).await;

        assert_eq!(fx.watcher.flush().await, 0);
        assert!(fx.events.try_recv().is_err());
        assert!(fx.errors.try_recv().is_err());
        assert!(fx.watcher.search(&rel("data/a")).is_none());
    }

    #[tokio::test]
    async fn test_new_directory_and_file_within_one_drain() {
        let mut fx = Fixture::start(manual_config(), |_| {});

        fs::create_dir(fx.path("data/a")).unwrap();
        fx.notify(RawOp::Create, "data/a");
        fs::write(fx.path("data/a/f.txt"), b"content").unwrap();
        fx.notify(RawOp::Create, "data/a/f.txt");
        fx.notify(RawOp::Write, "data/a/f.txt");
        fx.wait_pending(3).await;

        assert_eq!(fx.watcher.flush().await, 2);
        let dir = fx.next_event().await;
        assert_eq!((dir.kind, dir.path), (EventKind::Create, rel("data/a")));
        let file = fx.next_event().await;
        assert_eq!((file.kind, file.path), (EventKind::Create, rel("data/a/f.txt")));
        assert_eq!(file.node.meta.checksum, fx.checksum_of("data/a/f.txt"));
        assert!(fx.errors.try_recv().is_err());
        assert!(fx.handle.watched().contains(&fx.path("data/a")));
    }

    #[tokio::test]
    async fn test_move_into_directory_created_in_same_drain() {
        let mut fx = Fixture::start(manual_config(), |root| {
            fs::write(root.join("x"), b"moving").unwrap();
        });
        let checksum = fx.checksum_of("data/x");

        fs::create_dir(fx.path("data/d")).unwrap();
        fx.notify(RawOp::Create, "data/d");
        fs::rename(fx.path("data/x"), fx.path("data/d/x")).unwrap();
        fx.notify(RawOp::Rename, "data/x");
        fx.notify(RawOp::Create, "data/d/x");
        fx.wait_pending(3).await;

        assert_eq!(fx.watcher.flush().await, 3);
        let kinds: Vec<(EventKind, RelativePath)> = vec![
            fx.next_event().await,
            fx.next_event().await,
            fx.next_event().await,
        ]
        .into_iter()
        .map(|t| (t.kind, t.path))
        .collect();
        assert_eq!(
            kinds,
            vec![
                (EventKind::Create, rel("data/d")),
                (EventKind::Remove, rel("data/x")),
                (EventKind::Create, rel("data/d/x")),
            ]
        );
        assert!(fx.errors.try_recv().is_err());

        assert!(fx.watcher.search(&rel("data/x")).is_none());
        let moved = fx.watcher.search(&rel("data/d/x")).unwrap();
        assert_eq!(moved.meta.checksum, checksum);
        assert_eq!(fx.watcher.tree().node_count(), 3);
    }

    #[tokio::test]
    async fn test_file_created_before_directory_rename() {
        let mut fx = Fixture::start(manual_config(), |root| {
            fs::create_dir(root.join("x")).unwrap();
            fs::write(root.join("x/old"), b"old").unwrap();
        });

        fs::write(fx.path("data/x/new"), b"new").unwrap();
        fx.notify(RawOp::Create, "data/x/new");
        fs::rename(fx.path("data/x"), fx.path("data/y")).unwrap();
        fx.notify(RawOp::Rename, "data/x");
        fx.notify(RawOp::Create, "data/y");
        fx.wait_pending(3).await;

        assert_eq!(fx.watcher.flush().await, 2);
        let renamed = fx.next_event().await;
        assert_eq!(renamed.kind, EventKind::Rename);
        assert_eq!(renamed.path, rel("data/y"));
        let created = fx.next_event().await;
        assert_eq!((created.kind, created.path), (EventKind::Create, rel("data/y/new")));
        assert!(fx.errors.try_recv().is_err());

        assert!(fx.watcher.search(&rel("data/x")).is_none());
        assert!(fx.watcher.search(&rel("data/y/old")).is_some());
        assert_eq!(
            fx.watcher.search(&rel("data/y/new")).unwrap().meta.checksum,
            fx.checksum_of("data/y/new")
        );
        assert_eq!(
            fx.handle.watched(),
            BTreeSet::from([fx.path("data"), fx.path("data/y")])
        );
    }

    #[tokio::test]
    async fn test_writes_collapse_to_final_checksum() {
        let mut fx = Fixture::start(manual_config(), |root| {
            fs::write(root.join("f"), b"zero").unwrap();
        });

        fs::write(fx.path("data/f"), b"one").unwrap();
        fx.notify(RawOp::Write, "data/f");
        fs::write(fx.path("data/f"), b"two").unwrap();
        fx.notify(RawOp::Write, "data/f");
        fx.notify(RawOp::Chmod, "data/f");
        fx.wait_pending(3).await;

        assert_eq!(fx.watcher.flush().await, 1);
        let written = fx.next_event().await;
        assert_eq!(written.kind, EventKind::Write);
        assert_eq!(written.node.meta.checksum, fx.checksum_of("data/f"));
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chmod_is_silent() {
        let mut fx = Fixture::start(manual_config(), |root| {
            fs::write(root.join("f"), b"x").unwrap();
        });

        fx.notify(RawOp::Chmod, "data/f");
        fx.notify(RawOp::Chmod, "data/missing");
        fx.wait_pending(2).await;
        fx.watcher.flush().await;

        assert!(fx.events.try_recv().is_err());
        assert!(fx.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rename_pairs_and_keeps_identity() {
        let mut fx = Fixture::start(manual_config(), |root| {
            fs::create_dir_all(root.join("dir/sub")).unwrap();
            fs::write(root.join("dir/sub/f"), b"content").unwrap();
        });
        let id = fx.watcher.search(&rel("data/dir")).unwrap().id;

        fs::rename(fx.path("data/dir"), fx.path("data/renamed")).unwrap();
        fx.notify(RawOp::Rename, "data/dir");
        fx.notify(RawOp::Create, "data/renamed");
        fx.wait_pending(2).await;
        fx.watcher.flush().await;

        let renamed = fx.next_event().await;
        assert_eq!(renamed.kind, EventKind::Rename);
        assert_eq!(renamed.path, rel("data/renamed"));
        assert_eq!(renamed.previous, Some(rel("data/dir")));
        assert_eq!(renamed.node.id, id);
        assert!(fx.watcher.search(&rel("data/dir")).is_none());
        assert!(fx.watcher.search(&rel("data/renamed/sub/f")).is_some());

        let expected: BTreeSet<PathBuf> = ["data", "data/renamed", "data/renamed/sub"]
            .iter()
            .map(|p| fx.path(p))
            .collect();
        assert_eq!(fx.handle.watched(), expected);
    }

    #[tokio::test]
    async fn test_file_move_across_directories() {
        let mut fx = Fixture::start(manual_config(), |root| {
            fs::create_dir(root.join("a")).unwrap();
            fs::create_dir(root.join("b")).unwrap();
            fs::write(root.join("a/f"), b"moving").unwrap();
        });

        fs::rename(fx.path("data/a/f"), fx.path("data/b/f")).unwrap();
        fx.notify(RawOp::Rename, "data/a/f");
        fx.notify(RawOp::Create, "data/b/f");
        fx.wait_pending(2).await;
        fx.watcher.flush().await;

        let moved = fx.next_event().await;
        assert_eq!(moved.kind, EventKind::Move);
        assert_eq!(moved.path, rel("data/b/f"));
    }

    #[tokio::test]
    async fn test_failures_go_to_errors_stream() {
        let mut fx = Fixture::start(manual_config(), |_| {});

        fx.notify(RawOp::Write, "data/ghost");
        fx.wait_pending(1).await;
        fx.watcher.flush().await;
        assert!(matches!(
            fx.next_error().await,
            WatcherError::Tree(shadow_core::Error::NotFound(_))
        ));

        fx.handle.send(SourceEvent::Unhandled {
            kind: "Other".to_string(),
            path: Some(fx.path("data/x")),
        });
        assert!(matches!(
            fx.next_error().await,
            WatcherError::UnhandledEventKind { .. }
        ));

        fx.handle.send(SourceEvent::Error("overflow".to_string()));
        assert!(matches!(fx.next_error().await, WatcherError::Source(_)));

        // The watcher keeps going after failures
        fs::write(fx.path("data/new"), b"x").unwrap();
        fx.notify(RawOp::Create, "data/new");
        fx.wait_pending(1).await;
        fx.watcher.flush().await;
        assert_eq!(fx.next_event().await.kind, EventKind::Create);
    }

    #[tokio::test]
    async fn test_startup_registration_failure_aborts() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("data");
        fs::create_dir_all(root.join("a")).unwrap();

        let (source, handle, notifications) = ManualSource::new();
        handle.reject(root.join("a"));
        let result = TreeWatcher::start(
            SourcePath::fs(&root),
            source,
            notifications,
            Arc::new(Blake3Checksum::default()),
            manual_config(),
        );

        assert!(matches!(
            result,
            Err(WatcherError::WatchRegistrationFailed { .. })
        ));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_root_must_be_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(
            TreeWatcher::new_path_watcher(&file, WatcherConfig::default()),
            Err(WatcherError::Tree(shadow_core::Error::NotDirectory(_)))
        ));
        assert!(matches!(
            TreeWatcher::new_path_watcher(temp_dir.path().join("missing"), WatcherConfig::default()),
            Err(WatcherError::Tree(shadow_core::Error::NotDirectory(_)))
        ));
    }

    #[tokio::test]
    async fn test_unnamed_root_is_rejected() {
        let (source, handle, notifications) = ManualSource::new();
        let result = TreeWatcher::start(
            SourcePath::virtual_dir("/"),
            source,
            notifications,
            Arc::new(Blake3Checksum::default()),
            manual_config(),
        );
        assert!(matches!(
            result,
            Err(WatcherError::Tree(shadow_core::Error::UnnamedRoot(_)))
        ));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_start_requires_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let (source, _handle, notifications) = ManualSource::new();
        let result = TreeWatcher::start(
            SourcePath::fs(temp_dir.path()),
            source,
            notifications,
            Arc::new(Blake3Checksum::default()),
            WatcherConfig::default(),
        );
        assert!(matches!(result, Err(WatcherError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_restore_leaves_watch_set_alone() {
        let fx = Fixture::start(manual_config(), |root| {
            fs::create_dir(root.join("a")).unwrap();
        });
        let watched = fx.watcher.watched_directories();

        let mut snapshot = Node::root("data");
        snapshot.children.insert(
            "restored.txt".to_string(),
            Node::new("restored.txt", shadow_core::Metadata::file("abc".to_string()), None),
        );
        let previous = fx.watcher.restore(snapshot.clone());

        assert!(previous.children.contains_key("a"));
        assert_eq!(fx.watcher.tree(), snapshot);
        assert!(fx.watcher.search(&rel("data/a")).is_none());
        assert_eq!(fx.watcher.watched_directories(), watched);
    }

    #[tokio::test]
    async fn test_handle_applies_directly() {
        let fx = Fixture::start(manual_config(), |_| {});
        fs::write(fx.path("data/direct"), b"x").unwrap();

        let transaction = fx
            .watcher
            .handle(Event::create(SourcePath::fs(fx.path("data/direct"))))
            .unwrap();
        assert_eq!(transaction.path, rel("data/direct"));
        assert!(matches!(
            fx.watcher.handle(Event::write(SourcePath::fs(fx.path("data/nope")))),
            Err(WatcherError::Tree(shadow_core::Error::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let mut fx = Fixture::start(manual_config(), |_| {});

        fx.watcher.close();
        fx.watcher.close();
        assert!(fx.watcher.is_closed());
        assert!(fx.handle.is_closed());
        assert!(fx.watcher.watched_directories().is_empty());
        assert!(matches!(
            fx.watcher.handle(Event::create(SourcePath::fs(fx.path("data/x")))),
            Err(WatcherError::Closed)
        ));

        fx.watcher.shutdown().await;
        assert!(fx.events.recv().await.is_none());
        assert!(fx.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_immediate_mode_applies_on_arrival() {
        let config = WatcherConfig {
            mode: DispatchMode::Immediate,
            ..manual_config()
        };
        let mut fx = Fixture::start(config, |root| {
            fs::write(root.join("f"), b"old").unwrap();
        });

        fs::write(fx.path("data/f"), b"new").unwrap();
        fx.notify(RawOp::Chmod, "data/f");
        fx.notify(RawOp::Write, "data/f");
        let written = fx.next_event().await;
        assert_eq!(written.kind, EventKind::Write);
        assert_eq!(written.node.meta.checksum, fx.checksum_of("data/f"));
        assert_eq!(fx.watcher.pending(), 0);

        // The old name still exists, so the rename alone is ignored
        fx.notify(RawOp::Rename, "data/f");
        fs::remove_file(fx.path("data/f")).unwrap();
        fx.notify(RawOp::Rename, "data/f");
        let removed = fx.next_event().await;
        assert_eq!(removed.kind, EventKind::Remove);
    }

    #[tokio::test]
    async fn test_ticker_drains_on_its_own() {
        let config = WatcherConfig {
            drain_interval_ms: 20,
            ..WatcherConfig::default()
        };
        let mut fx = Fixture::start(config, |root| {
            fs::write(root.join("f"), b"a").unwrap();
        });

        fs::write(fx.path("data/f"), b"b").unwrap();
        fx.notify(RawOp::Write, "data/f");
        assert_eq!(fx.next_event().await.kind, EventKind::Write);
    }

    #[tokio::test]
    async fn test_stalled_consumer_reports_output_stalled() {
        let config = WatcherConfig {
            output_capacity: 1,
            publish_timeout_ms: 20,
            ..manual_config()
        };
        let mut fx = Fixture::start(config, |root| {
            fs::write(root.join("a"), b"1").unwrap();
            fs::write(root.join("b"), b"1").unwrap();
        });

        fs::write(fx.path("data/a"), b"2").unwrap();
        fs::write(fx.path("data/b"), b"2").unwrap();
        fx.notify(RawOp::Write, "data/a");
        fx.notify(RawOp::Write, "data/b");
        fx.wait_pending(2).await;
        assert_eq!(fx.watcher.flush().await, 2);

        assert!(matches!(fx.next_error().await, WatcherError::OutputStalled(_)));
        assert_eq!(fx.next_event().await.path, rel("data/a"));
        assert!(fx.events.try_recv().is_err());
    }
}
