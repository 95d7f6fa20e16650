#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vigil_core::{ChangeRecord, Event, EventHandler, ObjectKey, TrackedObject};
use vigil_store::{spawn_dispatcher, sync_gate, DeltaQueue, Store, SyncGate};

#[derive(Clone, Debug, PartialEq, Eq)]
struct Obj {
    namespace: Option<String>,
    name: String,
    rv: String,
}

impl TrackedObject for Obj {
    fn key(&self) -> ObjectKey {
        ObjectKey { namespace: self.namespace.clone(), name: self.name.clone() }
    }

    fn resource_version(&self) -> Option<&str> {
        Some(&self.rv)
    }
}

fn obj(name: &str, rv: &str) -> Obj {
    Obj { namespace: Some("ns".into()), name: name.into(), rv: rv.into() }
}

/// Records one line per event: `kind name rv [tombstone]`.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn lines_for(&self, name: &str) -> Vec<String> {
        self.lines().into_iter().filter(|l| l.split(' ').nth(1) == Some(name)).collect()
    }
}

impl EventHandler<Obj> for Recorder {
    fn on_event(&self, event: &Event<Obj>) {
        let line = match event {
            Event::Added(o) => format!("added {} {}", o.name, o.rv),
            Event::Updated { new, .. } => format!("updated {} {}", new.name, new.rv),
            Event::Deleted { object, observed: true } => {
                format!("deleted {} {}", object.name, object.rv)
            }
            Event::Deleted { object, observed: false } => {
                format!("deleted {} {} tombstone", object.name, object.rv)
            }
        };
        self.0.lock().unwrap().push(line);
    }
}

struct Rig {
    queue: Arc<DeltaQueue<Obj>>,
    store: Arc<Store<Obj>>,
    gate: SyncGate,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn rig(handlers: Vec<Box<dyn EventHandler<Obj>>>) -> Rig {
    let queue = Arc::new(DeltaQueue::new());
    let store = Arc::new(Store::new());
    let (sync_tx, gate) = sync_gate();
    let cancel = CancellationToken::new();
    let task = spawn_dispatcher(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::new(handlers),
        sync_tx,
        cancel.clone(),
    );
    Rig { queue, store, gate, cancel, task }
}

async fn wait_until(mut pred: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn store_is_a_fold_over_the_event_stream() {
    let rec = Recorder::default();
    let r = rig(vec![Box::new(rec.clone())]);

    r.queue.replace(vec![obj("a", "1"), obj("b", "1")], &r.store);
    assert!(r.gate.wait_for_sync(&r.cancel).await);
    assert_eq!(r.store.len(), 2);
    assert_eq!(r.store.get(&obj("a", "1").key()).unwrap().rv, "1");

    r.queue.push(ChangeRecord::Updated { old: obj("a", "1"), new: obj("a", "2") });
    wait_until(|| r.store.get(&obj("a", "2").key()).map(|o| o.rv == "2").unwrap_or(false)).await;

    r.queue.push(ChangeRecord::Deleted { object: obj("b", "1"), observed: true });
    wait_until(|| r.store.get(&obj("b", "1").key()).is_none()).await;

    assert_eq!(r.store.len(), 1);
    let mut lines = rec.lines();
    // Initial list order across keys is not guaranteed; normalize it.
    lines[..2].sort();
    assert_eq!(lines, ["added a 1", "added b 1", "updated a 2", "deleted b 1"]);
}

#[tokio::test]
async fn duplicate_add_at_same_version_dispatches_nothing() {
    let rec = Recorder::default();
    let r = rig(vec![Box::new(rec.clone())]);

    r.queue.replace(vec![obj("a", "1")], &r.store);
    assert!(r.gate.wait_for_sync(&r.cancel).await);

    r.queue.push(ChangeRecord::Added(obj("a", "1")));
    // Sequencing marker: once "c" lands, the duplicate has been processed.
    r.queue.push(ChangeRecord::Added(obj("c", "1")));
    wait_until(|| r.store.get(&obj("c", "1").key()).is_some()).await;

    assert_eq!(rec.lines_for("a"), ["added a 1"]);
}

#[tokio::test]
async fn per_key_updates_apply_in_order() {
    let rec = Recorder::default();
    let r = rig(vec![Box::new(rec.clone())]);

    r.queue.replace(vec![obj("a", "1")], &r.store);
    assert!(r.gate.wait_for_sync(&r.cancel).await);
    r.queue.push(ChangeRecord::Updated { old: obj("a", "1"), new: obj("a", "2") });
    wait_until(|| r.store.get(&obj("a", "2").key()).map(|o| o.rv == "2").unwrap_or(false)).await;

    assert_eq!(rec.lines_for("a"), ["added a 1", "updated a 2"]);
}

#[tokio::test]
async fn update_for_unseen_key_dispatches_as_add() {
    let rec = Recorder::default();
    let r = rig(vec![Box::new(rec.clone())]);

    r.queue.push(ChangeRecord::Updated { old: obj("a", "1"), new: obj("a", "2") });
    wait_until(|| r.store.get(&obj("a", "2").key()).is_some()).await;
    assert_eq!(rec.lines_for("a"), ["added a 2"]);
}

#[tokio::test]
async fn delete_for_unseen_key_is_a_noop() {
    let rec = Recorder::default();
    let r = rig(vec![Box::new(rec.clone())]);

    r.queue.push(ChangeRecord::Deleted { object: obj("x", "1"), observed: true });
    r.queue.push(ChangeRecord::Added(obj("marker", "1")));
    wait_until(|| r.store.get(&obj("marker", "1").key()).is_some()).await;

    assert!(rec.lines_for("x").is_empty());
}

#[tokio::test]
async fn relist_repair_synthesizes_one_tombstoned_delete() {
    let rec = Recorder::default();
    let r = rig(vec![Box::new(rec.clone())]);

    r.queue.replace(vec![obj("a", "1"), obj("b", "1")], &r.store);
    assert!(r.gate.wait_for_sync(&r.cancel).await);

    // Fresh list only reports "a": exactly one tombstoned delete for "b".
    r.queue.replace(vec![obj("a", "1")], &r.store);
    wait_until(|| r.store.get(&obj("b", "1").key()).is_none()).await;

    assert_eq!(rec.lines_for("b"), ["added b 1", "deleted b 1 tombstone"]);
    assert_eq!(r.store.len(), 1);
}

struct PanicOnDelete;

impl EventHandler<Obj> for PanicOnDelete {
    fn on_event(&self, event: &Event<Obj>) {
        if let Event::Deleted { .. } = event {
            panic!("observer failure");
        }
    }
}

#[tokio::test]
async fn panicking_observer_does_not_starve_the_next_one() {
    let rec = Recorder::default();
    let r = rig(vec![Box::new(PanicOnDelete), Box::new(rec.clone())]);

    r.queue.replace(vec![obj("x", "1")], &r.store);
    assert!(r.gate.wait_for_sync(&r.cancel).await);

    r.queue.push(ChangeRecord::Deleted { object: obj("x", "1"), observed: true });
    wait_until(|| r.store.get(&obj("x", "1").key()).is_none()).await;

    // Second observer still got the delete, and the store dropped X.
    assert_eq!(rec.lines_for("x"), ["added x 1", "deleted x 1"]);
    // Dispatcher survives for further events.
    r.queue.push(ChangeRecord::Added(obj("y", "1")));
    wait_until(|| r.store.get(&obj("y", "1").key()).is_some()).await;
}

#[tokio::test]
async fn wait_for_sync_returns_false_when_cancelled_first() {
    let rec = Recorder::default();
    let r = rig(vec![Box::new(rec.clone())]);

    let gate = r.gate.clone();
    let cancel = r.cancel.clone();
    let waiter = tokio::spawn(async move { gate.wait_for_sync(&cancel).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    r.cancel.cancel();

    assert!(!waiter.await.unwrap());
    r.task.await.unwrap();
}

#[tokio::test]
async fn no_mutation_or_dispatch_after_cancellation() {
    let rec = Recorder::default();
    let r = rig(vec![Box::new(rec.clone())]);

    r.queue.replace(vec![obj("a", "1")], &r.store);
    assert!(r.gate.wait_for_sync(&r.cancel).await);

    r.cancel.cancel();
    r.task.await.unwrap();

    r.queue.push(ChangeRecord::Added(obj("late", "1")));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(r.store.get(&obj("late", "1").key()).is_none());
    assert_eq!(rec.lines(), ["added a 1"]);
}

#[tokio::test]
async fn cancellation_wins_over_a_pending_backlog() {
    let rec = Recorder::default();
    let queue: Arc<DeltaQueue<Obj>> = Arc::new(DeltaQueue::new());
    let store = Arc::new(Store::new());
    let (sync_tx, _gate) = sync_gate();
    let cancel = CancellationToken::new();

    // Backlog is already queued when the dispatcher observes cancellation:
    // none of it may be applied or dispatched.
    queue.push(ChangeRecord::Added(obj("a", "1")));
    queue.push(ChangeRecord::Added(obj("b", "1")));
    cancel.cancel();

    let handlers: Vec<Box<dyn EventHandler<Obj>>> = vec![Box::new(rec.clone())];
    let task = spawn_dispatcher(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::new(handlers),
        sync_tx,
        cancel,
    );
    task.await.unwrap();

    assert!(store.is_empty());
    assert!(rec.lines().is_empty());
}
