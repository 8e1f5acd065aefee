//! A small simulation that drives a synchronized room list and a cache of sessions,
//! printing what subscribers would see.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use eyeball::{SharedObservable, Subscriber};
use eyeball_im::VectorDiff;
use imbl::Vector;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use viewsync::{
    ActivityState, BackgroundActivity, KeyedResourceCache, ListSyncEngine, OrchestratedTask,
    SignalSources, SourceItem, SourceUpdate, SyncConfig,
    logging::init_logging,
    persistence::{load_keys_from_file, save_keys_to_file},
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// How many rooms the simulated room list starts with.
    #[clap(short, long, default_value_t = 6)]
    rooms: usize,

    /// A JSON file with sync settings. Defaults are used for anything it omits.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Where to persist the set of cached sessions.
    #[clap(long)]
    keys_file: Option<PathBuf>,

    /// Enable verbose logging output.
    #[clap(short, long, action)]
    verbose: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct RoomSummary {
    room_id: String,
    name: String,
    unread: u32,
}

impl SourceItem for RoomSummary {
    type Key = String;
    fn key(&self) -> String {
        self.room_id.clone()
    }
}

/// What the UI would actually render for a room.
#[derive(Debug, Clone)]
struct RoomPreview {
    line: Arc<str>,
}

fn build_preview(room: &RoomSummary) -> RoomPreview {
    let line = match room.unread {
        0 => room.name.clone(),
        n => format!("{} ({n} unread)", room.name),
    };
    RoomPreview { line: line.into() }
}

fn room(index: usize) -> RoomSummary {
    RoomSummary {
        room_id: format!("!room{index}:example.org"),
        name: format!("Room #{index}"),
        unread: 0,
    }
}

fn print_rooms(label: &str, previews: &Vector<RoomPreview>) {
    println!("{label}:");
    for preview in previews {
        println!("    {}", preview.line);
    }
}

async fn run_room_list_demo(cli: &Cli, config: &SyncConfig) -> Result<()> {
    let engine = ListSyncEngine::new("rooms", config.invalidation, build_preview);
    let scope = CancellationToken::new();
    let (updates, update_receiver) = tokio::sync::mpsc::unbounded_channel();
    let consumer = engine.start(&scope, UnboundedReceiverStream::new(update_receiver))
        .ok_or_else(|| anyhow::anyhow!("room list engine was already started"))?;
    let mut published = engine.subscribe();

    // An empty first snapshot changes nothing, so nothing would be published.
    let room_count = cli.rooms.max(1);
    let mut rooms: Vector<RoomSummary> = (0..room_count).map(room).collect();
    updates.send(SourceUpdate::Snapshot(rooms.clone()))?;
    print_rooms("Initial room list", &next_published(&mut published).await?);

    // The last room gets a new message and jumps to the top.
    if let Some(mut bumped) = rooms.pop_back() {
        bumped.unread += 1;
        rooms.push_front(bumped);
    }
    rooms.push_back(room(room_count));
    updates.send(SourceUpdate::Snapshot(rooms.clone()))?;
    print_rooms("After a new message and a new room", &next_published(&mut published).await?);

    updates.send(SourceUpdate::Diffs(vec![VectorDiff::Remove { index: 0 }]))?;
    print_rooms("After leaving the top room", &next_published(&mut published).await?);

    let (settings_changes, settings_receiver) = tokio::sync::mpsc::unbounded_channel();
    let rebuilder = engine.start_rebuild_trigger(&scope, UnboundedReceiverStream::new(settings_receiver), config.rebuild_debounce());
    for _ in 0..3 {
        settings_changes.send(())?;
    }
    print_rooms("After a burst of settings changes", &next_published(&mut published).await?);

    scope.cancel();
    consumer.await?;
    rebuilder.await?;
    info!(status = ?engine.status(), "Room list demo finished");
    Ok(())
}

async fn next_published(subscriber: &mut Subscriber<Vector<RoomPreview>>) -> Result<Vector<RoomPreview>> {
    subscriber.next().await.ok_or_else(|| anyhow::anyhow!("room list engine was dropped"))
}


#[derive(Debug)]
struct Session {
    user_id: String,
}

/// Pretends to be a session's sync loop.
struct FakeSync {
    user_id: String,
    state: SharedObservable<ActivityState>,
}

#[async_trait::async_trait]
impl BackgroundActivity for FakeSync {
    async fn start(&self) -> Result<()> {
        info!(user_id = %self.user_id, "Sync started");
        self.state.set(ActivityState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!(user_id = %self.user_id, "Sync stopped");
        self.state.set(ActivityState::Idle);
        Ok(())
    }

    fn state(&self) -> Subscriber<ActivityState> {
        self.state.subscribe()
    }
}

async fn run_session_cache_demo(cli: &Cli, config: &SyncConfig) -> Result<()> {
    let signals = SignalSources::new(true, true);
    let scope = CancellationToken::new();
    let task_config = config.clone();
    let task_signals = signals.clone();
    let task_scope = scope.clone();
    let sessions = KeyedResourceCache::new(|user_id: String| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        anyhow::ensure!(!user_id.is_empty(), "empty user ID");
        Ok(Arc::new(Session { user_id }))
    })
    .with_background_task(move |user_id: &String, _session: &Arc<Session>| {
        let activity = Arc::new(FakeSync {
            user_id: user_id.clone(),
            state: SharedObservable::new(ActivityState::Idle),
        });
        Some(OrchestratedTask::launch(
            format!("sync {user_id}"),
            &task_scope,
            activity,
            task_signals.subscribe(),
            &task_config,
        ))
    });

    let alice = "@alice:example.org".to_owned();
    let bob = "@bob:example.org".to_owned();
    let (first, second, third) = tokio::join!(
        sessions.get_or_restore(&alice),
        sessions.get_or_restore(&alice),
        sessions.get_or_restore(&bob),
    );
    println!("Restored {} and {} ({} sessions cached)", first?.user_id, third?.user_id, sessions.len());
    println!("Concurrent restores shared one session: {}", second.is_ok());

    signals.set_foreground(false);
    tokio::time::sleep(config.stop_grace_period() + Duration::from_millis(100)).await;
    for key in sessions.keys() {
        if let Some(task) = sessions.task(&key) {
            println!("In background, {key}'s sync is {:?}", task.state());
        }
    }
    signals.set_foreground(true);

    let keys_file = cli.keys_file.clone()
        .unwrap_or_else(|| std::env::temp_dir().join("viewsync-demo-sessions.json"));
    save_keys_to_file(&keys_file, &sessions.persisted_keys()).await?;
    println!("Signed out of {} sessions", sessions.remove_all().await);

    let persisted = load_keys_from_file::<String>(&keys_file).await?;
    for key in sessions.uncached_keys(persisted) {
        let session = sessions.get_or_restore(&key).await?;
        let running = sessions.task(&key).is_some_and(|task| task.state().is_running());
        println!("Restored {} after cold start (sync running: {running})", session.user_id);
    }

    sessions.remove_all().await;
    scope.cancel();
    Ok(())
}


#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let config = match &cli.config {
        Some(path) => SyncConfig::load(path).await?,
        None => SyncConfig::default(),
    };
    run_room_list_demo(&cli, &config).await?;
    run_session_cache_demo(&cli, &config).await?;
    Ok(())
}
