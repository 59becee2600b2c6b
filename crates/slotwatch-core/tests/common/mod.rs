//! In-memory launcher that records what the supervisor does.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use slotwatch_core::{
    Config, InstanceExit, LaunchMode, LaunchRequest, Launcher, ProcessHandle, Result, RetryPolicy,
    RunSummary, SlotwatchError, StateStore, Supervisor,
};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Launched {
        generation: u64,
        slot: usize,
        mode: LaunchMode,
        verb: String,
        program: PathBuf,
        /// Program bytes at launch time.
        contents: Vec<u8>,
        /// What the instance would load on startup.
        state: Option<Value>,
    },
    StopRequested(u64),
    Killed(u64),
    Exited(u64),
}

/// How a fake instance reacts.
#[derive(Clone, Debug)]
pub struct Behavior {
    pub exits_on_stop: bool,
    pub dies_on_kill: bool,
    /// Written to the state path right before exiting.
    pub state_on_exit: Option<Value>,
    /// Exits on its own after running this long.
    pub lifetime: Option<Duration>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            exits_on_stop: true,
            dies_on_kill: true,
            state_on_exit: None,
            lifetime: None,
        }
    }
}

#[derive(Default)]
struct World {
    events: Vec<(Instant, Event)>,
    alive: HashSet<u64>,
    max_alive: usize,
    behaviors: VecDeque<Behavior>,
    launch_failures: u32,
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    world: Arc<Mutex<World>>,
}

impl FakeLauncher {
    pub fn push_behavior(&self, behavior: Behavior) {
        self.world.lock().unwrap().behaviors.push_back(behavior);
    }

    pub fn fail_next_launches(&self, n: u32) {
        self.world.lock().unwrap().launch_failures = n;
    }

    pub fn events(&self) -> Vec<Event> {
        self.world
            .lock()
            .unwrap()
            .events
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn timed_events(&self) -> Vec<(Instant, Event)> {
        self.world.lock().unwrap().events.clone()
    }

    pub fn launches(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Launched { .. }))
            .collect()
    }

    pub fn alive(&self) -> usize {
        self.world.lock().unwrap().alive.len()
    }

    pub fn max_alive(&self) -> usize {
        self.world.lock().unwrap().max_alive
    }

    pub fn position(&self, wanted: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == wanted)
    }

    pub fn launch_position(&self, generation: u64) -> Option<usize> {
        self.events().iter().position(
            |e| matches!(e, Event::Launched { generation: g, .. } if *g == generation),
        )
    }
}

impl Launcher for FakeLauncher {
    type Handle = FakeHandle;

    fn launch(&mut self, request: &LaunchRequest) -> Result<FakeHandle> {
        let mut world = self.world.lock().unwrap();
        if world.launch_failures > 0 {
            world.launch_failures -= 1;
            return Err(SlotwatchError::LaunchFailed {
                program: request.program.clone(),
                source: std::io::Error::other("exec format error"),
            });
        }

        let behavior = world.behaviors.pop_front().unwrap_or_default();
        let contents = std::fs::read(&request.program).unwrap_or_default();
        let state = StateStore::new(&request.state_path).load();

        world.alive.insert(request.generation);
        world.max_alive = world.max_alive.max(world.alive.len());
        world.events.push((
            Instant::now(),
            Event::Launched {
                generation: request.generation,
                slot: request.slot.0,
                mode: request.mode,
                verb: request.verb.clone(),
                program: request.program.clone(),
                contents,
                state,
            },
        ));

        Ok(FakeHandle {
            generation: request.generation,
            state_path: request.state_path.clone(),
            behavior,
            world: Arc::clone(&self.world),
            stop_requested: false,
            killed: false,
            exited: false,
            launched_at: Instant::now(),
        })
    }
}

pub struct FakeHandle {
    generation: u64,
    state_path: PathBuf,
    behavior: Behavior,
    world: Arc<Mutex<World>>,
    stop_requested: bool,
    killed: bool,
    exited: bool,
    launched_at: Instant,
}

impl FakeHandle {
    fn record(&self, event: Event) {
        self.world
            .lock()
            .unwrap()
            .events
            .push((Instant::now(), event));
    }

    fn should_exit(&self) -> bool {
        (self.stop_requested && self.behavior.exits_on_stop)
            || (self.killed && self.behavior.dies_on_kill)
            || self
                .behavior
                .lifetime
                .is_some_and(|l| self.launched_at.elapsed() >= l)
    }

    fn exit(&mut self) -> InstanceExit {
        if let Some(state) = &self.behavior.state_on_exit {
            StateStore::new(&self.state_path).save(state).unwrap();
        }
        self.exited = true;
        let mut world = self.world.lock().unwrap();
        world.alive.remove(&self.generation);
        world
            .events
            .push((Instant::now(), Event::Exited(self.generation)));
        InstanceExit {
            code: if self.killed { None } else { Some(0) },
        }
    }
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn id(&self) -> Option<u32> {
        Some(1000 + self.generation as u32)
    }

    fn is_alive(&mut self) -> bool {
        if !self.exited && self.should_exit() {
            self.exit();
        }
        !self.exited
    }

    fn request_stop(&mut self) -> std::io::Result<()> {
        self.stop_requested = true;
        self.record(Event::StopRequested(self.generation));
        Ok(())
    }

    fn force_kill(&mut self) -> std::io::Result<()> {
        self.killed = true;
        self.record(Event::Killed(self.generation));
        Ok(())
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> std::io::Result<Option<InstanceExit>> {
        if self.exited {
            return Ok(Some(InstanceExit { code: Some(0) }));
        }
        if !self.should_exit() {
            tokio::time::sleep(timeout).await;
        }
        if self.should_exit() {
            Ok(Some(self.exit()))
        } else {
            Ok(None)
        }
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub artifact: PathBuf,
    pub slots: Vec<PathBuf>,
    pub state: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("target/debug/agent");
        std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        std::fs::write(&artifact, b"build 0").unwrap();
        let slots = slotwatch_core::slots_from_hint(&dir.path().join("target/agent/agent_copy"), 2);
        let state = dir.path().join("data/last_state.json");
        Self {
            dir,
            artifact,
            slots,
            state,
        }
    }

    pub fn rebuild(&self, contents: &str) {
        std::fs::write(&self.artifact, contents).unwrap();
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.state)
    }

    pub fn supervisor(&self, launcher: FakeLauncher, config: Config) -> Supervisor<FakeLauncher> {
        Supervisor::new(
            &self.artifact,
            self.slots.clone(),
            &self.state,
            config,
            launcher,
        )
        .unwrap()
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }
}

/// 100ms polls, 1s grace, quick retries.
pub fn fast_config() -> Config {
    Config {
        poll_interval_ms: 100,
        grace_period_ms: 1_000,
        unreadable_after_polls: 5,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
        },
        ..Config::default()
    }
}

/// Runs the supervisor next to `script`, then requests a stop.
pub async fn drive<S>(sup: &mut Supervisor<FakeLauncher>, script: S) -> Result<RunSummary>
where
    S: Future<Output = ()>,
{
    let (tx, rx) = oneshot::channel::<()>();
    let run = sup.run(async move {
        let _ = rx.await;
    });
    let script = async move {
        script.await;
        let _ = tx.send(());
    };
    let (result, ()) = tokio::join!(run, script);
    result
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
