//! End-to-end tests for the automation engine
//!
//! Each test builds an isolated group with a "bench" plugin whose
//! conditions and actions write to a shared journal, so evaluation order,
//! short-circuiting and overlap can be asserted from the outside.

use async_trait::async_trait;
use hub_automation::{
    AutomationConfig, AutomationError, AutomationGroup, AutomationResult, Condition, CustomAction,
    CustomCondition, PluginTypes, Progress, Registry, RunContext, RunnerEvent, SceneConfig,
    TriggerConfig, TriggerDriver, TriggerEvent, TriggerHandle,
};
use hub_core::{AccessoryModel, CharacteristicPath, MemoryAccessoryModel};
use hub_event_bus::EventBus;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Barrier};

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Bench plugin
// ============================================================================

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

#[derive(Deserialize)]
struct CannedOptions {
    name: String,
    #[serde(default = "default_true")]
    result: bool,
    #[serde(default)]
    fail: bool,
}

fn default_true() -> bool {
    true
}

struct Canned {
    options: CannedOptions,
    journal: Journal,
}

#[async_trait]
impl CustomCondition for Canned {
    async fn check(
        &self,
        _ctx: &RunContext,
        _progress: &Progress,
        _parents: &[Arc<Condition>],
    ) -> AutomationResult<bool> {
        self.journal.record(format!("check {}", self.options.name));
        if self.options.fail {
            return Err(AutomationError::Failed(format!("{} failed", self.options.name)));
        }
        Ok(self.options.result)
    }
}

/// Reports a progress value outside [0, 1]
struct Overshoot;

#[async_trait]
impl CustomCondition for Overshoot {
    async fn check(
        &self,
        _ctx: &RunContext,
        progress: &Progress,
        _parents: &[Arc<Condition>],
    ) -> AutomationResult<bool> {
        progress.set(1.5)?;
        Ok(true)
    }
}

#[derive(Deserialize)]
struct RecordOptions {
    name: String,
    #[serde(default)]
    delay_ms: u64,
}

/// Journals its start and end, with a delay in between, and tracks how
/// many record actions are in flight at once
struct Record {
    options: RecordOptions,
    journal: Journal,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl CustomAction for Record {
    async fn run(
        &self,
        _ctx: &RunContext,
        progress: &Progress,
        _parents: &[Arc<hub_automation::Action>],
    ) -> AutomationResult<Value> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.journal.record(format!("start {}", self.options.name));

        progress.set(0.5)?;
        tokio::time::sleep(Duration::from_millis(self.options.delay_ms)).await;
        progress.set(1.0)?;

        self.journal.record(format!("end {}", self.options.name));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!(self.options.name))
    }
}

/// Waits until another rendezvous action reaches the barrier
struct Rendezvous(Arc<Barrier>);

#[async_trait]
impl CustomAction for Rendezvous {
    async fn run(
        &self,
        _ctx: &RunContext,
        _progress: &Progress,
        _parents: &[Arc<hub_automation::Action>],
    ) -> AutomationResult<Value> {
        self.0.wait().await;
        Ok(Value::Null)
    }
}

#[derive(Clone, Default)]
struct SlowStart {
    starts: Arc<AtomicUsize>,
}

#[async_trait]
impl TriggerDriver for SlowStart {
    async fn on_start(&self, _handle: TriggerHandle) -> AutomationResult<()> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_stop(&self) -> AutomationResult<()> {
        Ok(())
    }
}

struct Harness {
    group: Arc<AutomationGroup>,
    accessories: Arc<MemoryAccessoryModel>,
    journal: Journal,
    peak: Arc<AtomicUsize>,
    starts: Arc<AtomicUsize>,
}

fn options<T: for<'de> Deserialize<'de>>(options: &Value) -> AutomationResult<T> {
    serde_json::from_value(options.clone()).map_err(|e| AutomationError::Config(e.to_string()))
}

fn harness() -> Harness {
    let journal = Journal::default();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));
    let slow_start = SlowStart::default();
    let starts = slow_start.starts.clone();

    let canned_journal = journal.clone();
    let record_journal = journal.clone();
    let record_peak = peak.clone();

    let registry = Arc::new(Registry::new());
    registry.register(
        "bench",
        PluginTypes::new()
            .with_condition("canned", move |config| {
                Ok(Box::new(Canned {
                    options: options(config)?,
                    journal: canned_journal.clone(),
                }))
            })
            .with_condition("overshoot", |_| Ok(Box::new(Overshoot)))
            .with_action("record", move |config| {
                Ok(Box::new(Record {
                    options: options(config)?,
                    journal: record_journal.clone(),
                    in_flight: in_flight.clone(),
                    peak: record_peak.clone(),
                }))
            })
            .with_action("rendezvous", move |_| Ok(Box::new(Rendezvous(barrier.clone()))))
            .with_trigger("slow", move |_| Ok(Box::new(slow_start.clone()))),
    );

    let accessories = Arc::new(MemoryAccessoryModel::new());
    let group = AutomationGroup::new(
        "engine-test",
        accessories.clone(),
        Arc::new(EventBus::new()),
        registry,
    );

    Harness {
        group,
        accessories,
        journal,
        peak,
        starts,
    }
}

fn canned(name: &str, result: bool) -> Value {
    json!({"condition": "canned", "plugin": "bench", "name": name, "result": result})
}

fn record(name: &str, delay_ms: u64) -> Value {
    json!({"action": "record", "plugin": "bench", "name": name, "delay_ms": delay_ms})
}

fn automation_config(config: Value) -> AutomationConfig {
    serde_json::from_value(config).unwrap()
}

fn drain(rx: &mut broadcast::Receiver<RunnerEvent>) -> Vec<RunnerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Runner progress
// ============================================================================

#[tokio::test]
async fn test_runner_progress_stays_in_range() {
    let h = harness();
    let automation = h
        .group
        .load_automation(&automation_config(json!({
            "conditions": [{"condition": "test"}],
            "actions": [record("first", 5), record("second", 1)]
        })))
        .await
        .unwrap();

    let runner = automation.runner(TriggerEvent::manual(json!({})));
    let mut rx = runner.subscribe();
    assert!(runner.progress() < 1.0);
    assert!(!runner.is_finished());

    assert!(runner.run().await.unwrap());

    let observed: Vec<f64> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            RunnerEvent::Progress { progress } => Some(progress),
            _ => None,
        })
        .collect();
    assert!(!observed.is_empty());
    assert!(observed.iter().all(|p| (0.0..=1.0).contains(p)));

    assert!(runner.is_finished());
    assert_eq!(runner.progress(), 1.0);
}

#[tokio::test]
async fn test_progress_contract() {
    let progress = Progress::noop();
    assert!(matches!(progress.set(1.5), Err(AutomationError::Contract(_))));
    assert!(matches!(progress.set(-0.1), Err(AutomationError::Contract(_))));

    progress.set(1.0).unwrap();
    progress.finish();
    assert!(matches!(progress.set(1.0), Err(AutomationError::Contract(_))));
}

#[tokio::test]
async fn test_out_of_range_progress_fails_the_run() {
    let h = harness();
    let automation = h
        .group
        .load_automation(&automation_config(json!({
            "conditions": [{"condition": "overshoot", "plugin": "bench"}],
            "actions": [record("never", 0)]
        })))
        .await
        .unwrap();

    let result = automation.runner(TriggerEvent::manual(json!({}))).run().await;

    assert!(matches!(result, Err(AutomationError::Contract(_))));
    assert!(h.journal.position("start never").is_none());
}

// ============================================================================
// Composite conditions
// ============================================================================

#[tokio::test]
async fn test_all_short_circuits_after_first_false() {
    let h = harness();
    let automation = h
        .group
        .load_automation(&automation_config(json!({
            "conditions": [{"condition": "all", "conditions": [
                canned("a", true), canned("b", false), canned("c", true)
            ]}]
        })))
        .await
        .unwrap();

    let passed = automation
        .runner(TriggerEvent::manual(json!({})))
        .run()
        .await
        .unwrap();

    assert!(!passed);
    assert_eq!(h.journal.entries(), vec!["check a", "check b"]);
}

#[tokio::test]
async fn test_any_short_circuits_after_first_true() {
    let h = harness();
    let automation = h
        .group
        .load_automation(&automation_config(json!({
            "conditions": [{"condition": "any", "conditions": [
                canned("a", false), canned("b", true), canned("c", false)
            ]}]
        })))
        .await
        .unwrap();

    let passed = automation
        .runner(TriggerEvent::manual(json!({})))
        .run()
        .await
        .unwrap();

    assert!(passed);
    assert_eq!(h.journal.entries(), vec!["check a", "check b"]);
}

#[tokio::test]
async fn test_any_treats_errors_as_not_passing() {
    let h = harness();
    let automation = h
        .group
        .load_automation(&automation_config(json!({
            "conditions": [{"condition": "any", "conditions": [
                {"condition": "canned", "plugin": "bench", "name": "broken", "fail": true},
                canned("b", false)
            ]}]
        })))
        .await
        .unwrap();

    let passed = automation
        .runner(TriggerEvent::manual(json!({})))
        .run()
        .await
        .unwrap();

    assert!(!passed);
    assert_eq!(h.journal.entries(), vec!["check broken", "check b"]);
}

// ============================================================================
// Runner event sequence
// ============================================================================

#[tokio::test]
async fn test_runner_event_sequence() {
    let h = harness();
    let on = CharacteristicPath::new("lamp", "light", "on");
    let brightness = CharacteristicPath::new("lamp", "light", "brightness");
    h.accessories.add_characteristic(on.clone(), json!(false), true);
    h.accessories.add_characteristic(brightness.clone(), json!(20), true);

    let automation = h
        .group
        .load_automation(&automation_config(json!({
            "conditions": [{"condition": "all", "conditions": [
                {"condition": "test"}, {"condition": "test"}
            ]}],
            "actions": [
                {"action": "set_characteristic", "characteristic": ["lamp", "light", "on"], "value": true},
                {"action": "set_characteristic", "characteristic": ["lamp", "light", "brightness"], "increase": 30}
            ]
        })))
        .await
        .unwrap();

    let runner = automation.runner(TriggerEvent::manual(json!({})));
    let mut rx = runner.subscribe();
    assert!(runner.run().await.unwrap());

    let events = drain(&mut rx);
    let condition_progress: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            RunnerEvent::ConditionProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(condition_progress, vec![0.5, 1.0]);

    let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
    let passed = names.iter().position(|n| *n == "condition-passed").unwrap();
    let last_condition_progress = names
        .iter()
        .rposition(|n| *n == "condition-progress")
        .unwrap();
    assert!(last_condition_progress < passed);
    assert_eq!(
        names[passed + 1..].iter().filter(|n| **n == "action-finished").count(),
        2
    );
    assert_eq!(events.last(), Some(&RunnerEvent::Finished { success: true }));
    assert_eq!(runner.progress(), 1.0);

    assert_eq!(h.accessories.characteristic(&on).unwrap().value(), json!(true));
    assert_eq!(
        h.accessories.characteristic(&brightness).unwrap().value(),
        json!(50)
    );
}

#[tokio::test]
async fn test_actions_start_concurrently() {
    let h = harness();
    let automation = h
        .group
        .load_automation(&automation_config(json!({
            "actions": [
                {"action": "rendezvous", "plugin": "bench"},
                {"action": "rendezvous", "plugin": "bench"}
            ]
        })))
        .await
        .unwrap();

    // Sequential execution would leave the first action waiting forever
    let run = automation.runner(TriggerEvent::manual(json!({}))).run();
    let passed = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
    assert!(passed);
}

#[tokio::test]
async fn test_concurrent_runners_are_independent() {
    let h = harness();
    let automation = h
        .group
        .load_automation(&automation_config(json!({"actions": [record("step", 10)]})))
        .await
        .unwrap();

    let first = automation.runner(TriggerEvent::manual(json!({})));
    let second = automation.runner(TriggerEvent::manual(json!({})));
    assert_ne!(first.id(), second.id());

    let (first_run, second_run) = (first.run(), second.run());
    assert_eq!(automation.running_runners().len(), 2);

    let (a, b) = tokio::join!(first_run, second_run);
    assert!(a.unwrap() && b.unwrap());
    assert_eq!(h.peak.load(Ordering::SeqCst), 2);
    assert!(automation.running_runners().is_empty());
    assert!(h.group.runners().is_empty());
}

// ============================================================================
// Scenes
// ============================================================================

async fn scene_with_phases(h: &Harness) -> Arc<hub_automation::Scene> {
    let config: SceneConfig = serde_json::from_value(json!({
        "uuid": "movie",
        "enable_actions": [record("enable-1", 20), record("enable-2", 5)],
        "disable_actions": [record("disable-1", 20), record("disable-2", 5)]
    }))
    .unwrap();
    h.group.load_scene(&config).unwrap()
}

fn last_end(journal: &Journal, prefix: &str) -> usize {
    journal
        .entries()
        .iter()
        .rposition(|e| e.starts_with(&format!("end {}", prefix)))
        .unwrap()
}

fn first_start(journal: &Journal, prefix: &str) -> usize {
    journal
        .entries()
        .iter()
        .position(|e| e.starts_with(&format!("start {}", prefix)))
        .unwrap()
}

#[tokio::test]
async fn test_disable_waits_for_enable() {
    let h = harness();
    let scene = scene_with_phases(&h).await;

    let enable = scene.enable();
    let disable = scene.disable();
    let (a, b) = tokio::join!(enable, disable);
    a.unwrap();
    b.unwrap();

    assert!(last_end(&h.journal, "enable") < first_start(&h.journal, "disable"));
    assert_eq!(h.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_enable_waits_for_disable() {
    let h = harness();
    let scene = scene_with_phases(&h).await;

    let disable = scene.disable();
    let enable = scene.enable();
    let (a, b) = tokio::join!(enable, disable);
    a.unwrap();
    b.unwrap();

    assert!(last_end(&h.journal, "disable") < first_start(&h.journal, "enable"));
}

#[tokio::test]
async fn test_scene_activation_fires_scene_trigger() {
    let h = harness();
    let scene = h
        .group
        .load_scene(&serde_json::from_value(json!({"uuid": "movie"})).unwrap())
        .unwrap();
    let automation = h
        .group
        .load_automation(&automation_config(json!({
            "triggers": [{"trigger": "scene", "scene_uuid": "movie"}],
            "actions": [record("lights-down", 0)]
        })))
        .await
        .unwrap();
    let mut receipts = automation.subscribe();

    h.group.start().await.unwrap();
    scene.enable().await.unwrap();

    let receipt = tokio::time::timeout(TIMEOUT, receipts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(receipt.event.data["parent"]["data"]["scene_uuid"], "movie");

    h.group.stop().await.unwrap();
}

// ============================================================================
// Triggers
// ============================================================================

#[tokio::test]
async fn test_concurrent_trigger_starts_share_one_start() {
    let h = harness();
    let trigger = h
        .group
        .load_trigger(&TriggerConfig::new("slow").with_plugin("bench"))
        .unwrap();

    let first = trigger.start();
    let second = trigger.start();
    assert!(first.ptr_eq(&second));

    let (a, b) = tokio::join!(first, second);
    a.unwrap();
    b.unwrap();

    assert_eq!(h.starts.load(Ordering::SeqCst), 1);
    assert!(trigger.is_running());
}

#[tokio::test]
async fn test_stopped_trigger_cannot_fire() {
    let h = harness();
    let trigger = h
        .group
        .load_trigger(&TriggerConfig::new("slow").with_plugin("bench"))
        .unwrap();

    trigger.start().await.unwrap();
    trigger.stop().await.unwrap();

    assert!(matches!(
        trigger.trigger(json!({})),
        Err(AutomationError::NotRunning(_))
    ));
}

// ============================================================================
// Run-automation action
// ============================================================================

#[tokio::test]
async fn test_run_automation_skip_conditions() {
    let h = harness();
    let target = h
        .group
        .load_automation(&automation_config(json!({
            "uuid": "target",
            "conditions": [canned("gate", false)],
            "actions": [record("target-action", 0)]
        })))
        .await
        .unwrap();
    let caller = h
        .group
        .load_automation(&automation_config(json!({
            "actions": [{"action": "run_automation", "automation_uuid": "target", "skip_conditions": true}]
        })))
        .await
        .unwrap();

    assert!(caller
        .runner(TriggerEvent::manual(json!({})))
        .run()
        .await
        .unwrap());
    assert_eq!(h.journal.entries(), vec!["start target-action", "end target-action"]);
    assert_eq!(target.conditions().len(), 1);

    // An independent run still evaluates the gate
    let passed = target
        .runner(TriggerEvent::manual(json!({})))
        .run()
        .await
        .unwrap();
    assert!(!passed);
    assert_eq!(h.journal.position("check gate"), Some(2));
    assert_eq!(
        h.journal
            .entries()
            .iter()
            .filter(|e| *e == "start target-action")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_run_automation_forwards_progress() {
    let h = harness();
    h.group
        .load_automation(&automation_config(json!({
            "uuid": "target",
            "actions": [record("nested", 0)]
        })))
        .await
        .unwrap();
    let caller = h
        .group
        .load_automation(&automation_config(json!({
            "actions": [{"action": "run_automation", "automation_uuid": "target"}]
        })))
        .await
        .unwrap();

    let runner = caller.runner(TriggerEvent::manual(json!({})));
    let mut rx = runner.subscribe();
    assert!(runner.run().await.unwrap());

    let forwarded: Vec<f64> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            RunnerEvent::ActionProgress { progress, .. } => Some(progress),
            _ => None,
        })
        .collect();
    assert_eq!(forwarded.first(), Some(&0.5));
    assert_eq!(forwarded.last(), Some(&1.0));
    assert!(forwarded[..forwarded.len() - 1].iter().all(|p| *p < 1.0));
}
