//! Integration tests for stagehand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stagehand::{
    resolve, Application, BootstrapGate, Config, Dependency, Error, ErrorKind, EventKind,
    LifecycleHooks, LifecycleSettings, LifecycleState, ManagerConfig, Plugin, PluginContext,
    PluginEvent, PluginManager, Result, StatusAware, MANAGER_EVENT_SOURCE,
};

type Journal = Arc<Mutex<Vec<String>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[derive(Clone, Copy, PartialEq)]
enum Fault {
    None,
    StartError,
    StartPanic,
    InitHang,
    StopPanic,
    StopHang,
    StatusPanicOnStop,
}

/// Test plugin that journals every lifecycle call.
struct Service {
    id: &'static str,
    deps: Vec<Dependency>,
    fault: Fault,
    journal: Journal,
    releases: Arc<AtomicUsize>,
}

impl Service {
    fn new(id: &'static str, journal: &Journal) -> Self {
        Self {
            id,
            deps: Vec::new(),
            fault: Fault::None,
            journal: journal.clone(),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn requires(mut self, target: &str) -> Self {
        self.deps.push(Dependency::required(target));
        self
    }

    fn optionally(mut self, target: &str) -> Self {
        self.deps.push(Dependency::optional(target));
        self
    }

    fn fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    fn releases(mut self, counter: &Arc<AtomicUsize>) -> Self {
        self.releases = counter.clone();
        self
    }

    fn build(self) -> Arc<dyn Plugin> {
        Arc::new(self)
    }
}

impl Plugin for Service {
    fn id(&self) -> &str {
        self.id
    }

    fn dependencies(&self) -> Vec<Dependency> {
        self.deps.clone()
    }

    fn initialize(&self, ctx: &PluginContext) -> Result<()> {
        if self.fault == Fault::InitHang {
            std::thread::sleep(Duration::from_secs(3));
        }
        let releases = self.releases.clone();
        ctx.register_private_with_release("conn", format!("{}-conn", self.id), move || {
            releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
        self.journal.lock().push(format!("init:{}", self.id));
        Ok(())
    }

    fn start(&self) -> Result<()> {
        match self.fault {
            Fault::StartError => Err(Error::plugin(format!("{} refused to start", self.id))),
            Fault::StartPanic => panic!("{} exploded", self.id),
            _ => {
                self.journal.lock().push(format!("start:{}", self.id));
                Ok(())
            }
        }
    }

    fn stop(&self) -> Result<()> {
        self.journal.lock().push(format!("stop:{}", self.id));
        match self.fault {
            Fault::StopPanic => panic!("{} stop exploded", self.id),
            Fault::StopHang => {
                std::thread::sleep(Duration::from_secs(3));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn as_status_aware(&self) -> Option<&dyn StatusAware> {
        match self.fault {
            Fault::StatusPanicOnStop => Some(self),
            _ => None,
        }
    }
}

impl StatusAware for Service {
    fn set_status(&self, state: LifecycleState) {
        if state == LifecycleState::Stopping {
            panic!("{} status listener exploded", self.id);
        }
    }
}

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(journal: &Journal, prefix: &str) -> Vec<String> {
    journal
        .lock()
        .iter()
        .filter(|e| e.starts_with(prefix))
        .map(|e| e[prefix.len()..].to_string())
        .collect()
}

fn manager_with(settings: LifecycleSettings) -> PluginManager {
    PluginManager::new(
        Arc::new(Config::empty()),
        ManagerConfig::new().with_settings(settings),
    )
}

fn recording_sink() -> (Arc<LifecycleHooks>, Arc<Mutex<Vec<PluginEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let hooks = LifecycleHooks::new().with_handler(move |event| {
        sink_events.lock().push(event.clone());
    });
    (Arc::new(hooks), events)
}

// Resolution

#[test]
fn test_chain_resolves_in_dependency_order() {
    let j = journal();
    let plugins = vec![
        Service::new("c", &j).requires("b").build(),
        Service::new("a", &j).build(),
        Service::new("b", &j).requires("a").build(),
    ];

    let order = resolve(&plugins).unwrap();
    let ids: Vec<_> = order.iter().map(|p| (p.id(), p.level())).collect();
    assert_eq!(ids, vec![("a", 0), ("b", 1), ("c", 2)]);
}

#[test]
fn test_diamond_levels() {
    let j = journal();
    let plugins = vec![
        Service::new("a", &j).build(),
        Service::new("b", &j).requires("a").build(),
        Service::new("c", &j).requires("a").build(),
        Service::new("d", &j).requires("b").requires("c").build(),
    ];

    let order = resolve(&plugins).unwrap();
    let level = |id: &str| order.iter().find(|p| p.id() == id).map(|p| p.level());
    assert_eq!(level("a"), Some(0));
    assert_eq!(level("b"), Some(1));
    assert_eq!(level("c"), Some(1));
    assert_eq!(level("d"), Some(2));
}

#[test]
fn test_cycle_is_dependency_error() {
    let j = journal();
    let plugins = vec![
        Service::new("a", &j).requires("b").build(),
        Service::new("b", &j).requires("a").build(),
    ];

    let err = resolve(&plugins).unwrap_err();
    assert!(matches!(err, Error::CyclicDependency { .. }));
    assert_eq!(err.kind(), ErrorKind::Dependency);
}

#[test]
fn test_missing_and_optional_dependencies() {
    init_tracing();
    let j = journal();

    let manager = PluginManager::with_defaults();
    manager
        .register(Service::new("api", &j).requires("db").build())
        .unwrap();
    let err = manager.load().unwrap_err();
    assert!(err.is_dependency_error());
    let text = err.to_string();
    assert!(text.contains("api") && text.contains("db"));
    assert!(j.lock().is_empty());

    let manager = PluginManager::with_defaults();
    manager
        .register(Service::new("api", &j).optionally("metrics").build())
        .unwrap();
    manager.load().unwrap();
    assert_eq!(manager.status("api"), Some(LifecycleState::Active));
    manager.unload_all();
}

#[test]
fn test_duplicate_ids_rejected() {
    let j = journal();
    let plugins = vec![Service::new("a", &j).build(), Service::new("a", &j).build()];
    assert!(matches!(
        resolve(&plugins),
        Err(Error::DuplicatePlugin { .. })
    ));

    let manager = PluginManager::with_defaults();
    manager.register(Service::new("a", &j).build()).unwrap();
    assert!(matches!(
        manager.register(Service::new("a", &j).build()),
        Err(Error::PluginAlreadyRegistered(_))
    ));
}

// Load, rollback, unload

#[test]
fn test_load_and_unload_chain() {
    init_tracing();
    let j = journal();
    let manager = PluginManager::with_defaults();
    manager
        .register_all(vec![
            Service::new("c", &j).requires("b").build(),
            Service::new("b", &j).requires("a").build(),
            Service::new("a", &j).build(),
        ])
        .unwrap();

    manager.load().unwrap();
    assert_eq!(entries(&j, "start:"), vec!["a", "b", "c"]);
    assert_eq!(manager.stats().active, 3);
    assert_eq!(manager.plan().len(), 3);

    let summary = manager.unload_all();
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.stopped, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(entries(&j, "stop:"), vec!["c", "b", "a"]);
    assert_eq!(manager.stats().terminated, 3);
    assert_eq!(manager.resource_stats().total, 0);
}

#[test]
fn test_start_failure_rolls_back_in_reverse() {
    init_tracing();
    let j = journal();
    let released = Arc::new(AtomicUsize::new(0));
    let (sink, events) = recording_sink();

    let manager = manager_with(LifecycleSettings::new().with_start_parallelism(1))
        .with_event_sink(sink);
    manager
        .register_all(vec![
            Service::new("a", &j).releases(&released).build(),
            Service::new("b", &j).requires("a").releases(&released).build(),
            Service::new("c", &j).requires("a").releases(&released).build(),
            Service::new("d", &j)
                .requires("b")
                .requires("c")
                .fault(Fault::StartError)
                .releases(&released)
                .build(),
        ])
        .unwrap();

    let err = manager.load().unwrap_err();

    assert!(matches!(err, Error::StartupAborted { .. }));
    assert_eq!(err.plugin_id(), Some("d"));
    assert!(matches!(err.root_cause(), Error::Lifecycle { .. }));
    let report = err.rollback_report().unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 0);

    // One permit: journal order matches completion order.
    let started = entries(&j, "start:");
    let mut expected_stops: Vec<String> = started.clone();
    expected_stops.reverse();
    assert_eq!(entries(&j, "stop:"), expected_stops);
    assert_eq!(entries(&j, "stop:").last().map(String::as_str), Some("a"));
    assert!(!started.contains(&"d".to_string()));

    // All four private resources released: three by rollback, one after d failed.
    assert_eq!(released.load(Ordering::SeqCst), 4);
    assert_eq!(manager.resource_stats().total, 0);
    assert_eq!(manager.status("d"), Some(LifecycleState::Failed));
    assert_eq!(manager.status("a"), Some(LifecycleState::Terminated));

    let events = events.lock();
    let rollback = events
        .iter()
        .find(|e| e.kind == EventKind::RollbackCompleted)
        .unwrap();
    assert_eq!(rollback.plugin_id, MANAGER_EVENT_SOURCE);
    assert_eq!(rollback.get("total"), Some(&serde_json::json!(3)));
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::ErrorOccurred && e.plugin_id == "d"));
}

#[test]
fn test_failed_level_stops_later_levels() {
    init_tracing();
    let j = journal();
    let manager = PluginManager::with_defaults();
    manager
        .register_all(vec![
            Service::new("a", &j).build(),
            Service::new("b", &j)
                .requires("a")
                .fault(Fault::StartError)
                .build(),
            Service::new("c", &j).requires("b").build(),
        ])
        .unwrap();

    let err = manager.load().unwrap_err();

    assert_eq!(err.plugin_id(), Some("b"));
    assert_eq!(entries(&j, "init:"), vec!["a", "b"]);
    assert_eq!(entries(&j, "start:"), vec!["a"]);
    assert_eq!(manager.status("c"), Some(LifecycleState::Created));
    assert_eq!(err.rollback_report().unwrap().order(), vec!["a"]);
}

#[test]
fn test_status_listener_panic_during_rollback_is_contained() {
    init_tracing();
    let j = journal();
    let released = Arc::new(AtomicUsize::new(0));
    let manager = PluginManager::with_defaults();
    manager
        .register_all(vec![
            Service::new("a", &j).releases(&released).build(),
            Service::new("b", &j)
                .requires("a")
                .fault(Fault::StatusPanicOnStop)
                .releases(&released)
                .build(),
            Service::new("c", &j)
                .requires("b")
                .fault(Fault::StartError)
                .releases(&released)
                .build(),
        ])
        .unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| manager.load()));
    let err = result.expect("load must not panic").unwrap_err();

    assert!(matches!(err, Error::StartupAborted { .. }));
    assert_eq!(err.plugin_id(), Some("c"));
    assert_eq!(err.rollback_report().unwrap().order(), vec!["b", "a"]);
    assert_eq!(entries(&j, "stop:"), vec!["b", "a"]);
    assert_eq!(manager.status("a"), Some(LifecycleState::Terminated));
    assert_eq!(manager.status("b"), Some(LifecycleState::Terminated));
    assert_eq!(manager.status("c"), Some(LifecycleState::Failed));
    assert_eq!(released.load(Ordering::SeqCst), 3);
    assert_eq!(manager.resource_stats().total, 0);
}

#[test]
fn test_unload_survives_panicking_and_hanging_stop() {
    init_tracing();
    let j = journal();
    let manager = manager_with(
        LifecycleSettings::new().with_stop_timeout(Duration::from_millis(200)),
    );
    manager
        .register_all(vec![
            Service::new("a", &j).build(),
            Service::new("b", &j)
                .requires("a")
                .fault(Fault::StopPanic)
                .build(),
            Service::new("c", &j)
                .requires("a")
                .fault(Fault::StopHang)
                .build(),
        ])
        .unwrap();
    manager.load().unwrap();

    let began = Instant::now();
    let summary = manager.unload_all();
    assert!(began.elapsed() < Duration::from_secs(2), "took {:?}", began.elapsed());

    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.stopped, 1);
    assert_eq!(summary.failed, 2);
    assert!(!summary.deadline_exceeded);

    let mut failures = manager.unload_failures();
    failures.sort_by(|x, y| x.plugin_id.cmp(&y.plugin_id));
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].plugin_id, "b");
    assert!(failures[0].stop_error.as_deref().unwrap().contains("panic in stop"));
    assert_eq!(failures[1].plugin_id, "c");
    assert!(failures[1].stop_error.as_deref().unwrap().contains("stop timeout"));

    assert_eq!(entries(&j, "stop:").last().map(String::as_str), Some("a"));
    assert_eq!(manager.status("a"), Some(LifecycleState::Terminated));
    assert_eq!(manager.status("b"), Some(LifecycleState::Failed));
    assert_eq!(manager.resource_stats().total, 0);
}

#[test]
fn test_init_timeout_is_bounded() {
    init_tracing();
    let j = journal();
    let manager = manager_with(LifecycleSettings::new().with_init_timeout(Duration::from_secs(1)));
    manager
        .register(Service::new("slow", &j).fault(Fault::InitHang).build())
        .unwrap();

    let began = Instant::now();
    let err = manager.load().unwrap_err();
    let elapsed = began.elapsed();

    assert!(err.is_timeout());
    assert!(err.is_retryable());
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1800), "took {:?}", elapsed);
    assert_eq!(manager.status("slow"), Some(LifecycleState::Failed));
}

#[test]
fn test_start_panic_is_contained() {
    init_tracing();
    let j = journal();
    let manager = PluginManager::with_defaults();
    manager
        .register_all(vec![
            Service::new("base", &j).build(),
            Service::new("bomb", &j)
                .requires("base")
                .fault(Fault::StartPanic)
                .build(),
        ])
        .unwrap();

    let err = manager.load().unwrap_err();
    assert!(err.is_panic());
    match err.root_cause() {
        Error::Panic { plugin, message, .. } => {
            assert_eq!(plugin, "bomb");
            assert!(message.contains("bomb exploded"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(entries(&j, "stop:"), vec!["base"]);
}

#[test]
fn test_failed_plugins_are_not_reloaded() {
    let j = journal();
    let manager = PluginManager::with_defaults();
    manager
        .register(Service::new("x", &j).fault(Fault::StartError).build())
        .unwrap();

    assert!(manager.load().is_err());
    let err = manager.load().unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

// Resources

struct Sharer {
    id: &'static str,
}

impl Plugin for Sharer {
    fn id(&self) -> &str {
        self.id
    }

    fn initialize(&self, ctx: &PluginContext) -> Result<()> {
        ctx.register_private("cache", format!("{}-cache", self.id))?;
        if self.id == "writer" {
            ctx.register_shared("bus", String::from("event-bus"))?;
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_private_resources_independent_shared_visible() {
    let manager = PluginManager::with_defaults();
    manager
        .register_all(vec![
            Arc::new(Sharer { id: "writer" }) as Arc<dyn Plugin>,
            Arc::new(Sharer { id: "reader" }) as Arc<dyn Plugin>,
        ])
        .unwrap();
    manager.load().unwrap();

    let runtime = manager.runtime();
    let writer = runtime.for_plugin("writer");
    let reader = runtime.for_plugin("reader");

    assert_eq!(*writer.get_private::<String>("cache").unwrap(), "writer-cache");
    assert_eq!(*reader.get_private::<String>("cache").unwrap(), "reader-cache");
    assert_eq!(*reader.get_shared::<String>("bus").unwrap(), "event-bus");
    assert_eq!(*writer.get_shared::<String>("bus").unwrap(), "event-bus");
    assert!(matches!(
        reader.get_shared::<u32>("bus"),
        Err(Error::ResourceTypeMismatch { .. })
    ));

    let stats = manager.resource_stats();
    assert_eq!(stats.shared, 1);
    assert_eq!(stats.private, 2);

    assert_eq!(manager.resources().cleanup("writer").unwrap(), 2);
    assert_eq!(manager.resources().cleanup("writer").unwrap(), 0);
    assert!(reader.get_shared_value("bus").is_err());
    assert!(reader.get_private_value("cache").is_ok());
}

// Events

#[test]
fn test_lifecycle_events_in_order() {
    let j = journal();
    let (sink, events) = recording_sink();
    let manager = PluginManager::with_defaults().with_event_sink(sink);
    manager.register(Service::new("solo", &j).build()).unwrap();

    manager.load().unwrap();
    manager.unload_all();

    let kinds: Vec<EventKind> = events
        .lock()
        .iter()
        .filter(|e| e.plugin_id == "solo")
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Initializing,
            EventKind::Initialized,
            EventKind::Starting,
            EventKind::Started,
            EventKind::Stopping,
            EventKind::Stopped,
        ]
    );
    assert!(events
        .lock()
        .iter()
        .any(|e| e.kind == EventKind::ManagerShutdown && e.plugin_id == MANAGER_EVENT_SOURCE));
}

// Configuration and bootstrap

#[test]
fn test_settings_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.toml");
    std::fs::write(
        &path,
        r#"
[application]
name = "orders"
version = "2.1.0"

[plugins]
start_parallelism = 0
init_timeout = "250ms"
stop_timeout = "3s"
"#,
    )
    .unwrap();

    let app = Application::from_file(&path).unwrap();
    assert_eq!(app.name(), "orders");
    assert_eq!(app.version(), "2.1.0");

    let limits = app.manager().limits().unwrap();
    assert_eq!(limits.start_parallelism(), 8);
    assert_eq!(limits.init_timeout(), Duration::from_secs(1));
    assert_eq!(limits.stop_timeout(), Duration::from_secs(3));
}

#[test]
fn test_bootstrap_gate_publishes_once() {
    let gate = Arc::new(BootstrapGate::new());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let gate = gate.clone();
            std::thread::spawn(move || {
                gate.get_or_init(|| {
                    Application::new(Config::from_toml_str("[application]\nname = \"svc\"")?)
                })
            })
        })
        .collect();

    let apps: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert!(apps.iter().all(|a| Arc::ptr_eq(a, &apps[0])));
    assert_eq!(gate.attempts(), 1);
    assert_eq!(gate.get().map(|a| a.name().to_string()), Some("svc".into()));
}
