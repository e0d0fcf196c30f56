//! Demo: leveled startup, a failing plugin, and rollback.

use std::sync::Arc;
use std::time::Duration;

use stagehand::{
    Application, Config, Dependency, LifecycleHooks, ManagerConfig, Plugin, PluginContext,
    PluginManager, Result,
};

struct Service {
    id: &'static str,
    requires: Vec<&'static str>,
    fail_start: bool,
}

impl Plugin for Service {
    fn id(&self) -> &str {
        self.id
    }

    fn dependencies(&self) -> Vec<Dependency> {
        self.requires.iter().map(|d| Dependency::required(*d)).collect()
    }

    fn initialize(&self, ctx: &PluginContext) -> Result<()> {
        ctx.register_private("started_by", ctx.plugin_id().to_string())?;
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if self.fail_start {
            return Err(stagehand::Error::plugin("port already in use"));
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

fn service(id: &'static str, requires: &[&'static str], fail_start: bool) -> Arc<dyn Plugin> {
    Arc::new(Service {
        id,
        requires: requires.to_vec(),
        fail_start,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_toml_str(
        r#"
[application]
name = "stagehand-demo"
version = "0.1.0"

[plugins]
start_parallelism = 4
init_timeout = "2s"
start_timeout = "2s"
"#,
    )?;

    println!("=== Successful Load ===\n");

    let app = Application::new(config.clone())?;
    let manager = app.manager();
    manager.register_all(vec![
        service("database", &[], false),
        service("cache", &["database"], false),
        service("search", &["database"], false),
        service("http", &["cache", "search"], false),
    ])?;
    manager.load()?;

    for planned in manager.plan() {
        println!("  level {}: {}", planned.level(), planned.id());
    }
    let summary = manager.unload_all();
    println!("\nUnloaded {}/{} plugins", summary.stopped, summary.attempted);

    println!("\n=== Failed Load With Rollback ===\n");

    let hooks = LifecycleHooks::new().with_handler(|event| {
        println!("  event {} from {}", event.kind.name(), event.plugin_id);
    });
    let manager = PluginManager::new(Arc::new(config), ManagerConfig::default())
        .with_event_sink(Arc::new(hooks));
    manager.register_all(vec![
        service("database", &[], false),
        service("http", &["database"], true),
    ])?;

    match manager.load() {
        Ok(()) => println!("unexpected success"),
        Err(e) => {
            println!("\nload failed: {}", e);
            if let Some(report) = e.rollback_report() {
                println!("{}", report);
            }
        }
    }

    Ok(())
}
