//! Hot reload of the safety rules file.
//!
//! The watcher observes the file's parent directory (editors replace files
//! rather than writing in place) and reloads after a short settle delay. A
//! file that fails to parse is logged and the previous rules stay active.

use crate::events::EventBus;
use crate::safety::SafetyController;
use chaos_common::{ConfigError, load_rules_file};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Load `path` and swap it in. On error the current rules are kept.
pub fn reload_now(
    path: &Path,
    safety: &SafetyController,
    events: &EventBus,
) -> Result<usize, ConfigError> {
    match load_rules_file(path) {
        Ok(rules) => {
            let count = rules.len();
            safety.replace_rules(rules);
            events.emit(
                "rules_reloaded",
                &json!({ "path": path.display().to_string(), "rules": count }),
            );
            Ok(count)
        }
        Err(e) => {
            warn!(path = %path.display(), "Keeping previous safety rules: {}", e);
            Err(e)
        }
    }
}

/// Keeps the filesystem watcher and its reload task alive.
pub struct RulesWatcher {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for RulesWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn watch_rules(
    path: PathBuf,
    safety: Arc<SafetyController>,
    events: EventBus,
) -> notify::Result<RulesWatcher> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "watching safety rules file");

    let task = tokio::spawn(async move {
        while let Some(res) = rx.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("Rules watcher error: {}", e);
                    continue;
                }
            };
            if !touches(&event, &path) {
                continue;
            }
            tokio::time::sleep(SETTLE_DELAY).await;
            while rx.try_recv().is_ok() {}
            debug!(path = %path.display(), "rules file changed; reloading");
            if let Ok(count) = reload_now(&path, &safety, &events) {
                info!(rules = count, "safety rules reloaded");
            }
        }
    });

    Ok(RulesWatcher {
        _watcher: watcher,
        task,
    })
}

fn touches(event: &Event, path: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == path.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ChaosMetrics;
    use chaos_common::SafetyConfig;
    use chaos_telemetry::ScriptedTelemetrySource;
    use std::fs;

    const TWO_RULES: &str = r#"
[[rules]]
id = "mem"
metric = "memory_percent"
comparator = ">"
threshold = 90.0
action = "ABORT"

[[rules]]
id = "load"
metric = "load_average"
comparator = ">="
threshold = 16.0
action = "WARN"
"#;

    fn controller() -> SafetyController {
        SafetyController::new(
            Arc::new(ScriptedTelemetrySource::constant(0.0, 0.0)),
            chaos_common::default_rules(),
            SafetyConfig::default(),
            ChaosMetrics::standalone().unwrap(),
        )
    }

    #[tokio::test]
    async fn reload_replaces_rules_and_emits_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        fs::write(&path, TWO_RULES).unwrap();

        let safety = controller();
        let events = EventBus::default();
        let mut rx = events.subscribe();

        assert_eq!(reload_now(&path, &safety, &events).unwrap(), 2);
        assert_eq!(safety.rules().len(), 2);
        let event: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["event"], "rules_reloaded");
        assert_eq!(event["data"]["rules"], 2);
    }

    #[test]
    fn broken_file_keeps_previous_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        fs::write(&path, "[[rules]]\nid = \"half\"\n").unwrap();

        let safety = controller();
        let before = safety.rules();
        assert!(reload_now(&path, &safety, &EventBus::default()).is_err());
        assert_eq!(*safety.rules(), *before);
    }

    #[test]
    fn only_events_for_the_rules_file_count() {
        let path = PathBuf::from("/etc/chaos/rules.toml");
        let modify = |p: &str| {
            Event::new(EventKind::Modify(notify::event::ModifyKind::Any)).add_path(PathBuf::from(p))
        };
        assert!(touches(&modify("/etc/chaos/rules.toml"), &path));
        assert!(!touches(&modify("/etc/chaos/other.toml"), &path));
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(path.clone());
        assert!(!touches(&access, &path));
    }
}
