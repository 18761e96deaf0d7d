//! In-process template snapshots: readers share an `Arc<Template>`, writers are
//! serialized and publish a whole new snapshot.

use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::models::Template;

pub struct TemplateCache {
    current: RwLock<Arc<Template>>,
    writer: Mutex<()>,
}

impl TemplateCache {
    pub fn new(template: Template) -> Self {
        Self {
            current: RwLock::new(Arc::new(template)),
            writer: Mutex::new(()),
        }
    }

    /// Immutable snapshot; later updates never touch it.
    pub fn snapshot(&self) -> Arc<Template> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Build a new snapshot from the current one and swap it in.
    /// Writers run one at a time; readers are never blocked by `change`.
    pub fn update<R>(&self, change: impl FnOnce(&Template) -> Result<(Template, R)>) -> Result<R> {
        let _writer = self
            .writer
            .lock()
            .map_err(|e| Error::Config(format!("template writer lock poisoned: {}", e)))?;
        let base = self.snapshot();
        let (next, outcome) = change(&base)?;
        let mut guard = self
            .current
            .write()
            .map_err(|e| Error::Config(format!("template cache lock poisoned: {}", e)))?;
        *guard = Arc::new(next);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn template() -> Template {
        Template::from_value(json!({ "ocrMapping": {}, "structure": {} })).unwrap()
    }

    #[test]
    fn old_snapshots_are_unaffected_by_updates() {
        let cache = TemplateCache::new(template());
        let before = cache.snapshot();
        cache
            .update(|t| {
                let mut next = t.clone();
                next.mapping_format = Some("hybrid-v1".to_string());
                Ok((next, ()))
            })
            .unwrap();
        assert!(before.mapping_format.is_none());
        assert_eq!(cache.snapshot().mapping_format.as_deref(), Some("hybrid-v1"));
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let cache = Arc::new(TemplateCache::new(template()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    cache
                        .update(|t| {
                            let mut next = t.clone();
                            let n = next.extra.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
                            next.extra.insert("n".to_string(), json!(n + 1));
                            Ok((next, ()))
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.snapshot().extra.get("n"), Some(&json!(8)));
    }

    #[test]
    fn failed_update_keeps_current_snapshot() {
        let cache = TemplateCache::new(template());
        let result: Result<()> = cache.update(|_| Err(Error::NotFound("field".to_string())));
        assert!(result.is_err());
        assert!(cache.snapshot().mapping_format.is_none());
    }
}
