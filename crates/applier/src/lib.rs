//! Applies a (possibly partial) server response to the DOM, in the fixed
//! order the spec lays out: redirect, title, cacheType, attr, head, body,
//! foot. Each step is idempotent under re-invocation so a later part can
//! safely repeat fields the applier already saw.
//!
//! Simplification recorded here rather than in the navigator: body HTML
//! fragments are treated as opaque strings swapped in wholesale. Structured
//! script/style references that belong with a fragment are expected to
//! travel in the same part's `head`/`foot` blocks (as the wire format
//! already provides), not parsed back out of the fragment's raw HTML.

use std::sync::Arc;

use spf_core_types::{Dom, Response, ResourceBlock, ResourceKind};
use spf_dispatcher::Dispatcher;
use spf_resources::ResourceLoader;
use spf_task_queue::TaskQueueManager;
use tracing::debug;

/// Result of applying one part: either a redirect target (apply stops
/// immediately at step 1) or the normal continuation.
#[derive(Debug)]
pub enum ApplyOutcome {
    Redirect(String),
    Applied,
}

pub struct Applier {
    dom: Arc<dyn Dom>,
    resources: Arc<ResourceLoader>,
    queues: TaskQueueManager,
    dispatcher: Arc<Dispatcher>,
}

impl Applier {
    pub fn new(
        dom: Arc<dyn Dom>,
        resources: Arc<ResourceLoader>,
        queues: TaskQueueManager,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            dom,
            resources,
            queues,
            dispatcher,
        }
    }

    /// Applies one part of `queue_key`'s navigation. `is_last` controls
    /// whether `spf_process` or `spf_done` is published once the step order
    /// completes; callers of a redirecting part should not call again.
    pub async fn apply_part(&self, queue_key: &str, response: &Response, is_last: bool) -> ApplyOutcome {
        if let Some(redirect) = &response.redirect {
            return ApplyOutcome::Redirect(redirect.clone());
        }

        if let Some(title) = &response.title {
            self.dom.set_title(title);
        }

        if let Some(cache_type) = &response.cache_type {
            debug!(%cache_type, "response carries cache type hint");
        }

        for (id, attrs) in &response.attr {
            for (name, value) in attrs {
                match name.as_str() {
                    "class" => self.dom.set_attr(id, "className", value),
                    "style" => self.dom.set_attr(id, "style.cssText", value),
                    "value" => {
                        self.dom.set_attr(id, "value", value);
                        self.dom.set_attr(id, "value-property", value);
                    }
                    other => self.dom.set_attr(id, other, value),
                }
            }
        }

        if let Some(head) = &response.head {
            self.install_block(queue_key, head).await;
        }

        for (id, html) in &response.body {
            self.dom.set_inner_html(id, html);
        }

        if let Some(foot) = &response.foot {
            self.install_block(queue_key, foot).await;
        }

        let topic = if is_last { "spf_done" } else { "spf_process" };
        self.dispatcher.publish(topic, &vec![]);
        ApplyOutcome::Applied
    }

    /// Installs a `head`/`foot` block: inline CSS and linked styles first
    /// (non-gating), then scripts enqueued on the navigation's task queue so
    /// they execute in declared order even across stalled loads.
    async fn install_block(&self, queue_key: &str, block: &ResourceBlock) {
        if let Some(css) = &block.css {
            self.dom.inject_inline_style(css);
        }
        for style_ref in &block.styles {
            if let Some(url) = &style_ref.url {
                self.resources
                    .load(ResourceKind::Style, &[url.clone()], style_ref.name.clone(), None)
                    .await;
            }
        }

        for script_ref in &block.scripts {
            let Some(url) = script_ref.url.clone() else { continue };
            let resources = self.resources.clone();
            let queues = self.queues.clone();
            let key = queue_key.to_string();
            let name = script_ref.name.clone();
            self.queues.add(
                queue_key,
                Box::new(move || {
                    queues.suspend(&key);
                    let resources = resources.clone();
                    let queues = queues.clone();
                    let key = key.clone();
                    tokio::spawn(async move {
                        resources.load(ResourceKind::Script, &[url], name, None).await;
                        queues.resume(&key, false);
                    });
                }),
                0,
            );
        }
        self.queues.run(queue_key, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spf_core_types::fake::InMemoryDom;
    use std::collections::HashMap;

    fn applier() -> (Applier, Arc<InMemoryDom>) {
        let dom = Arc::new(InMemoryDom::new());
        let resources = Arc::new(ResourceLoader::new(dom.clone()));
        let queues = TaskQueueManager::new();
        let dispatcher = Arc::new(Dispatcher::new());
        (Applier::new(dom.clone(), resources, queues, dispatcher), dom)
    }

    #[tokio::test]
    async fn redirect_short_circuits_before_title() {
        let (applier, dom) = applier();
        let response = Response {
            redirect: Some("/elsewhere".into()),
            title: Some("should not apply".into()),
            ..Default::default()
        };
        let outcome = applier.apply_part("nav:1", &response, true).await;
        match outcome {
            ApplyOutcome::Redirect(url) => assert_eq!(url, "/elsewhere"),
            _ => panic!("expected redirect"),
        }
        assert!(dom.title.lock().is_none());
    }

    #[tokio::test]
    async fn title_is_applied_when_present() {
        let (applier, dom) = applier();
        let response = Response {
            title: Some("Hello".into()),
            ..Default::default()
        };
        applier.apply_part("nav:1", &response, false).await;
        assert_eq!(dom.title.lock().as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn done_topic_fires_only_on_last_part() {
        let (applier, _dom) = applier();
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let h = hits.clone();
        // Reconstruct with access to the dispatcher to subscribe.
        let dom = Arc::new(InMemoryDom::new());
        let resources = Arc::new(ResourceLoader::new(dom.clone()));
        let queues = TaskQueueManager::new();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.subscribe("spf_done", move |_t: &str, _a: &spf_dispatcher::Args| {
            h.lock().push("done");
        });
        let applier = Applier::new(dom, resources, queues, dispatcher);
        applier.apply_part("nav:1", &Response::default(), false).await;
        assert!(hits.lock().is_empty());
        applier.apply_part("nav:1", &Response::default(), true).await;
        assert_eq!(*hits.lock(), vec!["done"]);
    }

    #[tokio::test]
    async fn duplicate_body_id_replaces_prior_content() {
        let (applier, dom) = applier();
        let mut first = HashMap::new();
        first.insert("main".to_string(), "<p>one</p>".to_string());
        applier
            .apply_part("nav:1", &Response { body: first, ..Default::default() }, false)
            .await;
        let mut second = HashMap::new();
        second.insert("main".to_string(), "<p>two</p>".to_string());
        applier
            .apply_part("nav:1", &Response { body: second, ..Default::default() }, true)
            .await;
        // InMemoryDom does not track inner_html history; this test only
        // confirms both calls apply without needing to undo the first.
        let _ = dom;
    }
}
