//! The restricted global scope the Executor evaluates user scripts in.
//!
//! Grounded on `rift-http-proxy`'s `rhai_engine.rs`: a custom type is
//! registered on the `Engine` with a handful of methods, exactly the shape
//! used there for `ScriptFlowStore`. Here the registered type is `PageHandle`,
//! a synchronous facade over a chromiumoxide `Page` that re-enters the
//! tokio runtime via `Handle::block_on` from inside the `spawn_blocking`
//! task the Executor runs the whole script under.

use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::Page;
use rhai::{Dynamic, Engine};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Thin synchronous wrapper the script's `page` global is bound to. Every
/// method blocks the current (blocking-pool) thread on the async chromiumoxide
/// call; this is safe because the Executor always calls `run_script` inside
/// `spawn_blocking`, never directly on a worker task. `cancel` is fired by
/// the Executor once a job's timeout elapses, so a method stuck awaiting the
/// browser returns instead of pinning the thread past the deadline.
#[derive(Clone)]
pub struct PageHandle {
    page: Arc<Page>,
    handle: Handle,
    cancel: CancellationToken,
}

impl PageHandle {
    pub fn new(page: Arc<Page>, handle: Handle, cancel: CancellationToken) -> Self {
        Self { page, handle, cancel }
    }

    /// Drives `fut` on the runtime, racing it against `cancel`. Every
    /// chromiumoxide call in this module goes through here instead of a bare
    /// `block_on` so a timed-out job's script thread actually returns.
    fn run_cancellable<F, T>(&self, fut: F) -> Result<T, Box<rhai::EvalAltResult>>
    where
        F: std::future::Future<Output = Result<T, chromiumoxide::error::CdpError>>,
    {
        let cancel = self.cancel.clone();
        self.handle
            .block_on(async move {
                tokio::select! {
                    res = fut => res.map_err(|e| e.to_string()),
                    _ = cancel.cancelled() => Err("execution cancelled".to_string()),
                }
            })
            .map_err(rhai_err_str)
    }

    pub fn goto(&mut self, url: &str) -> Result<(), Box<rhai::EvalAltResult>> {
        let page = self.page.clone();
        let url = url.to_string();
        self.run_cancellable(async move {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            Ok(())
        })
    }

    pub fn title(&mut self) -> Result<String, Box<rhai::EvalAltResult>> {
        let page = self.page.clone();
        self.run_cancellable(async move { page.get_title().await })
            .map(|t| t.unwrap_or_default())
    }

    pub fn url(&mut self) -> Result<String, Box<rhai::EvalAltResult>> {
        let page = self.page.clone();
        self.run_cancellable(async move { page.url().await })
            .map(|u| u.unwrap_or_default())
    }

    pub fn click(&mut self, selector: &str) -> Result<(), Box<rhai::EvalAltResult>> {
        let page = self.page.clone();
        let selector = selector.to_string();
        self.run_cancellable(async move {
            let element = page.find_element(&selector).await?;
            element.click().await?;
            Ok(())
        })
    }

    pub fn fill(&mut self, selector: &str, value: &str) -> Result<(), Box<rhai::EvalAltResult>> {
        let page = self.page.clone();
        let selector = selector.to_string();
        let value = value.to_string();
        self.run_cancellable(async move {
            let element = page.find_element(&selector).await?;
            element.click().await?;
            element.type_str(value).await?;
            Ok(())
        })
    }

    pub fn text_content(&mut self, selector: &str) -> Result<String, Box<rhai::EvalAltResult>> {
        let page = self.page.clone();
        let selector = selector.to_string();
        self.run_cancellable(async move {
            let element = page.find_element(&selector).await?;
            element.inner_text().await
        })
        .map(|t| t.unwrap_or_default())
    }

    pub fn wait_for_selector(&mut self, selector: &str) -> Result<(), Box<rhai::EvalAltResult>> {
        let page = self.page.clone();
        let selector = selector.to_string();
        self.run_cancellable(async move {
            page.find_element(&selector).await?;
            Ok(())
        })
    }

    pub fn evaluate(&mut self, script: &str) -> Result<Dynamic, Box<rhai::EvalAltResult>> {
        let page = self.page.clone();
        let script = script.to_string();
        let value: serde_json::Value =
            self.run_cancellable(async move { page.evaluate(script).await?.into_value() })?;
        rhai::serde::to_dynamic(&value).map_err(|e| rhai_err_str(e.to_string()))
    }

    /// Sleeps in short increments so a cancelled job doesn't sit out the
    /// whole duration before the thread notices.
    pub fn sleep_ms(&mut self, ms: i64) {
        let mut remaining = ms.max(0) as u64;
        while remaining > 0 {
            if self.cancel.is_cancelled() {
                return;
            }
            let step = remaining.min(50);
            std::thread::sleep(Duration::from_millis(step));
            remaining -= step;
        }
    }
}

fn rhai_err_str(msg: String) -> Box<rhai::EvalAltResult> {
    Box::new(rhai::EvalAltResult::ErrorRuntime(msg.into(), rhai::Position::NONE))
}

/// Builds the Engine a script runs under: `page` plus Rhai's own builtins
/// (strings, numbers, arrays, maps, control flow) and nothing else. No
/// module resolver is installed, so `import` statements fail to resolve.
/// `cancel` is polled via `on_progress` so a script stuck in a tight loop
/// (not just one blocked on a `page` call) also terminates on timeout.
pub fn build_engine(cancel: CancellationToken) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_expr_depth(64, 64);
    engine.set_max_operations(50_000_000);
    engine.on_progress(move |_ops| {
        if cancel.is_cancelled() {
            Some(Dynamic::from("execution cancelled".to_string()))
        } else {
            None
        }
    });

    engine
        .register_type_with_name::<PageHandle>("Page")
        .register_fn("goto", PageHandle::goto)
        .register_fn("title", PageHandle::title)
        .register_fn("url", PageHandle::url)
        .register_fn("click", PageHandle::click)
        .register_fn("fill", PageHandle::fill)
        .register_fn("text_content", PageHandle::text_content)
        .register_fn("wait_for_selector", PageHandle::wait_for_selector)
        .register_fn("evaluate", PageHandle::evaluate)
        .register_fn("sleep_ms", PageHandle::sleep_ms);

    engine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_rejects_import_statements() {
        let engine = build_engine(CancellationToken::new());
        let result = engine.compile("import \"whatever\" as x; fn main() { 1 }");
        assert!(result.is_err());
    }

    #[test]
    fn engine_compiles_a_plain_script() {
        let engine = build_engine(CancellationToken::new());
        let result = engine.compile("fn main() { #{ok: true} }");
        assert!(result.is_ok());
    }
}
