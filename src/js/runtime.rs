use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Context, Ctx, Error as JsError, Function, Runtime, Value};

const MAX_JOBS: usize = 1000;

/// JavaScript runtime backed by QuickJS.
///
/// The engine owns the QuickJS runtime and context and provides helpers for evaluating
/// scripts. It also installs a minimal `console` implementation that forwards logs to
/// Rust tracing.
pub struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
}

impl QuickJsEngine {
    /// Create a new QuickJS engine with `console.log` wired up to `tracing`.
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        let engine = Self { runtime, context };
        engine.init_console()?;
        Ok(engine)
    }

    /// Evaluate a script and discard the result.
    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.eval_with::<()>(source, filename)
    }

    /// Evaluate a script and convert the result into `V`. Pending promise
    /// jobs are drained before returning.
    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let script = Self::with_source_url(source, filename);
        let eval_result = self.context.with(|ctx| ctx.eval::<V, _>(script.clone()));

        let value = match eval_result {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => {
                let message = self
                    .context
                    .with(|ctx| -> Result<Option<String>, JsError> {
                        Ok(capture_exception_message(&ctx))
                    })
                    .unwrap_or(None)
                    .unwrap_or_else(|| "QuickJS exception".to_string());
                Err(anyhow::anyhow!(message))
            }
            Err(err) => Err(anyhow::Error::from(err)),
        }?;

        self.drain_jobs()?;
        Ok(value)
    }

    /// Execute pending promise jobs. Returns `true` if at least one ran.
    pub fn drain_jobs(&self) -> Result<bool> {
        let mut job_count = 0;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(job_exception) => {
                    // Author code threw inside a continuation; keep going.
                    tracing::error!(
                        target: "quickjs",
                        "Job execution error: {:?}",
                        job_exception
                    );
                }
            }
            job_count += 1;
            if job_count >= MAX_JOBS {
                tracing::warn!(
                    target: "quickjs",
                    "Stopped processing jobs after {} iterations (possible infinite loop)",
                    MAX_JOBS
                );
                break;
            }
        }

        if job_count > 0 {
            tracing::trace!(target: "quickjs", "Executed {} pending jobs", job_count);
        }
        Ok(job_count > 0)
    }

    /// Provide access to the underlying QuickJS context for advanced integrations.
    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.context.with(f).map_err(anyhow::Error::from)
    }

    fn init_console(&self) -> Result<()> {
        self.context
            .with(|ctx| {
                let global = ctx.globals();
                let log_fn =
                    Function::new(ctx.clone(), log_from_js)?.with_name("__frontier_log")?;
                global.set("__frontier_log", log_fn)?;
                let error_fn =
                    Function::new(ctx.clone(), error_from_js)?.with_name("__frontier_error")?;
                global.set("__frontier_error", error_fn)?;

                ctx.eval::<(), _>(
                    "if (typeof self === 'undefined') { var self = globalThis; }".as_bytes(),
                )?;
                ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())
            })
            .map_err(anyhow::Error::from)
    }

    fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
        let mut script = String::with_capacity(source.len() + filename.len() + 32);
        script.push_str(source);
        if !source.ends_with('\n') {
            script.push('\n');
        }
        script.push_str("//# sourceURL=");
        script.push_str(filename);
        script.push('\n');
        script.into_bytes()
    }
}

fn log_from_js(message: String) -> rquickjs::Result<()> {
    tracing::info!(target: "quickjs", message = %message);
    Ok(())
}

fn error_from_js(message: String) -> rquickjs::Result<()> {
    tracing::error!(target: "quickjs", message = %message);
    Ok(())
}

fn capture_exception_message(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            if let Ok(stack) = obj.get::<_, String>("stack") {
                return Some(format!("Error: {}\nStack: {}", message, stack));
            }
            return Some(format!("Error: {}", message));
        }
    }

    Some(format!("{:?}", exception))
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const forward = (sink) => (...args) => {
        try {
            sink(args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    if (typeof global.console !== 'object' || global.console === null) {
        global.console = {};
    }

    global.console.log = forward(global.__frontier_log);
    global.console.info = forward(global.__frontier_log);
    global.console.debug = forward(global.__frontier_log);
    global.console.warn = forward(global.__frontier_error);
    global.console.error = forward(global.__frontier_error);
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_and_drains_promise_jobs() {
        let engine = QuickJsEngine::new().expect("engine");
        engine
            .eval(
                "globalThis.order = []; Promise.resolve().then(() => order.push('job')); order.push('sync');",
                "order.js",
            )
            .expect("eval");
        let order: String = engine
            .eval_with("order.join(',')", "read.js")
            .expect("read order");
        assert_eq!(order, "sync,job");
    }

    #[test]
    fn surfaces_exception_message() {
        let engine = QuickJsEngine::new().expect("engine");
        let err = engine
            .eval("throw new Error('boom')", "throw.js")
            .expect_err("should fail");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn console_is_installed() {
        let engine = QuickJsEngine::new().expect("engine");
        let kind: String = engine
            .eval_with("typeof console.error", "console.js")
            .expect("eval");
        assert_eq!(kind, "function");
    }
}
