//! Script Globals
//!
//! Registers `console`, the `bot` object and the helper functions the engine
//! uses to call handlers and settle promises.

use std::time::Duration;

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value as JsValue};

use crate::outbound::OutboundSlot;

/// Helpers evaluated into every engine before user code
///
/// `__settle` runs a global function and stores `{ok, value}` or `{ok, error}`
/// in `__outcome` once the returned value (or promise) settles.
const PRELUDE: &str = r#"
globalThis.__describeError = function (err) {
  if (err instanceof Error) {
    return err.name + ': ' + err.message;
  }
  return String(err);
};

globalThis.__settle = function (target, args) {
  globalThis.__outcome = undefined;
  Promise.resolve()
    .then(() => {
      const fn = typeof target === 'function' ? target : globalThis[target];
      if (typeof fn !== 'function') {
        throw new Error(String(target) + ' is not a function');
      }
      return fn.apply(null, args);
    })
    .then(
      (value) => { globalThis.__outcome = { ok: true, value: value === undefined ? null : value }; },
      (err) => { globalThis.__outcome = { ok: false, error: __describeError(err) }; }
    );
};

globalThis.__installDeps = function (names) {
  const deps = {};
  for (const name of names) {
    deps[name] = new Proxy({}, {
      get: (_, method) => {
        if (typeof method !== 'string' || method === 'then') {
          return undefined;
        }
        return (...args) => {
          const reply = JSON.parse(__serviceCall(name, method, JSON.stringify(args)));
          if (!reply.ok) {
            throw new Error(reply.error);
          }
          return reply.value;
        };
      },
    });
  }
  globalThis.__deps = deps;
  return names.length;
};

globalThis.__invokeHandler = function (message) {
  return handleMessage(message, globalThis.__deps || {});
};

globalThis.__hasServiceMethod = function (method) {
  const service = globalThis.service;
  return !!service && typeof service[method] === 'function';
};

globalThis.__callServiceMethod = function (method, args) {
  const service = globalThis.service;
  return service[method].apply(service, args);
};
"#;

/// What a script can see of its host
#[derive(Clone, Default)]
pub struct ScriptGlobals {
    /// Plugin or service name, exposed as `bot.pluginName`
    pub name: String,
    /// Exposed as `bot.executionId` for plugin invocations
    pub execution_id: Option<String>,
    /// Enables `bot.sendMessage(channelId, content)`
    pub outbound: Option<OutboundSlot>,
}

impl ScriptGlobals {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    pub fn with_outbound(mut self, outbound: OutboundSlot) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub(crate) fn register(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        register_console(ctx, &self.name)?;

        let bot = Object::new(ctx.clone())?;
        bot.set("pluginName", self.name.as_str())?;
        if let Some(id) = &self.execution_id {
            bot.set("executionId", id.as_str())?;
        }

        let name = self.name.clone();
        bot.set(
            "log",
            Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
                tracing::info!(target: "plugin", script = %name, "{}", join_args(args));
            })?,
        )?;

        // Blocks only the thread that owns this engine
        bot.set(
            "sleep",
            Function::new(ctx.clone(), |ms: Coerced<f64>| {
                let ms = ms.0;
                if ms.is_finite() && ms > 0.0 {
                    std::thread::sleep(Duration::from_secs_f64(ms / 1000.0));
                }
            })?,
        )?;

        if let Some(outbound) = self.outbound.clone() {
            bot.set(
                "sendMessage",
                Function::new(ctx.clone(), move |channel: String, content: String| {
                    outbound.send_message(&channel, &content)
                })?,
            )?;
        }

        ctx.globals().set("bot", bot)?;
        let _: JsValue = ctx.eval(PRELUDE)?;
        Ok(())
    }
}

fn join_args(args: Rest<Coerced<String>>) -> String {
    args.0
        .into_iter()
        .map(|arg| arg.0)
        .collect::<Vec<_>>()
        .join(" ")
}

fn register_console(ctx: &Ctx<'_>, name: &str) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;

    let script = name.to_string();
    console.set(
        "log",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::info!(target: "plugin", script = %script, "{}", join_args(args));
        })?,
    )?;

    let script = name.to_string();
    console.set(
        "info",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::info!(target: "plugin", script = %script, "{}", join_args(args));
        })?,
    )?;

    let script = name.to_string();
    console.set(
        "warn",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::warn!(target: "plugin", script = %script, "{}", join_args(args));
        })?,
    )?;

    let script = name.to_string();
    console.set(
        "error",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::error!(target: "plugin", script = %script, "{}", join_args(args));
        })?,
    )?;

    ctx.globals().set("console", console)?;
    Ok(())
}
