//! Execution contexts and the worklet runtime.
//!
//! Every Lua state the bridge touches is tagged with an [`ExecutionContext`]
//! stored as Lua app data. The worklet context owns a second Lua state that
//! lives on its own thread; other threads reach it only by sending jobs.
//!
//! ```text
//! main thread                       worklet thread
//! ───────────                       ──────────────
//! Lua (ctx-1, Js)                   Lua (ctx-2, Worklet)
//!   setFrameProcessor(f) ──dump──▶  load bytecode ─▶ RegistryKey
//!   process_frame(frame) ──job───▶  call worklet(frame)
//! ```

use crate::config::WorkletConfig;
use crate::error::{BridgeError, Result};
use crossbeam::channel::{self, Sender};
use mlua::{Function, Lua, LuaOptions, RegistryKey, StdLib, Table, Value};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, warn};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one Lua state (one heap, one thread of execution).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// The main scripting runtime
    Js,
    /// The background runtime frame processors run in
    Worklet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    pub id: ContextId,
    pub kind: ContextKind,
}

impl ExecutionContext {
    /// Tag `lua` with a fresh context, or return the tag it already carries.
    pub fn attach(lua: &Lua, kind: ContextKind) -> Self {
        if let Some(existing) = Self::of(lua) {
            if existing.kind != kind {
                warn!(
                    context = %existing.id,
                    existing = ?existing.kind,
                    requested = ?kind,
                    "Lua state already attached with a different context kind"
                );
            }
            return existing;
        }
        let context = Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
        };
        lua.set_app_data(context);
        context
    }

    pub fn of(lua: &Lua) -> Option<Self> {
        lua.app_data_ref::<Self>().map(|context| *context)
    }
}

type Job = Box<dyn FnOnce(&Lua) + Send + 'static>;

/// `debug.getupvalue` of the worklet state, unreachable from scripts.
struct UpvalueInspector(RegistryKey);

/// Safe standard libraries, but with binary chunk loading enabled.
///
/// Safe-mode states refuse bytecode. The only bytecode this state ever
/// loads is produced by `lua_dump` in this process with the same vendored
/// Lua build, never read from outside.
#[allow(unsafe_code)]
fn new_worklet_lua() -> mlua::Result<Lua> {
    // SAFETY: no C modules or `ffi` are loaded. The `debug` library is opened
    // only to keep `getupvalue` for the runtime and is removed from the
    // globals and `package.loaded` before any script runs. Bytecode comes
    // only from `Function::dump` in `create_worklet`.
    let lua = unsafe {
        Lua::unsafe_new_with(StdLib::ALL_SAFE | StdLib::DEBUG, LuaOptions::default())
    };
    hide_debug_library(&lua)?;
    Ok(lua)
}

fn hide_debug_library(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let debug: Table = globals.get("debug")?;
    let getupvalue: Function = debug.get("getupvalue")?;
    let key = lua.create_registry_value(getupvalue)?;
    globals.set("debug", Value::Nil)?;
    let package: Table = globals.get("package")?;
    let loaded: Table = package.get("loaded")?;
    loaded.set("debug", Value::Nil)?;
    lua.set_app_data(UpvalueInspector(key));
    Ok(())
}

/// Names of the upvalues of `function` other than `_ENV`.
///
/// A dumped function reloaded in another state keeps its upvalue slots but
/// not their values, so any such name is a local that did not make the trip.
fn captured_locals(lua: &Lua, function: &Function<'_>) -> Result<Vec<String>> {
    let getupvalue: Function = {
        let inspector = lua
            .app_data_ref::<UpvalueInspector>()
            .ok_or_else(|| BridgeError::Worklet("worklet state cannot inspect upvalues".into()))?;
        lua.registry_value(&inspector.0)?
    };
    let mut captured = Vec::new();
    for index in 1_i64.. {
        let (name, _): (Option<String>, Value) = getupvalue.call((function.clone(), index))?;
        match name {
            None => break,
            Some(name) if name == "_ENV" => {}
            Some(name) => captured.push(name),
        }
    }
    Ok(captured)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// A Lua state confined to a dedicated thread.
pub struct WorkletRuntime {
    context: ExecutionContext,
    thread_id: ThreadId,
    jobs: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkletRuntime {
    pub fn spawn(config: &WorkletConfig) -> Result<Self> {
        let (job_tx, job_rx) = channel::unbounded::<Job>();
        let (ready_tx, ready_rx) = channel::bounded(1);

        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let lua = match new_worklet_lua() {
                    Ok(lua) => lua,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let context = ExecutionContext::attach(&lua, ContextKind::Worklet);
                if ready_tx.send(Ok(context)).is_err() {
                    return;
                }
                debug!(context = %context.id, "Worklet runtime started");
                for job in job_rx.iter() {
                    // Jobs from `run_sync` catch their own panics; this keeps
                    // the loop alive for anything else.
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&lua))) {
                        error!(
                            context = %context.id,
                            panic = panic_message(&*payload),
                            "Worklet job panicked"
                        );
                    }
                }
                debug!(context = %context.id, "Worklet runtime stopped");
            })
            .map_err(|err| BridgeError::Worklet(format!("failed to spawn worklet thread: {err}")))?;

        let thread_id = thread.thread().id();
        let context = ready_rx
            .recv()
            .map_err(|_| BridgeError::Worklet("worklet thread exited during startup".into()))??;

        Ok(Self {
            context,
            thread_id,
            jobs: Some(job_tx),
            thread: Some(thread),
        })
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `f` against the worklet Lua state and wait for its result.
    ///
    /// Fails instead of deadlocking when called from the worklet thread. A
    /// panic inside `f` comes back as [`BridgeError::Worklet`] and leaves the
    /// runtime running.
    pub fn run_sync<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Lua) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current_thread() {
            return Err(BridgeError::Worklet(
                "re-entrant dispatch from the worklet thread onto itself".into(),
            ));
        }
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| BridgeError::Worklet("worklet runtime is shut down".into()))?;

        let (result_tx, result_rx) = channel::bounded(1);
        let context = self.context.id;
        let job: Job = Box::new(move |lua: &Lua| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(lua)));
            let outcome = outcome.unwrap_or_else(|payload| {
                let message = panic_message(&*payload);
                error!(context = %context, panic = message, "Worklet job panicked");
                Err(BridgeError::Worklet(format!("worklet job panicked: {message}")))
            });
            let _ = result_tx.send(outcome);
        });
        jobs.send(job)
            .map_err(|_| BridgeError::Worklet("worklet thread has stopped".into()))?;

        result_rx
            .recv()
            .map_err(|_| BridgeError::Worklet("worklet job was dropped before completing".into()))?
    }
}

impl Drop for WorkletRuntime {
    fn drop(&mut self) {
        self.jobs.take();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if self.is_current_thread() {
            warn!(
                context = %self.context.id,
                "Worklet runtime dropped on its own thread; detaching"
            );
            return;
        }
        if thread.join().is_err() {
            error!(context = %self.context.id, "Worklet thread panicked");
        }
    }
}

/// A Lua function owned by the worklet context.
///
/// Only the worklet Lua state can execute it; other contexts hold this
/// handle, never the function.
pub struct Worklet {
    key: RegistryKey,
    context: ContextId,
}

impl Worklet {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub(crate) fn function<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Function<'lua>> {
        lua.registry_value(&self.key)
    }
}

impl fmt::Debug for Worklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worklet")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

type ErrorHandler = dyn Fn(&BridgeError) + Send + Sync + 'static;

/// The pair of execution contexts the bridge works across.
///
/// Owns the worklet runtime; the main ("JS") Lua state belongs to the
/// embedder and is only identified here.
pub struct WorkletContext {
    runtime: WorkletRuntime,
    js_context: OnceLock<ExecutionContext>,
    error_count: AtomicU64,
    error_handler: RwLock<Option<Arc<ErrorHandler>>>,
}

impl WorkletContext {
    pub fn new(config: &WorkletConfig) -> Result<Self> {
        Ok(Self {
            runtime: WorkletRuntime::spawn(config)?,
            js_context: OnceLock::new(),
            error_count: AtomicU64::new(0),
            error_handler: RwLock::new(None),
        })
    }

    /// Tag `lua` as the main context and remember it.
    pub fn attach_js_runtime(&self, lua: &Lua) -> ExecutionContext {
        let context = ExecutionContext::attach(lua, ContextKind::Js);
        let bound = *self.js_context.get_or_init(|| context);
        if bound.id != context.id {
            warn!(
                bound = %bound.id,
                attached = %context.id,
                "Worklet context is already bound to another JS runtime"
            );
        }
        context
    }

    pub fn js_context(&self) -> Option<ExecutionContext> {
        self.js_context.get().copied()
    }

    pub fn worklet_context(&self) -> ExecutionContext {
        self.runtime.context()
    }

    pub fn is_worklet_thread(&self) -> bool {
        self.runtime.is_current_thread()
    }

    /// Run `f` on the worklet thread and wait for it.
    pub fn run_on_worklet<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Lua) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.runtime.run_sync(f)
    }

    /// Move `function` into the worklet context.
    ///
    /// Functions from another context are dumped to bytecode and reloaded in
    /// the worklet state, so only worklet globals are visible to them.
    /// Captured locals cannot travel; a function that captures any is
    /// rejected with [`BridgeError::InvalidArgument`]. Functions that already
    /// live in the worklet state are registered directly.
    pub fn create_worklet(&self, lua: &Lua, function: Function<'_>) -> Result<Worklet> {
        let worklet_context = self.worklet_context();
        if ExecutionContext::of(lua).map(|context| context.id) == Some(worklet_context.id) {
            let key = lua.create_registry_value(function)?;
            return Ok(Worklet {
                key,
                context: worklet_context.id,
            });
        }

        let bytecode = function.dump(false);
        if bytecode.is_empty() {
            return Err(BridgeError::invalid_argument(
                "frameProcessor must be a Lua function, native functions cannot become worklets",
            ));
        }
        let key = self.run_on_worklet(move |lua| {
            let function = lua.load(&bytecode[..]).into_function()?;
            let captured = captured_locals(lua, &function)?;
            if !captured.is_empty() {
                return Err(BridgeError::invalid_argument(format!(
                    "frameProcessor captures local variables ({}) that cannot move to the \
                     worklet context; use globals or look them up inside the frame processor",
                    captured.join(", ")
                )));
            }
            Ok(lua.create_registry_value(function)?)
        })?;
        debug!(context = %worklet_context.id, "Moved closure into worklet context");

        Ok(Worklet {
            key,
            context: worklet_context.id,
        })
    }

    /// Error channel for failures that happen inside the worklet context.
    pub fn report_error(&self, err: &BridgeError) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        error!(context = %self.worklet_context().id, error = %err, "Frame processor failed");
        let handler = self.error_handler.read().clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&BridgeError) + Send + Sync + 'static,
    {
        *self.error_handler.write() = Some(Arc::new(handler));
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for WorkletContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkletContext")
            .field("js_context", &self.js_context())
            .field("worklet_context", &self.worklet_context())
            .field("error_count", &self.error_count())
            .finish_non_exhaustive()
    }
}
