//! Native frame processor plugins.
//!
//! Plugins are registered on the platform side by name, together with an
//! initializer that receives the options passed to
//! `getFrameProcessorPlugin`. Scripts get a [`PluginHandle`] back and call
//! it with a frame:
//!
//! ```lua
//! local scanner = VisionCameraProxy.getFrameProcessorPlugin("scanCodes", { formats = { "qr" } })
//! local codes = scanner:call(frame, { maxResults = 4 })
//! ```

use crate::buffer_cache::BufferCache;
use crate::error::{BridgeError, Result};
use crate::frame::{Frame, FrameHandle};
use crate::marshal::{lua_table_to_map, native_map_to_lua, native_to_lua};
use crate::value::{NativeMap, NativeValue};
use mlua::{AnyUserData, MetaMethod, UserData, UserDataFields, UserDataMethods, Value};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A native routine scripts can run against a frame.
pub trait FrameProcessorPlugin: Send + Sync {
    /// Process `frame` with the per-call `arguments`.
    fn callback(&self, frame: &Frame, arguments: &NativeMap) -> anyhow::Result<NativeValue>;
}

/// Builds a plugin instance from the options a script resolved it with.
pub type PluginInitializer =
    dyn Fn(&NativeMap) -> anyhow::Result<Arc<dyn FrameProcessorPlugin>> + Send + Sync;

/// Name -> initializer table owned by the platform.
#[derive(Default)]
pub struct PluginRegistry {
    initializers: RwLock<BTreeMap<String, Arc<PluginInitializer>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `initializer` under `name`. Names are unique.
    pub fn register<F>(&self, name: impl Into<String>, initializer: F) -> Result<()>
    where
        F: Fn(&NativeMap) -> anyhow::Result<Arc<dyn FrameProcessorPlugin>> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut initializers = self.initializers.write();
        if initializers.contains_key(&name) {
            return Err(BridgeError::invalid_argument(format!(
                "Frame processor plugin \"{name}\" is already registered"
            )));
        }
        debug!(plugin = %name, "Registered frame processor plugin");
        initializers.insert(name, Arc::new(initializer));
        Ok(())
    }

    /// Instantiate the plugin called `name`, or `Ok(None)` if there is none.
    pub fn resolve(
        &self,
        name: &str,
        options: &NativeMap,
    ) -> Result<Option<Arc<dyn FrameProcessorPlugin>>> {
        let Some(initializer) = self.initializers.read().get(name).cloned() else {
            debug!(plugin = %name, "No frame processor plugin registered under this name");
            return Ok(None);
        };
        initializer(options)
            .map(Some)
            .map_err(|err| BridgeError::NativeInvocation {
                plugin: name.to_string(),
                message: format!("{err:#}"),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.initializers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.initializers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.initializers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.initializers.read().is_empty()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Script-visible handle to a resolved plugin.
pub struct PluginHandle {
    name: String,
    options: NativeMap,
    plugin: Arc<dyn FrameProcessorPlugin>,
    buffers: Arc<BufferCache>,
}

impl PluginHandle {
    pub fn new(
        name: impl Into<String>,
        options: NativeMap,
        plugin: Arc<dyn FrameProcessorPlugin>,
        buffers: Arc<BufferCache>,
    ) -> Self {
        Self {
            name: name.into(),
            options,
            plugin,
            buffers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &NativeMap {
        &self.options
    }

    /// Invoke the plugin directly from Rust.
    pub fn invoke(&self, frame: &Frame, arguments: &NativeMap) -> Result<NativeValue> {
        self.plugin
            .callback(frame, arguments)
            .map_err(|err| BridgeError::NativeInvocation {
                plugin: self.name.clone(),
                message: format!("{err:#}"),
            })
    }

    fn call_from_lua<'lua>(
        &self,
        lua: &'lua mlua::Lua,
        frame: Value<'lua>,
        arguments: Value<'lua>,
    ) -> mlua::Result<Value<'lua>> {
        let frame: AnyUserData = match frame {
            Value::UserData(ud) => ud,
            other => {
                return Err(BridgeError::invalid_argument(format!(
                    "{}: first argument must be a Frame, got a {}",
                    self.name,
                    other.type_name()
                ))
                .into());
            }
        };
        let handle = frame.borrow::<FrameHandle>().map_err(|_| {
            BridgeError::invalid_argument(format!(
                "{}: first argument must be a Frame",
                self.name
            ))
        })?;
        let frame = handle.frame()?;

        let arguments = match arguments {
            Value::Nil => NativeMap::new(),
            Value::Table(table) => lua_table_to_map(&table).map_err(BridgeError::from)?,
            other => {
                return Err(BridgeError::invalid_argument(format!(
                    "{}: arguments must be a table, got a {}",
                    self.name,
                    other.type_name()
                ))
                .into());
            }
        };

        let result = self.invoke(frame, &arguments).inspect_err(|err| {
            warn!(plugin = %self.name, error = %err, "Frame processor plugin failed");
        })?;
        native_to_lua(lua, &result, &self.buffers)
    }
}

impl UserData for PluginHandle {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("name", |_, this| Ok(this.name.clone()));
        fields.add_field_method_get("options", |lua, this| {
            native_map_to_lua(lua, &this.options, &this.buffers)
        });
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("call", |lua, this, (frame, arguments): (Value, Value)| {
            this.call_from_lua(lua, frame, arguments)
        });

        methods.add_meta_method(MetaMethod::Call, |lua, this, (frame, arguments): (Value, Value)| {
            this.call_from_lua(lua, frame, arguments)
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("FrameProcessorPlugin({})", this.name))
        });
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("options", &self.options.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
