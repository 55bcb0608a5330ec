//! The scripting-side entry point: `VisionCameraProxy`.
//!
//! [`BridgeProxy::install`] publishes one userdata global in the main Lua
//! state and in the worklet Lua state. Scripts see exactly four members:
//!
//! ```lua
//! VisionCameraProxy.setFrameProcessor(viewTag, { type = "frame-processor", frameProcessor = fn })
//! VisionCameraProxy.removeFrameProcessor(viewTag)
//! local plugin = VisionCameraProxy.getFrameProcessorPlugin("name", { option = 1 })
//! if VisionCameraProxy.isSkiaEnabled then ... end
//! ```
//!
//! The globals hold a weak reference to the proxy state. The returned
//! [`BridgeProxy`] is the only owner; dropping it invalidates both buffer
//! caches and releases the platform, after which every script call fails
//! with [`BridgeError::ContextDestroyed`].

use crate::buffer_cache::BufferCache;
use crate::config::BridgeConfig;
use crate::context::{ExecutionContext, WorkletContext};
use crate::error::{BridgeError, Result};
use crate::marshal::lua_table_to_map;
use crate::platform::PlatformProxy;
use crate::plugin::PluginHandle;
use crate::processor::{FrameProcessor, ProcessorBinding, ProcessorKind, ViewTag};
use crate::value::NativeMap;
use mlua::{Function, Lua, MetaMethod, UserData, UserDataMethods, Value, Variadic};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info};

/// Members of the proxy object, in enumeration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyProperty {
    SetFrameProcessor,
    RemoveFrameProcessor,
    GetFrameProcessorPlugin,
    IsSkiaEnabled,
}

impl ProxyProperty {
    pub const ALL: [Self; 4] = [
        Self::SetFrameProcessor,
        Self::RemoveFrameProcessor,
        Self::GetFrameProcessorPlugin,
        Self::IsSkiaEnabled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetFrameProcessor => "setFrameProcessor",
            Self::RemoveFrameProcessor => "removeFrameProcessor",
            Self::GetFrameProcessorPlugin => "getFrameProcessorPlugin",
            Self::IsSkiaEnabled => "isSkiaEnabled",
        }
    }
}

impl fmt::Display for ProxyProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyProperty {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|property| property.as_str() == s)
            .ok_or_else(|| BridgeError::invalid_argument(format!("unknown proxy property {s:?}")))
    }
}

struct ProxyState {
    platform: Arc<dyn PlatformProxy>,
    worklet: Arc<WorkletContext>,
    buffers: Arc<BufferCache>,
    js_context: ExecutionContext,
    skia_enabled: OnceLock<bool>,
    /// View tags bound through this proxy; unbound again at teardown.
    installed: Mutex<BTreeSet<ViewTag>>,
}

fn skia_unavailable() -> BridgeError {
    let reason = if cfg!(feature = "skia") {
        "Skia is not yet implemented on this platform!"
    } else {
        "Skia is not installed!"
    };
    BridgeError::UnavailableCapability(format!("system/skia-unavailable: {reason}"))
}

fn describe(value: &Value<'_>) -> String {
    match value {
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.type_name().to_string(),
    }
}

fn view_tag_from(value: &Value<'_>) -> Result<ViewTag> {
    let raw = match value {
        Value::Integer(i) => Some(*i),
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    };
    raw.and_then(|raw| i32::try_from(raw).ok())
        .and_then(ViewTag::new)
        .ok_or_else(|| {
            BridgeError::invalid_argument(format!(
                "viewTag must be a non-negative integer, got {}",
                describe(value)
            ))
        })
}

/// Drop the receiver when a method was called with `:` syntax.
fn method_args(args: Variadic<Value<'_>>) -> Vec<Value<'_>> {
    let mut args = args.to_vec();
    if let Some(Value::UserData(ud)) = args.first() {
        if ud.is::<ProxyObject>() {
            args.remove(0);
        }
    }
    args
}

impl ProxyState {
    fn is_skia_enabled(&self) -> bool {
        *self.skia_enabled.get_or_init(|| cfg!(feature = "skia"))
    }

    fn set_frame_processor(&self, lua: &Lua, args: &[Value<'_>]) -> Result<()> {
        let tag = view_tag_from(args.first().unwrap_or(&Value::Nil))?;
        let descriptor = match args.get(1) {
            Some(Value::Table(table)) => table,
            other => {
                return Err(BridgeError::invalid_argument(format!(
                    "setFrameProcessor: second argument must be a frame processor object, got {}",
                    other.map_or("no value", Value::type_name)
                )));
            }
        };

        let kind: ProcessorKind = match descriptor.get::<_, Value>("type")? {
            Value::String(kind) => kind.to_str()?.parse()?,
            other => {
                return Err(BridgeError::invalid_argument(format!(
                    "FrameProcessor.type must be a string, got {}",
                    other.type_name()
                )));
            }
        };

        if kind == ProcessorKind::SkiaFrameProcessor {
            return Err(skia_unavailable());
        }

        let function: Function = match descriptor.get::<_, Value>("frameProcessor")? {
            Value::Function(function) => function,
            other => {
                return Err(BridgeError::invalid_argument(format!(
                    "FrameProcessor.frameProcessor must be a function, got {}",
                    other.type_name()
                )));
            }
        };

        let worklet = self.worklet.create_worklet(lua, function)?;
        let processor = FrameProcessor::new(
            worklet,
            Arc::clone(&self.worklet),
            Arc::clone(&self.buffers),
        );
        self.platform.set_frame_processor(
            tag,
            ProcessorBinding {
                kind,
                processor: Arc::new(processor),
            },
        );
        self.installed.lock().insert(tag);
        debug!(view_tag = %tag, kind = %kind, "Frame processor installed");
        Ok(())
    }

    fn remove_frame_processor(&self, args: &[Value<'_>]) -> Result<()> {
        let tag = view_tag_from(args.first().unwrap_or(&Value::Nil))?;
        self.platform.remove_frame_processor(tag);
        self.installed.lock().remove(&tag);
        debug!(view_tag = %tag, "Frame processor removed");
        Ok(())
    }

    fn get_frame_processor_plugin<'lua>(
        &self,
        lua: &'lua Lua,
        args: &[Value<'lua>],
    ) -> Result<Value<'lua>> {
        if args.len() > 2 {
            return Err(BridgeError::invalid_argument(format!(
                "getFrameProcessorPlugin expects (pluginName, options?), got {} arguments",
                args.len()
            )));
        }
        let name = match args.first() {
            Some(Value::String(name)) => name.to_str()?.to_owned(),
            _ => {
                return Err(BridgeError::invalid_argument(
                    "First argument needs to be a string (pluginName)!",
                ));
            }
        };
        let options = match args.get(1) {
            None | Some(Value::Nil) => NativeMap::new(),
            Some(Value::Table(table)) => lua_table_to_map(table)?,
            Some(other) => {
                return Err(BridgeError::invalid_argument(format!(
                    "Second argument (options) must be an object, got {}",
                    other.type_name()
                )));
            }
        };

        let Some(plugin) = self.platform.get_frame_processor_plugin(&name, &options)? else {
            debug!(plugin = %name, "Frame processor plugin not found");
            return Ok(Value::Nil);
        };
        let handle = PluginHandle::new(name, options, plugin, Arc::clone(&self.buffers));
        Ok(Value::UserData(lua.create_userdata(handle)?))
    }
}

/// The userdata published as the proxy global.
#[derive(Clone)]
struct ProxyObject {
    state: Weak<ProxyState>,
    global_name: Arc<str>,
}

fn upgrade(state: &Weak<ProxyState>) -> Result<Arc<ProxyState>> {
    state.upgrade().ok_or(BridgeError::ContextDestroyed)
}

impl ProxyObject {
    fn property<'lua>(&self, lua: &'lua Lua, property: ProxyProperty) -> mlua::Result<Value<'lua>> {
        let weak = self.state.clone();
        let value = match property {
            ProxyProperty::SetFrameProcessor => Value::Function(lua.create_function(
                move |lua, args: Variadic<Value>| {
                    let state = upgrade(&weak)?;
                    Ok(state.set_frame_processor(lua, &method_args(args))?)
                },
            )?),
            ProxyProperty::RemoveFrameProcessor => Value::Function(lua.create_function(
                move |_, args: Variadic<Value>| {
                    let state = upgrade(&weak)?;
                    Ok(state.remove_frame_processor(&method_args(args))?)
                },
            )?),
            ProxyProperty::GetFrameProcessorPlugin => Value::Function(lua.create_function(
                move |lua, args: Variadic<Value>| {
                    let state = upgrade(&weak)?;
                    Ok(state.get_frame_processor_plugin(lua, &method_args(args))?)
                },
            )?),
            ProxyProperty::IsSkiaEnabled => Value::Boolean(upgrade(&weak)?.is_skia_enabled()),
        };
        Ok(value)
    }
}

impl UserData for ProxyObject {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        // Unknown and non-string keys read as nil.
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            let property = match &key {
                Value::String(key) => key.to_str().ok().and_then(|key| key.parse().ok()),
                _ => None,
            };
            match property {
                Some(property) => this.property(lua, property),
                None => Ok(Value::Nil),
            }
        });

        methods.add_meta_method(MetaMethod::NewIndex, |_, this, (key, _): (Value, Value)| {
            Err::<(), _>(
                BridgeError::invalid_argument(format!(
                    "{} is read-only, cannot assign {}",
                    this.global_name,
                    describe(&key)
                ))
                .into(),
            )
        });

        methods.add_meta_method(MetaMethod::Pairs, |lua, this, ()| {
            let snapshot = lua.create_table()?;
            for property in ProxyProperty::ALL {
                snapshot.raw_set(property.as_str(), this.property(lua, property)?)?;
            }
            let next: Function = lua.globals().get("next")?;
            Ok((next, snapshot, Value::Nil))
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(this.global_name.to_string())
        });
    }
}

/// Owner of an installed proxy.
///
/// Dropping it (or calling [`BridgeProxy::teardown`]) removes every frame
/// processor it installed, invalidates the buffer caches of the worklet and
/// main contexts, then releases the platform.
pub struct BridgeProxy {
    state: Arc<ProxyState>,
    global_name: Arc<str>,
}

impl BridgeProxy {
    pub const PROPERTY_NAMES: [&'static str; 4] = [
        "setFrameProcessor",
        "removeFrameProcessor",
        "getFrameProcessorPlugin",
        "isSkiaEnabled",
    ];

    /// Create the proxy and publish it as `config.global_name` in `lua` (the
    /// main context) and in the worklet context.
    pub fn install(
        platform: Arc<dyn PlatformProxy>,
        lua: &Lua,
        config: &BridgeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let worklet = platform.worklet_context();
        let js_context = worklet.attach_js_runtime(lua);

        let state = Arc::new(ProxyState {
            platform,
            worklet: Arc::clone(&worklet),
            buffers: Arc::new(BufferCache::new(config.buffer_cache.capacity_per_context)),
            js_context,
            skia_enabled: OnceLock::new(),
            installed: Mutex::new(BTreeSet::new()),
        });
        let global_name: Arc<str> = Arc::from(config.global_name.as_str());
        let object = ProxyObject {
            state: Arc::downgrade(&state),
            global_name: Arc::clone(&global_name),
        };

        lua.globals().set(&*global_name, object.clone())?;
        let name = global_name.to_string();
        worklet.run_on_worklet(move |lua| Ok(lua.globals().set(name, object)?))?;

        info!(
            global = %global_name,
            context = %js_context.id,
            worklet = %worklet.worklet_context().id,
            "Installed frame processor proxy"
        );
        Ok(Self { state, global_name })
    }

    /// Same as dropping the proxy.
    pub fn teardown(self) {
        drop(self);
    }

    pub fn global_name(&self) -> &str {
        &self.global_name
    }

    pub fn platform(&self) -> &Arc<dyn PlatformProxy> {
        &self.state.platform
    }

    pub fn buffer_cache(&self) -> &Arc<BufferCache> {
        &self.state.buffers
    }

    pub fn js_context(&self) -> ExecutionContext {
        self.state.js_context
    }

    pub fn worklet_context(&self) -> ExecutionContext {
        self.state.worklet.worklet_context()
    }

    pub fn is_skia_enabled(&self) -> bool {
        self.state.is_skia_enabled()
    }

    /// View tags currently bound through this proxy, ascending.
    pub fn installed_view_tags(&self) -> Vec<ViewTag> {
        self.state.installed.lock().iter().copied().collect()
    }
}

impl Drop for BridgeProxy {
    fn drop(&mut self) {
        info!(global = %self.global_name, "Destroying context...");
        let installed = std::mem::take(&mut *self.state.installed.lock());
        for tag in &installed {
            self.state.platform.remove_frame_processor(*tag);
        }
        debug!(removed = installed.len(), "Removed frame processors installed by the proxy");
        let worklet = self.state.buffers.invalidate_all(self.worklet_context().id);
        let js = self.state.buffers.invalidate_all(self.state.js_context.id);
        debug!(worklet, js, "Dropped cached buffer wrappers");
    }
}

impl fmt::Debug for BridgeProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeProxy")
            .field("global_name", &self.global_name)
            .field("js_context", &self.state.js_context)
            .field("worklet_context", &self.worklet_context())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FrameProcessorHost;

    fn installed() -> (Arc<FrameProcessorHost>, Lua, BridgeProxy) {
        let host = Arc::new(FrameProcessorHost::new(&BridgeConfig::default()).unwrap());
        let lua = Lua::new();
        let proxy = BridgeProxy::install(
            Arc::clone(&host) as Arc<dyn PlatformProxy>,
            &lua,
            &BridgeConfig::default(),
        )
        .unwrap();
        (host, lua, proxy)
    }

    #[test]
    fn property_names_match_enum() {
        let names: Vec<_> = ProxyProperty::ALL.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, BridgeProxy::PROPERTY_NAMES);
        assert_eq!(
            "isSkiaEnabled".parse::<ProxyProperty>().unwrap(),
            ProxyProperty::IsSkiaEnabled
        );
        assert!("toString".parse::<ProxyProperty>().is_err());
    }

    #[test]
    fn view_tag_parsing() {
        assert_eq!(view_tag_from(&Value::Integer(4)).unwrap().get(), 4);
        assert_eq!(view_tag_from(&Value::Number(4.0)).unwrap().get(), 4);
        for bad in [
            Value::Integer(-1),
            Value::Integer(i64::from(i32::MAX) + 1),
            Value::Number(1.5),
            Value::Number(f64::NAN),
            Value::Boolean(true),
            Value::Nil,
        ] {
            assert!(
                matches!(view_tag_from(&bad), Err(BridgeError::InvalidArgument(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn skia_message_names_capability() {
        let text = skia_unavailable().to_string();
        assert!(text.starts_with("system/skia-unavailable: Skia is"));
    }

    #[test]
    fn install_publishes_global_in_both_contexts() {
        let (host, lua, proxy) = installed();
        let text: String = lua.load("return tostring(VisionCameraProxy)").eval().unwrap();
        assert_eq!(text, "VisionCameraProxy");

        let in_worklet: String = host
            .worklet_context()
            .run_on_worklet(|lua| Ok(lua.load("return tostring(VisionCameraProxy)").eval()?))
            .unwrap();
        assert_eq!(in_worklet, "VisionCameraProxy");
        assert_ne!(proxy.js_context().id, proxy.worklet_context().id);
    }

    #[test]
    fn colon_calls_are_accepted() {
        let (host, lua, proxy) = installed();
        lua.load(
            "VisionCameraProxy:setFrameProcessor(1, \
             { type = 'frame-processor', frameProcessor = function(f) end })",
        )
        .exec()
        .unwrap();
        assert!(host.processors().contains(ViewTag::new(1).unwrap()));
        lua.load("VisionCameraProxy:removeFrameProcessor(1)").exec().unwrap();
        assert!(host.processors().is_empty());
        assert!(proxy.installed_view_tags().is_empty());
    }

    #[test]
    fn teardown_unbinds_installed_processors() {
        let (host, lua, proxy) = installed();
        lua.load(
            r#"
            for tag = 1, 3 do
                VisionCameraProxy.setFrameProcessor(tag, {
                    type = "frame-processor",
                    frameProcessor = function(f) end,
                })
            end
            VisionCameraProxy.removeFrameProcessor(2)
            "#,
        )
        .exec()
        .unwrap();
        let tags: Vec<i32> = proxy.installed_view_tags().iter().map(|t| t.get()).collect();
        assert_eq!(tags, [1, 3]);

        proxy.teardown();
        assert!(host.processors().is_empty());
    }

    #[test]
    fn assignment_is_rejected() {
        let (_host, lua, _proxy) = installed();
        let err = lua.load("VisionCameraProxy.extra = 1").exec().unwrap_err();
        assert!(matches!(BridgeError::find(&err), Some(BridgeError::InvalidArgument(_))));
    }

    #[test]
    fn install_rejects_invalid_config() {
        let host = Arc::new(FrameProcessorHost::new(&BridgeConfig::default()).unwrap());
        let config = BridgeConfig {
            global_name: "1bad".into(),
            ..BridgeConfig::default()
        };
        let result = BridgeProxy::install(host, &Lua::new(), &config);
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn custom_global_name() {
        let host = Arc::new(FrameProcessorHost::new(&BridgeConfig::default()).unwrap());
        let lua = Lua::new();
        let config = BridgeConfig {
            global_name: "Camera".into(),
            ..BridgeConfig::default()
        };
        let proxy = BridgeProxy::install(host, &lua, &config).unwrap();
        assert_eq!(proxy.global_name(), "Camera");
        let present: bool = lua
            .load("return Camera ~= nil and VisionCameraProxy == nil")
            .eval()
            .unwrap();
        assert!(present);
    }
}
