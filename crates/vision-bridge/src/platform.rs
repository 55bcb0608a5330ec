//! The platform side of the bridge.
//!
//! [`PlatformProxy`] is what the proxy needs from the embedding platform.
//! [`FrameProcessorHost`] is a complete implementation of it that also
//! exposes the capture-pipeline entry point, [`FrameProcessorHost::process_frame`].

use crate::config::BridgeConfig;
use crate::context::WorkletContext;
use crate::error::Result;
use crate::frame::Frame;
use crate::plugin::{FrameProcessorPlugin, PluginRegistry};
use crate::processor::{ProcessorBinding, ProcessorRegistry, ViewTag};
use crate::value::NativeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Operations the bridge proxy calls on the embedding platform.
pub trait PlatformProxy: Send + Sync {
    fn worklet_context(&self) -> Arc<WorkletContext>;

    /// Bind `binding` to `tag`, replacing any previous binding.
    fn set_frame_processor(&self, tag: ViewTag, binding: ProcessorBinding);

    /// Unbind `tag`; a no-op when nothing is bound.
    fn remove_frame_processor(&self, tag: ViewTag);

    /// Instantiate the plugin called `name`, `Ok(None)` when unknown.
    fn get_frame_processor_plugin(
        &self,
        name: &str,
        options: &NativeMap,
    ) -> Result<Option<Arc<dyn FrameProcessorPlugin>>>;
}

/// Processor registry, plugin registry and worklet context in one place.
pub struct FrameProcessorHost {
    worklet: Arc<WorkletContext>,
    processors: ProcessorRegistry,
    plugins: PluginRegistry,
}

impl FrameProcessorHost {
    /// Spawn a worklet runtime configured by `config`.
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let worklet = Arc::new(WorkletContext::new(&config.worklet)?);
        Ok(Self::with_worklet_context(worklet))
    }

    pub fn with_worklet_context(worklet: Arc<WorkletContext>) -> Self {
        Self {
            worklet,
            processors: ProcessorRegistry::new(),
            plugins: PluginRegistry::new(),
        }
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn processors(&self) -> &ProcessorRegistry {
        &self.processors
    }

    /// Run the processor bound to `tag` on `frame`.
    ///
    /// Returns `Ok(false)` when nothing is bound. The binding is looked up
    /// once per frame, so a concurrent swap takes effect on the next frame.
    /// A failing processor stays bound.
    pub fn process_frame(&self, tag: ViewTag, frame: &Frame) -> Result<bool> {
        let Some(binding) = self.processors.get(tag) else {
            trace!(view_tag = %tag, "No frame processor bound, dropping frame");
            return Ok(false);
        };
        binding.processor.call(frame)?;
        Ok(true)
    }
}

impl PlatformProxy for FrameProcessorHost {
    fn worklet_context(&self) -> Arc<WorkletContext> {
        Arc::clone(&self.worklet)
    }

    fn set_frame_processor(&self, tag: ViewTag, binding: ProcessorBinding) {
        self.processors.set(tag, binding);
    }

    fn remove_frame_processor(&self, tag: ViewTag) {
        self.processors.remove(tag);
    }

    fn get_frame_processor_plugin(
        &self,
        name: &str,
        options: &NativeMap,
    ) -> Result<Option<Arc<dyn FrameProcessorPlugin>>> {
        let plugin = self.plugins.resolve(name, options)?;
        debug!(plugin = %name, found = plugin.is_some(), "Resolved frame processor plugin");
        Ok(plugin)
    }
}

impl Drop for FrameProcessorHost {
    fn drop(&mut self) {
        self.processors.clear();
    }
}

impl fmt::Debug for FrameProcessorHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameProcessorHost")
            .field("worklet", &self.worklet)
            .field("processors", &self.processors)
            .field("plugins", &self.plugins)
            .finish()
    }
}
