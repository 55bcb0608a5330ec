//! Frame processors and the per-view processor registry.

use crate::buffer_cache::BufferCache;
use crate::context::{Worklet, WorkletContext};
use crate::error::{BridgeError, Result};
use crate::frame::{Frame, FrameHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};

/// The `type` field of a frame processor descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    FrameProcessor,
    SkiaFrameProcessor,
}

impl ProcessorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FrameProcessor => "frame-processor",
            Self::SkiaFrameProcessor => "skia-frame-processor",
        }
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessorKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "frame-processor" => Ok(Self::FrameProcessor),
            "skia-frame-processor" => Ok(Self::SkiaFrameProcessor),
            other => Err(BridgeError::invalid_argument(format!(
                "Unknown FrameProcessor.type passed! Received: {other}"
            ))),
        }
    }
}

/// Identity of the camera view a processor is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewTag(i32);

impl ViewTag {
    /// `None` for negative tags.
    pub fn new(tag: i32) -> Option<Self> {
        (tag >= 0).then_some(Self(tag))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ViewTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worklet closure ready to be invoked once per frame.
pub struct FrameProcessor {
    worklet: Arc<Worklet>,
    context: Arc<WorkletContext>,
    buffers: Arc<BufferCache>,
}

impl FrameProcessor {
    pub fn new(worklet: Worklet, context: Arc<WorkletContext>, buffers: Arc<BufferCache>) -> Self {
        Self {
            worklet: Arc::new(worklet),
            context,
            buffers,
        }
    }

    /// Run the closure with `frame` on the worklet thread and wait for it.
    ///
    /// The frame handle passed to the script is closed when the closure
    /// returns. Failures are reported on the worklet context's error channel
    /// and returned.
    pub fn call(&self, frame: &Frame) -> Result<()> {
        let worklet = Arc::clone(&self.worklet);
        let buffers = Arc::clone(&self.buffers);
        let frame = frame.clone();

        let result = self.context.run_on_worklet(move |lua| {
            let (handle, closer) = FrameHandle::new(frame, buffers);
            let function = worklet.function(lua)?;
            let outcome = lua
                .create_userdata(handle)
                .and_then(|handle| function.call::<_, ()>(handle));
            closer.close();
            outcome.map_err(|err| BridgeError::Worklet(err.to_string()))
        });

        match result {
            Ok(()) => {
                trace!(context = %self.worklet.context(), "Frame processed");
                Ok(())
            }
            Err(err) => {
                self.context.report_error(&err);
                Err(err)
            }
        }
    }
}

impl fmt::Debug for FrameProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameProcessor")
            .field("worklet", &self.worklet)
            .finish_non_exhaustive()
    }
}

/// What a view tag is bound to.
#[derive(Clone, Debug)]
pub struct ProcessorBinding {
    pub kind: ProcessorKind,
    pub processor: Arc<FrameProcessor>,
}

/// `ViewTag -> ProcessorBinding`, written from the scripting thread and
/// read from the capture thread.
#[derive(Default)]
pub struct ProcessorRegistry {
    bindings: RwLock<HashMap<ViewTag, ProcessorBinding>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `tag`, returning the binding it replaced.
    pub fn set(&self, tag: ViewTag, binding: ProcessorBinding) -> Option<ProcessorBinding> {
        let kind = binding.kind;
        let previous = self.bindings.write().insert(tag, binding);
        debug!(view_tag = %tag, kind = %kind, replaced = previous.is_some(), "Set frame processor");
        previous
    }

    pub fn remove(&self, tag: ViewTag) -> Option<ProcessorBinding> {
        let removed = self.bindings.write().remove(&tag);
        debug!(view_tag = %tag, removed = removed.is_some(), "Removed frame processor");
        removed
    }

    /// Clone of the current binding; the lock is not held afterwards.
    pub fn get(&self, tag: ViewTag) -> Option<ProcessorBinding> {
        self.bindings.read().get(&tag).cloned()
    }

    pub fn contains(&self, tag: ViewTag) -> bool {
        self.bindings.read().contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Bound view tags in ascending order.
    pub fn view_tags(&self) -> Vec<ViewTag> {
        let mut tags: Vec<_> = self.bindings.read().keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    pub fn clear(&self) {
        let mut bindings = self.bindings.write();
        let count = bindings.len();
        bindings.clear();
        debug!(count, "Cleared frame processors");
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("view_tags", &self.view_tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkletConfig;
    use crate::value::NativeBuffer;
    use mlua::{Function, Lua};

    fn harness() -> (Arc<WorkletContext>, Lua, Arc<BufferCache>) {
        let context = Arc::new(WorkletContext::new(&WorkletConfig::default()).unwrap());
        let lua = Lua::new();
        context.attach_js_runtime(&lua);
        (context, lua, Arc::new(BufferCache::new(4)))
    }

    fn processor(source: &str) -> (Arc<WorkletContext>, FrameProcessor) {
        let (context, lua, buffers) = harness();
        let function: Function = lua.load(source).eval().unwrap();
        let worklet = context.create_worklet(&lua, function).unwrap();
        (
            Arc::clone(&context),
            FrameProcessor::new(worklet, context, buffers),
        )
    }

    fn frame() -> Frame {
        Frame::new(2, 2, NativeBuffer::new(vec![1_u8; 8]))
    }

    // ── ProcessorKind / ViewTag ─────────────────────────────────────

    #[test]
    fn kind_parses_known_types() {
        assert_eq!(
            "frame-processor".parse::<ProcessorKind>().unwrap(),
            ProcessorKind::FrameProcessor
        );
        assert_eq!(
            "skia-frame-processor".parse::<ProcessorKind>().unwrap(),
            ProcessorKind::SkiaFrameProcessor
        );
    }

    #[test]
    fn kind_rejects_unknown_type_with_value() {
        let err = "bogus".parse::<ProcessorKind>().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidArgument(ref msg) if msg.contains("Received: bogus")
        ));
    }

    #[test]
    fn view_tag_rejects_negative() {
        assert!(ViewTag::new(-1).is_none());
        assert_eq!(ViewTag::new(0).map(ViewTag::get), Some(0));
    }

    // ── FrameProcessor ──────────────────────────────────────────────

    #[test]
    fn call_runs_closure_on_worklet_with_frame() {
        let (context, processor) =
            processor("return function(frame) seen = frame.width * 10 + frame.height end");
        processor.call(&frame()).unwrap();
        let seen: i64 = context
            .run_on_worklet(|lua| Ok(lua.globals().get("seen")?))
            .unwrap();
        assert_eq!(seen, 22);
    }

    #[test]
    fn frame_is_closed_after_call() {
        let (context, processor) = processor("return function(frame) kept = frame end");
        processor.call(&frame()).unwrap();
        let valid: bool = context
            .run_on_worklet(|lua| Ok(lua.load("return kept.isValid").eval()?))
            .unwrap();
        assert!(!valid);
    }

    #[test]
    fn script_error_is_reported_and_returned() {
        let (context, processor) = processor("return function(frame) error('bad frame') end");
        let err = processor.call(&frame()).unwrap_err();
        assert!(matches!(err, BridgeError::Worklet(ref msg) if msg.contains("bad frame")));
        assert_eq!(context.error_count(), 1);

        processor.call(&frame()).unwrap_err();
        assert_eq!(context.error_count(), 2);
    }

    // ── ProcessorRegistry ───────────────────────────────────────────

    fn binding() -> ProcessorBinding {
        let (_, processor) = processor("return function(frame) end");
        ProcessorBinding {
            kind: ProcessorKind::FrameProcessor,
            processor: Arc::new(processor),
        }
    }

    #[test]
    fn set_overwrites_and_returns_previous() {
        let registry = ProcessorRegistry::new();
        let tag = ViewTag::new(3).unwrap();
        let first = binding();
        let second = binding();
        let first_ptr = Arc::as_ptr(&first.processor);

        assert!(registry.set(tag, first).is_none());
        let replaced = registry.set(tag, second.clone()).unwrap();
        assert_eq!(Arc::as_ptr(&replaced.processor), first_ptr);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(tag).unwrap().processor, &second.processor));
    }

    #[test]
    fn remove_absent_is_none() {
        let registry = ProcessorRegistry::new();
        assert!(registry.remove(ViewTag::new(9).unwrap()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn view_tags_are_sorted_and_clear_empties() {
        let registry = ProcessorRegistry::new();
        let b = binding();
        for tag in [5, 1, 3] {
            registry.set(ViewTag::new(tag).unwrap(), b.clone());
        }
        let tags: Vec<i32> = registry.view_tags().into_iter().map(ViewTag::get).collect();
        assert_eq!(tags, vec![1, 3, 5]);
        assert!(registry.contains(ViewTag::new(3).unwrap()));

        registry.clear();
        assert!(registry.is_empty());
    }
}
