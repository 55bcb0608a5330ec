//! Context-scoped cache of buffer wrappers.
//!
//! A plugin invoked every frame tends to hand back the same native buffer
//! over and over. Wrapping it once per execution context keeps the wrapper
//! identity stable for scripts and avoids a userdata allocation per call.
//!
//! Entries are keyed by `(ContextId, BufferId)` and hold a registry key into
//! the Lua state that created the wrapper. A lookup never crosses contexts:
//! the caller's Lua state picks the bucket, and the registry key is checked
//! against that state before it is used.

use crate::context::{ContextId, ExecutionContext};
use crate::value::{BufferId, NativeBuffer};
use lru::LruCache;
use mlua::{AnyUserData, Lua, MetaMethod, RegistryKey, UserData, UserDataFields, UserDataMethods};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, trace};

/// The script-visible view of a [`NativeBuffer`].
pub struct ArrayBufferObject {
    buffer: NativeBuffer,
}

impl ArrayBufferObject {
    pub fn new(buffer: NativeBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &NativeBuffer {
        &self.buffer
    }
}

impl UserData for ArrayBufferObject {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("byteLength", |_, this| Ok(this.buffer.len()));
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        // Whole contents as a Lua string.
        methods.add_method("bytes", |lua, this, ()| lua.create_string(this.buffer.as_bytes()));

        // 1-based, nil when out of range.
        methods.add_method("byte", |_, this, index: i64| {
            let byte = usize::try_from(index)
                .ok()
                .and_then(|index| index.checked_sub(1))
                .and_then(|index| this.buffer.as_bytes().get(index).copied());
            Ok(byte)
        });

        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.buffer.len()));

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("ArrayBuffer({} bytes)", this.buffer.len()))
        });
    }
}

struct ContextEntries {
    entries: LruCache<BufferId, RegistryKey>,
    /// Set by `invalidate_all`; a sealed context never caches again.
    sealed: bool,
}

impl ContextEntries {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            sealed: false,
        }
    }
}

/// Per-context LRU of buffer wrappers.
///
/// Each context has its own lock; the outer map lock is only held to find
/// or create a bucket, never across Lua allocations.
pub struct BufferCache {
    capacity: NonZeroUsize,
    contexts: Mutex<HashMap<ContextId, Arc<Mutex<ContextEntries>>>>,
}

impl BufferCache {
    /// `capacity_per_context` is clamped to at least one entry.
    pub fn new(capacity_per_context: usize) -> Self {
        Self {
            capacity: NonZeroUsize::new(capacity_per_context).unwrap_or(NonZeroUsize::MIN),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity_per_context(&self) -> usize {
        self.capacity.get()
    }

    fn bucket(&self, context: ContextId) -> Arc<Mutex<ContextEntries>> {
        let mut contexts = self.contexts.lock();
        Arc::clone(
            contexts
                .entry(context)
                .or_insert_with(|| Arc::new(Mutex::new(ContextEntries::new(self.capacity)))),
        )
    }

    fn existing_bucket(&self, context: ContextId) -> Option<Arc<Mutex<ContextEntries>>> {
        self.contexts.lock().get(&context).cloned()
    }

    /// Return the wrapper for `buffer` in the context `lua` belongs to,
    /// creating and caching it on a miss.
    ///
    /// States without an execution context, and contexts that were already
    /// invalidated, get a fresh uncached wrapper.
    pub fn get_or_create<'lua>(
        &self,
        lua: &'lua Lua,
        buffer: &NativeBuffer,
    ) -> mlua::Result<AnyUserData<'lua>> {
        let Some(context) = ExecutionContext::of(lua) else {
            return lua.create_userdata(ArrayBufferObject::new(buffer.clone()));
        };

        let bucket = self.bucket(context.id);
        let mut bucket = bucket.lock();

        if bucket.sealed {
            return lua.create_userdata(ArrayBufferObject::new(buffer.clone()));
        }

        if let Some(key) = bucket.entries.get(&buffer.id()) {
            if lua.owns_registry_value(key) {
                trace!(context = %context.id, buffer = %buffer.id(), "Buffer cache hit");
                return lua.registry_value(key);
            }
        }

        let wrapper = lua.create_userdata(ArrayBufferObject::new(buffer.clone()))?;
        let key = lua.create_registry_value(wrapper.clone())?;
        if let Some((evicted_id, evicted)) = bucket.entries.push(buffer.id(), key) {
            if evicted_id != buffer.id() {
                trace!(context = %context.id, buffer = %evicted_id, "Buffer cache evicted entry");
            }
            if lua.owns_registry_value(&evicted) {
                lua.remove_registry_value(evicted)?;
            }
        }
        Ok(wrapper)
    }

    /// Drop every entry scoped to `context` and stop caching for it.
    ///
    /// Returns how many entries were dropped.
    pub fn invalidate_all(&self, context: ContextId) -> usize {
        let bucket = self.bucket(context);
        let mut bucket = bucket.lock();
        let dropped = bucket.entries.len();
        bucket.entries.clear();
        bucket.sealed = true;
        debug!(context = %context, dropped, "Invalidated buffer cache");
        dropped
    }

    pub fn len(&self, context: ContextId) -> usize {
        self.existing_bucket(context)
            .map_or(0, |bucket| bucket.lock().entries.len())
    }

    pub fn is_empty(&self, context: ContextId) -> bool {
        self.len(context) == 0
    }

    pub fn contains(&self, context: ContextId, buffer: BufferId) -> bool {
        self.existing_bucket(context)
            .is_some_and(|bucket| bucket.lock().entries.contains(&buffer))
    }

    pub fn is_sealed(&self, context: ContextId) -> bool {
        self.existing_bucket(context)
            .is_some_and(|bucket| bucket.lock().sealed)
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("capacity_per_context", &self.capacity)
            .field("contexts", &self.contexts.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextKind;

    fn js_lua() -> (Lua, ContextId) {
        let lua = Lua::new();
        let context = ExecutionContext::attach(&lua, ContextKind::Js);
        (lua, context.id)
    }

    fn raw_equal(lua: &Lua, a: &AnyUserData, b: &AnyUserData) -> bool {
        let check: mlua::Function = lua
            .load("return function(a, b) return rawequal(a, b) end")
            .eval()
            .unwrap();
        check.call((a.clone(), b.clone())).unwrap()
    }

    // ── wrapper object ──────────────────────────────────────────────

    #[test]
    fn wrapper_exposes_length_and_bytes() {
        let (lua, _) = js_lua();
        let cache = BufferCache::new(4);
        let buffer = NativeBuffer::new(vec![10_u8, 20, 30]);
        lua.globals()
            .set("buf", cache.get_or_create(&lua, &buffer).unwrap())
            .unwrap();

        let (len, meta_len, first, last, missing, text): (i64, i64, u8, u8, Option<u8>, String) =
            lua.load(
                "return buf.byteLength, #buf, buf:byte(1), buf:byte(3), buf:byte(4), tostring(buf)",
            )
            .eval()
            .unwrap();
        assert_eq!((len, meta_len, first, last), (3, 3, 10, 30));
        assert!(missing.is_none());
        assert_eq!(text, "ArrayBuffer(3 bytes)");

        let bytes: mlua::String = lua.load("return buf:bytes()").eval().unwrap();
        assert_eq!(bytes.as_bytes(), &[10, 20, 30]);
    }

    #[test]
    fn byte_rejects_zero_and_negative_indices() {
        let (lua, _) = js_lua();
        let cache = BufferCache::new(4);
        let buffer = NativeBuffer::new(vec![1_u8]);
        lua.globals()
            .set("buf", cache.get_or_create(&lua, &buffer).unwrap())
            .unwrap();
        let (zero, negative): (Option<u8>, Option<u8>) =
            lua.load("return buf:byte(0), buf:byte(-1)").eval().unwrap();
        assert!(zero.is_none());
        assert!(negative.is_none());
    }

    // ── caching ─────────────────────────────────────────────────────

    #[test]
    fn hit_returns_identical_wrapper() {
        let (lua, ctx) = js_lua();
        let cache = BufferCache::new(4);
        let buffer = NativeBuffer::new(vec![1_u8, 2]);

        let first = cache.get_or_create(&lua, &buffer).unwrap();
        let second = cache.get_or_create(&lua, &buffer.clone()).unwrap();

        assert!(raw_equal(&lua, &first, &second));
        assert_eq!(cache.len(ctx), 1);
        assert!(cache.contains(ctx, buffer.id()));
    }

    #[test]
    fn distinct_buffers_get_distinct_wrappers() {
        let (lua, ctx) = js_lua();
        let cache = BufferCache::new(4);
        let a = cache.get_or_create(&lua, &NativeBuffer::new(vec![1_u8])).unwrap();
        let b = cache.get_or_create(&lua, &NativeBuffer::new(vec![1_u8])).unwrap();
        assert!(!raw_equal(&lua, &a, &b));
        assert_eq!(cache.len(ctx), 2);
    }

    #[test]
    fn contexts_never_share_entries() {
        let (main, main_ctx) = js_lua();
        let other = Lua::new();
        let other_ctx = ExecutionContext::attach(&other, ContextKind::Worklet).id;
        let cache = BufferCache::new(4);
        let buffer = NativeBuffer::new(vec![5_u8; 8]);

        cache.get_or_create(&main, &buffer).unwrap();
        assert!(cache.contains(main_ctx, buffer.id()));
        assert!(!cache.contains(other_ctx, buffer.id()));

        let wrapper = cache.get_or_create(&other, &buffer).unwrap();
        assert!(wrapper.borrow::<ArrayBufferObject>().is_ok());
        assert_eq!(cache.len(main_ctx), 1);
        assert_eq!(cache.len(other_ctx), 1);
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let (lua, ctx) = js_lua();
        let cache = BufferCache::new(2);
        let a = NativeBuffer::new(vec![1_u8]);
        let b = NativeBuffer::new(vec![2_u8]);
        let c = NativeBuffer::new(vec![3_u8]);

        cache.get_or_create(&lua, &a).unwrap();
        cache.get_or_create(&lua, &b).unwrap();
        cache.get_or_create(&lua, &a).unwrap();
        cache.get_or_create(&lua, &c).unwrap();

        assert_eq!(cache.len(ctx), 2);
        assert!(cache.contains(ctx, a.id()));
        assert!(!cache.contains(ctx, b.id()));
        assert!(cache.contains(ctx, c.id()));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(BufferCache::new(0).capacity_per_context(), 1);
    }

    #[test]
    fn untagged_state_is_never_cached() {
        let lua = Lua::new();
        let cache = BufferCache::new(4);
        let buffer = NativeBuffer::new(vec![1_u8]);
        let first = cache.get_or_create(&lua, &buffer).unwrap();
        let second = cache.get_or_create(&lua, &buffer).unwrap();
        assert!(!raw_equal(&lua, &first, &second));
    }

    // ── invalidation ────────────────────────────────────────────────

    #[test]
    fn invalidate_all_empties_and_seals_one_context() {
        let (main, main_ctx) = js_lua();
        let other = Lua::new();
        let other_ctx = ExecutionContext::attach(&other, ContextKind::Worklet).id;
        let cache = BufferCache::new(4);
        let buffer = NativeBuffer::new(vec![9_u8]);

        let before = cache.get_or_create(&main, &buffer).unwrap();
        cache.get_or_create(&other, &buffer).unwrap();

        assert_eq!(cache.invalidate_all(main_ctx), 1);
        assert!(cache.is_empty(main_ctx));
        assert!(cache.is_sealed(main_ctx));
        assert_eq!(cache.len(other_ctx), 1, "other context untouched");
        assert!(!cache.is_sealed(other_ctx));

        let after = cache.get_or_create(&main, &buffer).unwrap();
        assert!(!raw_equal(&main, &before, &after));
        assert!(cache.is_empty(main_ctx), "sealed contexts stay empty");
    }

    #[test]
    fn invalidate_unknown_context_seals_it() {
        let (lua, ctx) = js_lua();
        let cache = BufferCache::new(4);
        assert_eq!(cache.invalidate_all(ctx), 0);
        cache.get_or_create(&lua, &NativeBuffer::new(vec![1_u8])).unwrap();
        assert!(cache.is_empty(ctx));
    }

    #[test]
    fn wrappers_outlive_invalidation_safely() {
        let (lua, ctx) = js_lua();
        let cache = BufferCache::new(4);
        let buffer = NativeBuffer::new(vec![4_u8, 2]);
        lua.globals()
            .set("kept", cache.get_or_create(&lua, &buffer).unwrap())
            .unwrap();
        cache.invalidate_all(ctx);
        let len: i64 = lua.load("return kept.byteLength").eval().unwrap();
        assert_eq!(len, 2);
    }

    #[test]
    fn contexts_do_not_share_a_lock() {
        let (first, first_ctx) = js_lua();
        let (second, second_ctx) = js_lua();
        let cache = BufferCache::new(4);
        let buffer = NativeBuffer::new(vec![9_u8]);
        cache.get_or_create(&first, &buffer).unwrap();

        let busy = cache.bucket(first_ctx);
        let _held = busy.lock();
        cache.get_or_create(&second, &buffer).unwrap();
        assert_eq!(cache.len(second_ctx), 1);
    }
}
