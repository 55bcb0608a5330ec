//! vision-bridge: frame processor bridge for Lua worklets
//!
//! Exposes native frame processor plugins and a per-view frame processing
//! pipeline to Lua scripts. Scripts register processors from the main Lua
//! state; the processors run on a separate worklet Lua state that lives on
//! its own thread.
//!
//! # Architecture
//!
//! ```text
//! main Lua ── VisionCameraProxy ──▶ PlatformProxy ──▶ ProcessorRegistry
//!                  │                     │                   │
//!                  │               PluginRegistry     FrameProcessor
//!                  ▼                                         │
//!            PluginHandle ◀── worklet Lua (own thread) ◀─────┘ process_frame
//!                  │
//!            BufferCache (per context)
//! ```
//!
//! # Modules
//!
//! - `proxy`: The `VisionCameraProxy` global and its owner
//! - `platform`: Platform collaborator trait and the reference host
//! - `processor`: Frame processors and the per-view registry
//! - `plugin`: Native plugin trait, registry and script handles
//! - `context`: Execution contexts and the worklet thread
//! - `buffer_cache`: Context-scoped buffer wrapper cache
//! - `marshal`: Lua <-> native value conversion
//! - `frame`: Frames and their script handles
//! - `value`: Native value model
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! The only unsafe code creates the worklet Lua state with bytecode loading
//! enabled.

pub mod buffer_cache;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod logging;
pub mod marshal;
pub mod platform;
pub mod plugin;
pub mod processor;
pub mod proxy;
pub mod value;

pub use buffer_cache::{ArrayBufferObject, BufferCache};
pub use config::{BridgeConfig, BufferCacheConfig, ConfigError, WorkletConfig};
pub use context::{ContextId, ContextKind, ExecutionContext, Worklet, WorkletContext};
pub use error::{BridgeError, MarshalError, Result};
pub use frame::{Frame, FrameCloser, FrameHandle, Orientation, PixelFormat};
pub use logging::{LogConfig, LogError, LogFormat, init_logging};
pub use platform::{FrameProcessorHost, PlatformProxy};
pub use plugin::{FrameProcessorPlugin, PluginHandle, PluginRegistry};
pub use processor::{FrameProcessor, ProcessorBinding, ProcessorKind, ProcessorRegistry, ViewTag};
pub use proxy::{BridgeProxy, ProxyProperty};
pub use value::{BufferId, NativeBuffer, NativeMap, NativeValue};
