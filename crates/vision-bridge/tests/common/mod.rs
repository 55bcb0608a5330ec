//! Shared harness: a host with a few test plugins and an installed proxy.

#![allow(dead_code)]

use anyhow::{Context, bail};
use mlua::Lua;
use std::sync::Arc;
use vision_bridge::{
    BridgeConfig, BridgeProxy, Frame, FrameProcessorHost, FrameProcessorPlugin,
    NativeBuffer, NativeMap, NativeValue, PlatformProxy,
};

/// Reports the frame geometry plus whatever options it was created with.
pub struct FrameInfo {
    pub options: NativeMap,
}

impl FrameProcessorPlugin for FrameInfo {
    fn callback(&self, frame: &Frame, arguments: &NativeMap) -> anyhow::Result<NativeValue> {
        let mut out = NativeMap::new();
        out.insert("width".into(), frame.width.into());
        out.insert("height".into(), frame.height.into());
        out.insert("format".into(), frame.pixel_format.as_str().into());
        out.insert("options".into(), NativeValue::Map(self.options.clone()));
        out.insert("arguments".into(), NativeValue::Map(arguments.clone()));
        Ok(out.into())
    }
}

/// Hands back the frame's pixel buffer.
pub struct EchoPixels;

impl FrameProcessorPlugin for EchoPixels {
    fn callback(&self, frame: &Frame, _: &NativeMap) -> anyhow::Result<NativeValue> {
        Ok(NativeValue::Buffer(frame.pixels.clone()))
    }
}

/// Always fails.
pub struct Failing;

impl FrameProcessorPlugin for Failing {
    fn callback(&self, _: &Frame, _: &NativeMap) -> anyhow::Result<NativeValue> {
        Err(anyhow::anyhow!("model file missing")).context("detector unavailable")
    }
}

/// Panics on every call.
pub struct Panicking;

impl FrameProcessorPlugin for Panicking {
    fn callback(&self, _: &Frame, _: &NativeMap) -> anyhow::Result<NativeValue> {
        panic!("tensor shape mismatch")
    }
}

/// Returns a fixed sequence of labels with scores.
pub struct Labels;

impl FrameProcessorPlugin for Labels {
    fn callback(&self, _: &Frame, _: &NativeMap) -> anyhow::Result<NativeValue> {
        let label = |name: &str, score: f64| {
            let mut entry = NativeMap::new();
            entry.insert("label".into(), name.into());
            entry.insert("score".into(), score.into());
            NativeValue::Map(entry)
        };
        Ok(NativeValue::Array(vec![label("cat", 0.75), label("dog", 0.25)]))
    }
}

pub struct Harness {
    pub host: Arc<FrameProcessorHost>,
    pub lua: Lua,
    pub proxy: BridgeProxy,
}

pub fn host() -> Arc<FrameProcessorHost> {
    let host = FrameProcessorHost::new(&BridgeConfig::default()).unwrap();
    let plugins = host.plugins();
    plugins
        .register("frameInfo", |options: &NativeMap| {
            Ok(Arc::new(FrameInfo {
                options: options.clone(),
            }) as Arc<dyn FrameProcessorPlugin>)
        })
        .unwrap();
    plugins
        .register("echoPixels", |_: &NativeMap| {
            Ok(Arc::new(EchoPixels) as Arc<dyn FrameProcessorPlugin>)
        })
        .unwrap();
    plugins
        .register("failing", |_: &NativeMap| {
            Ok(Arc::new(Failing) as Arc<dyn FrameProcessorPlugin>)
        })
        .unwrap();
    plugins
        .register("labels", |_: &NativeMap| {
            Ok(Arc::new(Labels) as Arc<dyn FrameProcessorPlugin>)
        })
        .unwrap();
    plugins
        .register("panicking", |_: &NativeMap| {
            Ok(Arc::new(Panicking) as Arc<dyn FrameProcessorPlugin>)
        })
        .unwrap();
    plugins
        .register("broken", |_: &NativeMap| {
            bail!("GPU delegate could not be created")
        })
        .unwrap();
    Arc::new(host)
}

pub fn harness() -> Harness {
    harness_with(&BridgeConfig::default())
}

pub fn harness_with(config: &BridgeConfig) -> Harness {
    let host = host();
    let lua = Lua::new();
    let proxy = BridgeProxy::install(
        Arc::clone(&host) as Arc<dyn PlatformProxy>,
        &lua,
        config,
    )
    .unwrap();
    Harness { host, lua, proxy }
}

pub fn frame(width: u32, height: u32) -> Frame {
    let len = (width * height * 4) as usize;
    let pixels: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    Frame::new(width, height, NativeBuffer::new(pixels))
}

/// Run `source` in `lua`, which must fail.
pub fn script_error(lua: &Lua, source: &str) -> mlua::Error {
    lua.load(source)
        .exec()
        .expect_err("script should have failed")
}
