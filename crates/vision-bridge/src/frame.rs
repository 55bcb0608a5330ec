//! Camera frames and their script-visible handle.

use crate::buffer_cache::BufferCache;
use crate::error::{BridgeError, Result};
use crate::value::NativeBuffer;
use mlua::{MetaMethod, UserData, UserDataFields, UserDataMethods};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv,
    Rgb,
    Native,
    #[default]
    Unknown,
}

impl PixelFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yuv => "yuv",
            Self::Rgb => "rgb",
            Self::Native => "native",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Portrait => "portrait",
            Self::PortraitUpsideDown => "portrait-upside-down",
            Self::LandscapeLeft => "landscape-left",
            Self::LandscapeRight => "landscape-right",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured camera frame as handed over by the capture pipeline.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
    pub planes_count: u32,
    pub pixel_format: PixelFormat,
    pub orientation: Orientation,
    pub is_mirrored: bool,
    /// Capture time in nanoseconds, clock chosen by the platform
    pub timestamp: i64,
    pub pixels: NativeBuffer,
}

impl Frame {
    /// A single-plane frame with tightly packed rows of `pixels.len() / height` bytes.
    pub fn new(width: u32, height: u32, pixels: NativeBuffer) -> Self {
        let bytes_per_row = u32::try_from(pixels.len())
            .ok()
            .and_then(|len| len.checked_div(height))
            .unwrap_or(0);
        Self {
            width,
            height,
            bytes_per_row,
            planes_count: 1,
            pixel_format: PixelFormat::default(),
            orientation: Orientation::default(),
            is_mirrored: false,
            timestamp: 0,
            pixels,
        }
    }

    #[must_use]
    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    #[must_use]
    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    #[must_use]
    pub fn with_mirrored(mut self, is_mirrored: bool) -> Self {
        self.is_mirrored = is_mirrored;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_layout(mut self, bytes_per_row: u32, planes_count: u32) -> Self {
        self.bytes_per_row = bytes_per_row;
        self.planes_count = planes_count;
        self
    }
}

/// Script-visible view of a [`Frame`].
///
/// Valid only while the processor invocation that received it runs; every
/// access after that fails, even if the script stashed the handle away.
pub struct FrameHandle {
    frame: Frame,
    open: Arc<AtomicBool>,
    buffers: Arc<BufferCache>,
}

/// Closes its [`FrameHandle`] when told to or when dropped.
pub struct FrameCloser(Arc<AtomicBool>);

impl FrameCloser {
    pub fn close(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drop for FrameCloser {
    fn drop(&mut self) {
        self.close();
    }
}

impl FrameHandle {
    /// Open a handle for `frame`; it stays valid until the closer closes it
    /// or is dropped.
    pub fn new(frame: Frame, buffers: Arc<BufferCache>) -> (Self, FrameCloser) {
        let open = Arc::new(AtomicBool::new(true));
        let closer = FrameCloser(Arc::clone(&open));
        (
            Self {
                frame,
                open,
                buffers,
            },
            closer,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn frame(&self) -> Result<&Frame> {
        if self.is_valid() {
            Ok(&self.frame)
        } else {
            Err(BridgeError::invalid_argument(
                "Frame is already closed! Frames are only valid inside the frame processor call that received them.",
            ))
        }
    }
}

impl UserData for FrameHandle {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("width", |_, this| Ok(this.frame()?.width));
        fields.add_field_method_get("height", |_, this| Ok(this.frame()?.height));
        fields.add_field_method_get("bytesPerRow", |_, this| Ok(this.frame()?.bytes_per_row));
        fields.add_field_method_get("planesCount", |_, this| Ok(this.frame()?.planes_count));
        fields.add_field_method_get("pixelFormat", |_, this| {
            Ok(this.frame()?.pixel_format.as_str())
        });
        fields.add_field_method_get("orientation", |_, this| {
            Ok(this.frame()?.orientation.as_str())
        });
        fields.add_field_method_get("isMirrored", |_, this| Ok(this.frame()?.is_mirrored));
        fields.add_field_method_get("timestamp", |_, this| Ok(this.frame()?.timestamp));
        fields.add_field_method_get("isValid", |_, this| Ok(this.is_valid()));
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("toArrayBuffer", |lua, this, ()| {
            let frame = this.frame()?;
            this.buffers.get_or_create(lua, &frame.pixels)
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match this.frame() {
                Ok(frame) => format!(
                    "Frame({}x{} {} {})",
                    frame.width, frame.height, frame.pixel_format, frame.orientation
                ),
                Err(_) => "Frame(closed)".to_string(),
            })
        });
    }
}
