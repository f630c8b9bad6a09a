//! warden-hw: V4L2 camera capture for the Warden capture loop.
//!
//! Negotiates YUYV, MJPG or GREY and hands out RGB frames through
//! `warden_core::FrameSource`.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureSession, DeviceInfo, PixelFormat};
