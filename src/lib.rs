//! Relay a byte stream between a local process and a USB host through a
//! FunctionFS gadget endpoint pair.
//!
//! The host-facing side is a vendor-specific USB function with one bulk IN
//! and one bulk OUT endpoint, exposed through FunctionFS. Host-to-device
//! traffic is read with kernel AIO ([`aio::Driver`]) and forwarded to a local
//! sink; local input is written synchronously to the IN endpoint. A single
//! poll loop ([`poll::Poller`]) multiplexes `ep0` lifecycle events, AIO
//! completions and local input, and [`relay::Relay`] tracks the function's
//! bind/enable lifecycle to keep the read pool submitted exactly while the
//! configuration is active.
//!
//! ### Requirements
//!
//! The Linux kernel configuration option `CONFIG_USB_CONFIGFS_F_FS` must be
//! enabled, a FunctionFS instance must be mounted and the gadget must be
//! composed and bound to a UDC externally.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("usbcat only supports Linux");

pub mod aio;
pub mod ffs;
pub mod poll;
pub mod relay;

pub use relay::{FunctionState, LifecycleEvent, Relay, DEFAULT_BUF_SIZE, DEFAULT_QUEUE_LEN};
