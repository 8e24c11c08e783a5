//! Wire types for the streaming telemetry protocols panoptes speaks.
//!
//! The message definitions are hand-maintained prost structs covering the
//! subset of the public gNMI and Juniper OpenConfig Telemetry protos the
//! drivers use; field tags match the upstream `.proto` files so the encoded
//! bytes are wire-compatible with real devices. The client modules mirror
//! what `tonic-build` would emit for the corresponding services.

pub mod gnmi;
pub mod jti;
pub mod juniper;
