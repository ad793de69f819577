//! Event types for the presentation layer.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over whatever UI bridge it uses. The presentation layer is a
//! read-only projection of these events.

pub mod events;
