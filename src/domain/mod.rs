//! Domain layer: data model, event bus, reading buffer, export and settings.
//!
//! Nothing in here touches the radio.

pub mod buffer;
pub mod events;
pub mod export;
pub mod models;
pub mod settings;
