//! Attribute Resolver & Notifier (§4.4): resolves `<node, instance,
//! attribute>` values and maintains the notification graph that
//! propagates a change at a source attribute to every dependent that
//! was computed from it.

pub mod notifier;
pub mod resolver;

pub use notifier::Notifier;
pub use resolver::{AttributeError, AttributeResolver};
