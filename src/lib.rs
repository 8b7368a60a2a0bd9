//! Frame compositing pipeline for a Wayland/X11 compositor.
//!
//! The [`compositor::Compositor`] drives one [`output::OutputScheduler`] per
//! output from calloop timers. Each run paints the stacking order through the
//! [`scene::Scene`], consulting the [`effects::EffectChain`], and reports
//! presentation back to clients through a [`presentation::FeedbackSink`].

pub mod backend;
pub mod buffer;
pub mod compositor;
pub mod config;
pub mod decoration;
pub mod effects;
pub mod geometry;
pub mod output;
pub mod presentation;
pub mod quads;
pub mod scene;
pub mod shadow;
pub mod sync;
pub mod toplevel;
pub mod window;

pub use compositor::{Compositor, LogNotifier, Notifier};
pub use config::Config;
