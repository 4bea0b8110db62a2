//! Collaborator contracts for the declination guiding core.
//!
//! This crate defines the seams between the guiding algorithms and the rest
//! of a guiding application: the scope driver ([`Scope`]), the guider frame
//! loop ([`GuideFrame`]), the camera ([`Camera`]), and the persisted settings
//! store ([`SettingsStore`]). The algorithms depend only on these shapes, so
//! a host application, a hardware driver, or a test harness can stand behind
//! them interchangeably.
//!
//! [`SimMount`] is a simulated mount with a configurable declination backlash
//! dead zone. It implements all three collaborator traits and is the backbone
//! of the end-to-end tests in the `backlash` crate.

pub mod direction;
pub mod frame;
pub mod moves;
pub mod point;
pub mod scope;
pub mod settings;
pub mod sim;

pub use crate::direction::GuideDirection;
pub use crate::frame::{Camera, GuideFrame, SensorSize};
pub use crate::moves::MoveOptions;
pub use crate::point::Point;
pub use crate::scope::{Calibration, Scope, TransformError};
pub use crate::settings::{FileSettings, MemorySettings, SettingsStore};
pub use crate::sim::{SimMount, SimMountConfig};
