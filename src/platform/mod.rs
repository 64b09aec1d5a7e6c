pub mod common;
pub mod desktop;

pub use desktop::{DesktopSurface, FileStatusMirror};
