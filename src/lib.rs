//! Dynamic GeoJSON overlays on a braille terminal map.

pub mod braille;
pub mod config;
pub mod data;
pub mod map;
pub mod overlay;
pub mod service;
