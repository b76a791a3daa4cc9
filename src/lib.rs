//! PackScan - packaged food and drink recognition from camera frames
//!
//! Reads package labels with OCR, fuses noisy readings over several frames,
//! rescues garbled brand names and decides when a reading is safe to act on.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod resolver;
pub mod vision;
