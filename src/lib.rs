//! pixie-scan: list-mode scan pipeline for XIA Pixie-16 data
//!
//! Spills arrive from HRIBF `.ldf` files or a UDP socket, are unpacked into
//! channel records, grouped into time-windowed events and correlated into
//! implant/decay chains.

pub mod builder;
pub mod common;
pub mod config;
pub mod correlator;
pub mod decoder;
pub mod emulator;
pub mod ldf;
pub mod scan;
pub mod unpacker;
