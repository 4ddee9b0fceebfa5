//! Dummy hammerer for testing.
//!
//! This crate provides a hammerer that never touches DRAM rows. It either does
//! nothing, or corrupts one byte next to the first aggressor of every burst,
//! which lets the whole session pipeline be exercised without hardware effects.
//!
//! Implements the [`anvil_core::hammerer::Hammering`] trait.
//!
//! # Use Cases
//!
//! - Integration testing of anvil sessions
//! - Checking that the measurement path reports no flips when nothing was corrupted

#![warn(missing_docs)]

mod dummy;

pub use dummy::{Dummy, Never};
