//! Flush-based Rowhammer hammer engine.
//!
//! This crate provides [`FlushHammerer`], which hammers aggressor addresses by
//! repeatedly evicting them from the cache and accessing them again, so every
//! access reaches DRAM. Target sets are spread across scoped worker threads that
//! are optionally pinned to cores.
//!
//! Implements the [`anvil_core::hammerer::Hammering`] trait.
//!
//! # Platform Requirements
//!
//! - x86_64 for `clflush`/`mfence`; other targets compile but only fence
//! - Linux for core pinning (`sched_setaffinity`)

#![warn(missing_docs)]

mod flush;

pub use flush::{FlushError, FlushHammerer};
