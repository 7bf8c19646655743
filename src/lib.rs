//! pintail: the storage and virtual-memory core of a small teaching kernel.
//!
//! The crate packages four subsystems behind a pluggable block-device
//! interface so that the whole stack runs and is tested on a host:
//!
//! * `bio`: a write-back sector cache with second-chance eviction.
//! * `fs`: an inode layer with direct/indirect/doubly-indirect addressing,
//!   a hierarchical directory layer, and the consumer file surface.
//! * `vm`: demand paging with supplemental page tables, a shared frame
//!   table with clock eviction, and a swap area.
//! * `hal`: the block-device contract the rest of the crate is written
//!   against.
//!
//! The system-call glue, process bring-up, and scheduler of the embedding
//! kernel are out of scope; locks busy-wait.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bio;
pub mod error;
pub mod fs;
pub mod hal;
pub mod lock;
pub mod param;
pub mod vm;
