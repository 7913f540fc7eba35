// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Userfaultfd kernel interface.
//!
//! `abi` holds the bit-exact structure images exchanged with the kernel,
//! `file` issues them against a descriptor.

pub mod abi;
mod file;
#[cfg(test)]
pub(crate) mod testing;

pub use abi::FaultEvent;
pub use file::{UffdFile, UserFault};
