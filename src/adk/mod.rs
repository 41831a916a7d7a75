// SPDX-License-Identifier: MIT

//! Agent development kit: the collaborator seams of the engine.

pub mod error;
pub mod memory;
pub mod model;
pub mod tool;
