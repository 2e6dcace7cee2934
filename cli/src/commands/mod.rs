//! Command implementations for the `stackgate` binary

pub mod check;
pub mod plan;
pub mod render;
pub mod up;
pub mod wait_for;
