//! Default implementations of [crate::discovery::Discovery]

pub mod fixed;
