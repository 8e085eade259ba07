//! The hardware module contains [crate::channel::CanChannel] implementations
//! for real CAN interfaces and for simulated buses

pub mod simulation;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan;
