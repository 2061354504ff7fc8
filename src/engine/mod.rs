//! Core engine: the snapshot → gate → size → submit loop and its control.

pub mod audit;
pub mod controller;
pub mod counter;
pub mod decision_loop;
pub mod executor;
