//! Distributed multi-channel recording control.
//!
//! Two roles share this crate: recorder clients (`fieldrec-recorder`)
//! capture audio on the machine they run on and take their orders from
//! a central hub; the hub (`fieldrec-hub`) tracks every recorder,
//! routes dashboard commands to them and serves the catalog of
//! finished recordings. Recording itself never depends on the control
//! channel being up.

pub mod api;
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
