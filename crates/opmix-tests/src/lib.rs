//! Integration test crate for OpMix.
//!
//! This crate exists solely to hold cross-crate integration tests. Every
//! scenario runs the full engine against the in-process software backend
//! with decoded sources registered up front, so no device or file system
//! is needed.

#[cfg(test)]
mod fixtures;

#[cfg(test)]
mod liveness;

#[cfg(test)]
mod transport;

#[cfg(test)]
mod render;

#[cfg(test)]
mod export;
