#![recursion_limit = "256"]

//! Trains a small convolutional network on MNIST and serves its predictions over HTTP.
//!
//! The `train` binary writes the model artifact, the `serve` binary loads it once at start-up
//! and answers `POST /predict/` with the recognized digit.

pub mod data;
pub mod inference;
pub mod model;
pub mod server;
pub mod training;
