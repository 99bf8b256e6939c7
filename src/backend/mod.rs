//! Prediction backends for trained networks.

mod rten_model;

pub use rten_model::RtenBackend;
