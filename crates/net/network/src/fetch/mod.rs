//! Typed request API on top of the [`Correlator`](crate::Correlator).

mod client;

pub use client::FetchClient;
