//! Whole-chain gateway scenarios: real router, real chain, in-memory
//! store, and a local echo upstream.

pub mod support;

#[cfg(test)]
mod gateway_tests;
#[cfg(test)]
mod hmac_tests;
