//! Test fixtures

mod tamper;
mod two_node;

pub use tamper::TamperIo;
pub use two_node::{TwoNodeFixture, WireTransport, upgraded_pair};
