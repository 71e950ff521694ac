#![allow(missing_docs, unreachable_pub)]

mod faults;
mod harness;
mod propagation;
mod sync;

fn main() {}
