#![allow(missing_docs, unreachable_pub)]

mod propagation;
mod requests;

fn main() {}
