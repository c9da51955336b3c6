extern crate self as memlog;

#[path = "../common.rs"]
mod support;

pub use support::{entity, Entity};

use memlog_macros::Entity;

#[derive(Entity)]
pub struct Invoice {
    #[entity(id)]
    number: u64,
    #[entity(id)]
    reference: String,
}

fn main() {}
