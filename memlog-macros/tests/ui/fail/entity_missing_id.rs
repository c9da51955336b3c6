extern crate self as memlog;

#[path = "../common.rs"]
mod support;

pub use support::{entity, Entity};

use memlog_macros::Entity;

#[derive(Entity)]
pub struct AuditEntry {
    actor: String,
    action: String,
}

fn main() {}
