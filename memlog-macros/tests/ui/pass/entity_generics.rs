extern crate self as memlog;

#[path = "../common.rs"]
mod support;

pub use support::{entity, Entity};

use memlog_macros::Entity;

#[derive(Entity)]
pub struct Envelope<T>
where
    T: Clone,
{
    id: u64,
    payload: T,
}

fn main() {
    assert_eq!(<Envelope<String> as support::Entity>::NAMESPACE, "envelope");

    let mut envelope = Envelope {
        id: 0,
        payload: vec![1_u8],
    };
    support::Entity::set_id(&mut envelope, 7);
    assert_eq!(support::Entity::id(&envelope), Some(7));
    assert_eq!(envelope.payload, [1]);
}
