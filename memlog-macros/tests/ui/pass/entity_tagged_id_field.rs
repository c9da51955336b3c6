extern crate self as memlog;

#[path = "../common.rs"]
mod support;

pub use support::{entity, Entity};

use memlog_macros::Entity;

#[derive(Entity)]
#[entity(namespace = "accounts")]
pub struct Account {
    #[entity(id)]
    number: u64,
    id: String,
}

#[derive(Entity)]
pub struct Draft {
    #[entity(id)]
    key: Option<String>,
}

fn main() {
    assert_eq!(<Account as support::Entity>::NAMESPACE, "accounts");

    let account = Account {
        number: 42,
        id: String::new(),
    };
    assert_eq!(support::Entity::id(&account), Some(42));
    assert!(account.id.is_empty());

    let mut draft = Draft { key: None };
    assert_eq!(support::Entity::id(&draft), None);
    support::Entity::set_id(&mut draft, "d-1".to_string());
    assert_eq!(draft.key.as_deref(), Some("d-1"));
}
