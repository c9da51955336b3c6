extern crate self as memlog;

#[path = "../common.rs"]
mod support;

pub use support::{entity, Entity};

use memlog_macros::Entity;

#[derive(Entity)]
pub struct BlogPost {
    id: String,
    title: String,
}

fn main() {
    assert_eq!(<BlogPost as support::Entity>::NAMESPACE, "blog-post");

    let mut post = BlogPost {
        id: String::new(),
        title: "hello".into(),
    };
    assert_eq!(support::Entity::id(&post), None);
    support::Entity::set_id(&mut post, "p-1".to_string());
    assert_eq!(post.id, "p-1");
    assert_eq!(post.title, "hello");
}
