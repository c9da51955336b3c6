pub trait Entity {
    const NAMESPACE: &'static str;
    type Id;

    fn id(&self) -> Option<Self::Id>;

    fn set_id(&mut self, id: Self::Id);
}

pub mod entity {
    pub trait IdField {
        type Id;

        fn get(&self) -> Option<Self::Id>;

        fn set(&mut self, id: Self::Id);
    }

    impl IdField for String {
        type Id = String;

        fn get(&self) -> Option<String> {
            (!self.is_empty()).then(|| self.clone())
        }

        fn set(&mut self, id: String) {
            *self = id;
        }
    }

    impl IdField for u64 {
        type Id = u64;

        fn get(&self) -> Option<u64> {
            (*self != 0).then_some(*self)
        }

        fn set(&mut self, id: u64) {
            *self = id;
        }
    }

    impl<T: Clone> IdField for Option<T> {
        type Id = T;

        fn get(&self) -> Option<T> {
            self.clone()
        }

        fn set(&mut self, id: T) {
            *self = Some(id);
        }
    }
}
