use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::core::TaskKey;
use crate::lifecycle::Lifecycle;

/// How a reference constrains execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// The referenced task must finish before the referencing one starts.
    Hard,
    /// No ordering; the referencing task is patched once both are done.
    Soft,
}

/// Enumerates the references held by a value.
///
/// The resolver walks every task with this to build the graph, so a task that
/// forgets a [`TaskRef`](crate::TaskRef) field here runs out of order. Use
/// [`impl_references!`](crate::impl_references) for structs; it refuses to
/// compile when a field is missing from the list.
pub trait References {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind));
}

impl<R: References + ?Sized> References for &R {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        (**self).visit_references(visitor);
    }
}

impl<R: References + ?Sized> References for Box<R> {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        (**self).visit_references(visitor);
    }
}

impl<R: References + ?Sized> References for Arc<R> {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        (**self).visit_references(visitor);
    }
}

impl<R: References> References for Option<R> {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        if let Some(inner) = self {
            inner.visit_references(visitor);
        }
    }
}

impl<R: References> References for [R] {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        for item in self {
            item.visit_references(visitor);
        }
    }
}

impl<R: References> References for Vec<R> {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        self.as_slice().visit_references(visitor);
    }
}

impl<R: References> References for BTreeSet<R> {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        for item in self {
            item.visit_references(visitor);
        }
    }
}

impl<K, R: References> References for BTreeMap<K, R> {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        for item in self.values() {
            item.visit_references(visitor);
        }
    }
}

impl<K, R: References, S> References for HashMap<K, R, S> {
    fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
        for item in self.values() {
            item.visit_references(visitor);
        }
    }
}

macro_rules! impl_leaf {
    ($($ty:ty),* $(,)?) => {
        $(
            impl References for $ty {
                fn visit_references(&self, _: &mut dyn FnMut(&TaskKey, EdgeKind)) {}
            }
        )*
    };
}

impl_leaf!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    str,
    String,
    Duration,
    Utf8PathBuf,
    TaskKey,
    Lifecycle,
    serde_json::Value,
);

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($name: References),+> References for ($($name,)+) {
            fn visit_references(&self, visitor: &mut dyn FnMut(&TaskKey, EdgeKind)) {
                let ($($name,)+) = self;
                $($name.visit_references(visitor);)+
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);

/// Implements [`References`] for a struct by visiting each listed field.
///
/// Every field must be listed, references or not. The struct is destructured
/// exhaustively, so adding a field without listing it is a compile error.
///
/// ```ignore
/// impl_references!(Subnet { name, cidr, vpc, id });
/// ```
#[macro_export]
macro_rules! impl_references {
    ($ty:ident { $($field:ident),* $(,)? }) => {
        impl $crate::References for $ty {
            fn visit_references(
                &self,
                visitor: &mut dyn FnMut(&$crate::TaskKey, $crate::EdgeKind),
            ) {
                let $ty { $($field),* } = self;
                $( $crate::References::visit_references($field, visitor); )*
            }
        }
    };
}
