//! Declarative core: manifest object model, identity types and owner status.

#![forbid(unsafe_code)]

pub mod gvk;
pub mod object;
pub mod owner;

pub use gvk::{GroupKind, GroupVersionKind};
pub use object::{parse, FieldError, Object, ObjectKey, ObjectSet, ParseError, WORKLOAD_KINDS};
pub use owner::{CommonStatus, DeclarativeObject, OwnerKey, PHASE_FAILED, PHASE_PROGRESSING, PHASE_READY};

/// Group and kind reserved for the aggregate Application descriptor.
pub const APPLICATION_GROUP: &str = "app.k8s.io";
pub const APPLICATION_KIND: &str = "Application";

pub mod prelude {
    pub use super::{
        CommonStatus, DeclarativeObject, GroupKind, GroupVersionKind, Object, ObjectKey, ObjectSet, OwnerKey,
    };
}
