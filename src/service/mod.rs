//! CrudService: table-generic CRUD over the store session.

mod crud;
mod validation;
pub use crud::CrudService;
pub use validation::{inserted_before_parent, BodyItem, RequestValidator, WriteMode};
