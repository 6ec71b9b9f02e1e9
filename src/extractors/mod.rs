pub mod principal;
pub use principal::{attach_principal, Principal, PROCESS_TIME_HEADER, REQUEST_ID_HEADER};
