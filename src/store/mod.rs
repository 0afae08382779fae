pub mod memory;
pub mod postgres;
pub mod traits;
pub mod transformed_document_cache;

pub use memory::*;
pub use postgres::*;
pub use traits::*;
pub use transformed_document_cache::*;
