pub mod activity;
pub mod auth;
pub mod build;
pub mod cleanup;
pub mod common;
pub mod group;
pub mod operation;
pub mod package;
pub mod user_context;
pub mod version;

pub use activity::*;
pub use auth::*;
pub use build::*;
pub use cleanup::*;
pub use common::*;
pub use group::*;
pub use operation::*;
pub use package::*;
pub use user_context::*;
pub use version::*;
