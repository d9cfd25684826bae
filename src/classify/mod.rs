//! Classification building blocks: request builder, prompts/schemas, output validator.

mod builder;
mod schema;
mod validator;

pub use builder::*;
pub use schema::*;
pub use validator::*;
