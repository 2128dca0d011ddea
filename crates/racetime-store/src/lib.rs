pub mod categories;
pub mod database;
pub mod error;
pub mod messages;
pub mod races;
pub mod row_helpers;
pub mod schema;
pub mod tokens;
pub mod users;

pub use categories::{CategoryListing, CategoryRepo};
pub use database::Database;
pub use error::StoreError;
pub use messages::MessageRepo;
pub use races::{Committed, RaceRepo};
pub use tokens::TokenRepo;
pub use users::UserRepo;
