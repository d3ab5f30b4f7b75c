pub mod cache;
pub mod catalog;
pub mod dispatch;
pub mod events;
pub mod notify;
pub mod reputation;
pub mod routes;
pub mod versioning;
pub mod waf;

pub use cache::*;
pub use catalog::*;
pub use dispatch::*;
pub use events::*;
pub use notify::*;
pub use reputation::*;
pub use routes::*;
pub use versioning::*;
pub use waf::*;
