pub mod events;
pub mod reputation;
pub mod request;
pub mod route;
pub mod version;

pub use events::*;
pub use reputation::*;
pub use request::*;
pub use route::*;
pub use version::*;
