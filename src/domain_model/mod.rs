mod page;
mod session;
mod token;
mod user;

pub use page::*;
pub use session::*;
pub use token::*;
pub use user::*;
