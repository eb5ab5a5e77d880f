mod format;
mod pacman;
mod router;

pub use format::{ParseDatabaseError, RepoFormat};
pub use pacman::PacmanFormat;
pub use router::{RepoEntry, RepoRouter, RouteMatch};
