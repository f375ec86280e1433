pub mod git;

pub use git::{AddedLine, DiffSize, GitTracker};
