pub mod discourse;
pub mod reddit;

pub use discourse::DiscourseSource;
pub use reddit::RedditSource;
