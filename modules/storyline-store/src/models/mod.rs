pub mod article;
pub mod article_story;
pub mod merge_action;
pub mod story;

pub use article::{Article, IngestOutcome};
pub use article_story::ArticleStory;
pub use merge_action::{MergeAction, NewMergeAction};
pub use story::{EntityCounter, MemberUpdate, NewStory, Story, StoryAggregates};
