//! Post and clip records, plus the persistence seam.
//!
//! Drafts are what a client submits; records are what the repository
//! returns after persisting. Media are referenced by URL only, and only once
//! the artifact has been committed.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{ModerationError, Result};
use crate::storage::ArtifactHandle;

/// What kind of post this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostKind {
    /// Something happening at a given time.
    Event,
    /// A place worth visiting.
    Discovery,
    /// A challenge other users can take up.
    Challenge,
    /// Plain post.
    Post,
    /// Something for sale.
    Sale,
}

impl PostKind {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Discovery => "discovery",
            Self::Challenge => "challenge",
            Self::Post => "post",
            Self::Sale => "sale",
        }
    }
}

impl fmt::Display for PostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostKind {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "event" => Ok(Self::Event),
            "discovery" => Ok(Self::Discovery),
            "challenge" => Ok(Self::Challenge),
            "post" => Ok(Self::Post),
            "sale" => Ok(Self::Sale),
            other => Err(format!("unknown post type {other:?}")),
        }
    }
}

/// Feed category; `All` when the author did not pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Category {
    /// Concerts, gigs.
    Music,
    /// Restaurants, markets.
    Food,
    /// Exhibitions, street art.
    Art,
    /// Games, runs, matches.
    Sports,
    /// Bars, clubs.
    Nightlife,
    /// Uncategorised.
    #[default]
    All,
}

impl FromStr for Category {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "music" => Ok(Self::Music),
            "food" => Ok(Self::Food),
            "art" => Ok(Self::Art),
            "sports" => Ok(Self::Sports),
            "nightlife" => Ok(Self::Nightlife),
            "all" | "" => Ok(Self::All),
            other => Err(format!("unknown category {other:?}")),
        }
    }
}

/// WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

/// A post as submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct PostDraft {
    /// Required, non-blank.
    pub title: String,
    /// Free text.
    pub description: String,
    /// Post type.
    pub kind: PostKind,
    /// Feed category.
    pub category: Category,
    /// City the post belongs to.
    pub location: String,
    /// Position within the city, if known.
    pub coordinates: Option<Coordinates>,
    /// Hashtags as typed.
    pub hashtags: Vec<String>,
    /// Asking price for `Sale` posts.
    pub price: Option<String>,
}

impl PostDraft {
    /// Draft with a title and type and everything else empty.
    #[must_use]
    pub fn new(title: impl Into<String>, kind: PostKind) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            kind,
            category: Category::All,
            location: String::new(),
            coordinates: None,
            hashtags: Vec::new(),
            price: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the hashtags.
    #[must_use]
    pub fn with_hashtags<I, S>(mut self, hashtags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hashtags = hashtags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the city.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }
}

/// A short video clip as submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipDraft {
    /// Optional caption; goes through the text gate.
    pub caption: String,
    /// Client-reported duration.
    pub duration_seconds: f64,
    /// City the clip belongs to.
    pub location: String,
    /// Position within the city, if known.
    pub coordinates: Option<Coordinates>,
}

/// What the orchestrator hands to [`PostRepository::create_post`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewPost {
    /// Validated, moderated draft.
    pub draft: PostDraft,
    /// Committed image, if any.
    pub image: Option<ArtifactHandle>,
}

/// What the orchestrator hands to [`PostRepository::create_clip`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewClip {
    /// Validated, moderated draft.
    pub draft: ClipDraft,
    /// Committed video.
    pub video: ArtifactHandle,
}

/// A persisted post.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    /// Record id.
    pub id: Uuid,
    /// Title.
    pub title: String,
    /// Description.
    pub description: String,
    /// Post type.
    pub kind: PostKind,
    /// Feed category.
    pub category: Category,
    /// City.
    pub location: String,
    /// Position, if known.
    pub coordinates: Option<Coordinates>,
    /// Hashtags.
    pub hashtags: Vec<String>,
    /// Price, if any.
    pub price: Option<String>,
    /// `/uploads/<handle>` of the image, if any.
    pub image_url: Option<String>,
    /// Creation time.
    pub created_at: SystemTime,
}

/// A persisted clip.
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    /// Record id.
    pub id: Uuid,
    /// Caption.
    pub caption: String,
    /// `/uploads/<handle>` of the video.
    pub video_url: String,
    /// Duration in seconds.
    pub duration_seconds: f64,
    /// City.
    pub location: String,
    /// Position, if known.
    pub coordinates: Option<Coordinates>,
    /// Creation time.
    pub created_at: SystemTime,
}

impl Post {
    /// Builds the record for `new` with a fresh id.
    #[must_use]
    pub fn from_new(new: NewPost) -> Self {
        let NewPost { draft, image } = new;
        Self {
            id: Uuid::new_v4(),
            title: draft.title,
            description: draft.description,
            kind: draft.kind,
            category: draft.category,
            location: draft.location,
            coordinates: draft.coordinates,
            hashtags: draft.hashtags,
            price: draft.price,
            image_url: image.as_ref().map(ArtifactHandle::url),
            created_at: SystemTime::now(),
        }
    }
}

impl Clip {
    /// Builds the record for `new` with a fresh id.
    #[must_use]
    pub fn from_new(new: NewClip) -> Self {
        let NewClip { draft, video } = new;
        Self {
            id: Uuid::new_v4(),
            caption: draft.caption,
            video_url: video.url(),
            duration_seconds: draft.duration_seconds,
            location: draft.location,
            coordinates: draft.coordinates,
            created_at: SystemTime::now(),
        }
    }
}

/// Persists posts and clips.
#[async_trait]
pub trait PostRepository: Send + Sync {
    /// Persists a post.
    ///
    /// # Errors
    ///
    /// [`ModerationError::Persistence`] when the record could not be stored.
    async fn create_post(&self, new: NewPost) -> Result<Post>;

    /// Persists a clip.
    ///
    /// # Errors
    ///
    /// [`ModerationError::Persistence`] when the record could not be stored.
    async fn create_clip(&self, new: NewClip) -> Result<Clip>;
}

#[derive(Debug, Default)]
struct Records {
    posts: Vec<Post>,
    clips: Vec<Clip>,
}

/// In-memory repository, optionally failing every write.
#[derive(Debug, Default)]
pub struct MemoryPostRepository {
    records: Mutex<Records>,
    fail_writes: bool,
}

impl MemoryPostRepository {
    /// Empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository whose writes all fail with [`ModerationError::Persistence`].
    #[must_use]
    pub fn failing() -> Self {
        Self {
            records: Mutex::default(),
            fail_writes: true,
        }
    }

    /// Persisted posts, oldest first.
    #[must_use]
    pub fn posts(&self) -> Vec<Post> {
        self.lock().posts.clone()
    }

    /// Persisted clips, oldest first.
    #[must_use]
    pub fn clips(&self) -> Vec<Clip> {
        self.lock().clips.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes {
            Err(ModerationError::Persistence("repository unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PostRepository for MemoryPostRepository {
    async fn create_post(&self, new: NewPost) -> Result<Post> {
        self.check_writable()?;
        let post = Post::from_new(new);
        self.lock().posts.push(post.clone());
        Ok(post)
    }

    async fn create_clip(&self, new: NewClip) -> Result<Clip> {
        self.check_writable()?;
        let clip = Clip::from_new(new);
        self.lock().clips.push(clip.clone());
        Ok(clip)
    }
}
